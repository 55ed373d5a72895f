//! Heap statistics and the consistency checker.

use core::fmt;
use core::ptr::null_mut;

use super::heap::Heap;
use super::util::TOP_FOOT_SIZE;
use crate::bins::{
    is_small, min_size_for_tree_index, small_index, MIN_LARGE_SIZE, NSMALLBINS, NTREEBINS,
};
use crate::header::{Chunk, ChunkKind, MALLOC_ALIGNMENT, MIN_CHUNK_SIZE};
use crate::segment::Segment;
use crate::tree::TreeChunk;

/// A snapshot of the heap, gathered by walking every segment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the grower.
    pub footprint: usize,
    /// Highest `footprint` seen so far.
    pub max_footprint: usize,
    /// Bytes the grower reports as handed out.
    pub provided: usize,
    /// Bytes in chunks currently handed out, overhead included.
    pub in_use: usize,
    pub in_use_chunks: usize,
    /// Bytes in binned free chunks.
    pub free: usize,
    /// Number of binned free chunks.
    pub free_chunks: usize,
    pub top_size: usize,
    pub segments: usize,
}

/// An inconsistency found by [`SegMalloc::check`](super::SegMalloc::check).
/// Addresses are those of the offending chunk headers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapCorruption {
    Misaligned { chunk: usize },
    BadSize { chunk: usize, size: usize },
    OutsideSegment { chunk: usize },
    PinuseMismatch { chunk: usize },
    AdjacentFree { chunk: usize },
    FooterMismatch { chunk: usize },
    NotBinned { chunk: usize },
    WrongBin { chunk: usize, size: usize },
    BinmapMismatch { tree: bool, bin: u32 },
    BadLinks { chunk: usize },
    BinnedCount { binned: usize, walked: usize },
    TopMismatch,
    FootprintMismatch { footprint: usize, segments: usize },
}

impl fmt::Display for HeapCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapCorruption::Misaligned { chunk } => write!(f, "chunk {chunk:#x} is misaligned"),
            HeapCorruption::BadSize { chunk, size } => {
                write!(f, "chunk {chunk:#x} has invalid size {size}")
            }
            HeapCorruption::OutsideSegment { chunk } => {
                write!(f, "chunk {chunk:#x} crosses the end of its segment")
            }
            HeapCorruption::PinuseMismatch { chunk } => write!(
                f,
                "PINUSE of chunk {chunk:#x} disagrees with the state of its predecessor"
            ),
            HeapCorruption::AdjacentFree { chunk } => {
                write!(f, "free chunk {chunk:#x} follows another free chunk")
            }
            HeapCorruption::FooterMismatch { chunk } => {
                write!(f, "footer of free chunk {chunk:#x} doesn't match its size")
            }
            HeapCorruption::NotBinned { chunk } => {
                write!(f, "free chunk {chunk:#x} is not in its bin")
            }
            HeapCorruption::WrongBin { chunk, size } => {
                write!(f, "binned chunk {chunk:#x} of size {size} is in use or in the wrong bin")
            }
            HeapCorruption::BinmapMismatch { tree, bin } => write!(
                f,
                "occupancy bit of {} bin {bin} disagrees with its contents",
                if tree { "tree" } else { "small" }
            ),
            HeapCorruption::BadLinks { chunk } => {
                write!(f, "bin links of chunk {chunk:#x} are inconsistent")
            }
            HeapCorruption::BinnedCount { binned, walked } => write!(
                f,
                "{binned} chunks are binned but the heap walk found {walked} free chunks"
            ),
            HeapCorruption::TopMismatch => write!(f, "top chunk doesn't end at its trailer"),
            HeapCorruption::FootprintMismatch { footprint, segments } => write!(
                f,
                "footprint is {footprint} bytes but the segments span {segments} bytes"
            ),
        }
    }
}

impl std::error::Error for HeapCorruption {}

#[inline(always)]
fn addr<T>(p: *const T) -> usize {
    p as usize
}

impl Heap {
    /// Tells what `p` is. `record` is the record describing the segment `p` lies in.
    unsafe fn kind_of(&self, p: *mut Chunk, record: *mut Segment) -> ChunkKind {
        if p == self.top {
            ChunkKind::Top
        } else if Chunk::is_fencepost(p) {
            ChunkKind::Fencepost
        } else if Chunk::cinuse(p) {
            if Chunk::to_mem(p).cast::<Segment>() == record {
                ChunkKind::SegmentRecord
            } else {
                ChunkKind::InUse
            }
        } else if is_small(Chunk::size(p)) {
            ChunkKind::Small
        } else {
            ChunkKind::Tree
        }
    }

    /// Calls `f` on every chunk, segment by segment from the newest, each walk ending
    /// at top or at the first fencepost.
    ///
    /// # Safety
    /// Chunk sizes must be trustworthy enough to step from one chunk to the next.
    /// `f` is expected to reject a chunk before the walk would step past its segment.
    unsafe fn walk(
        &self,
        mut f: impl FnMut(&Segment, *mut Chunk, ChunkKind) -> Result<(), HeapCorruption>,
    ) -> Result<(), HeapCorruption> {
        if !self.has_top() {
            return Ok(());
        }
        let mut seg = self.seg;
        let mut record: *mut Segment = null_mut();
        loop {
            let mut p: *mut Chunk = seg.base.cast();
            loop {
                let kind = self.kind_of(p, record);
                f(&seg, p, kind)?;
                if matches!(kind, ChunkKind::Top | ChunkKind::Fencepost) {
                    break;
                }
                p = Chunk::next(p);
            }
            if seg.next.is_null() {
                return Ok(());
            }
            record = seg.next;
            seg = *record;
        }
    }

    /// Gathers statistics without validating anything.
    ///
    /// # Safety
    /// The heap must be consistent.
    pub(super) unsafe fn stats(&self) -> Stats {
        let mut stats = Stats {
            footprint: self.footprint,
            max_footprint: self.max_footprint,
            top_size: self.topsize,
            ..Stats::default()
        };
        let mut last_base = null_mut();
        let _ = self.walk(|seg, p, kind| {
            if seg.base != last_base {
                last_base = seg.base;
                stats.segments += 1;
            }
            let size = Chunk::size(p);
            match kind {
                ChunkKind::InUse => {
                    stats.in_use += size;
                    stats.in_use_chunks += 1;
                }
                ChunkKind::Small | ChunkKind::Tree => {
                    stats.free += size;
                    stats.free_chunks += 1;
                }
                ChunkKind::Top | ChunkKind::Fencepost | ChunkKind::SegmentRecord => {}
            }
            Ok(())
        });
        stats
    }

    /// Walks the whole heap and cross-checks it against the bins and counters.
    ///
    /// # Safety
    /// The heap must not be corrupted badly enough to make the walk leave its memory:
    /// chunk sizes are checked against segment bounds before they are followed, but a
    /// broken segment list or bin link is followed as is.
    pub(super) unsafe fn check(&self) -> Result<Stats, HeapCorruption> {
        let mut walked_free = 0;
        let mut seen_top = false;
        let mut span = 0;
        let mut last_base = null_mut();
        let mut prev_free = false;

        self.walk(|seg, p, kind| {
            let chunk = addr(p);
            if seg.base != last_base {
                last_base = seg.base;
                span += seg.size;
                prev_free = false;
            }
            if kind == ChunkKind::Fencepost {
                return Ok(());
            }
            if chunk % MALLOC_ALIGNMENT != 0 {
                return Err(HeapCorruption::Misaligned { chunk });
            }
            if Chunk::pinuse(p) == prev_free {
                return Err(HeapCorruption::PinuseMismatch { chunk });
            }

            let size = Chunk::size(p);
            if kind == ChunkKind::Top {
                seen_top = true;
                if prev_free {
                    return Err(HeapCorruption::AdjacentFree { chunk });
                }
                if size != self.topsize
                    || seg.base != self.seg.base
                    || chunk + size + TOP_FOOT_SIZE != addr(seg.end())
                {
                    return Err(HeapCorruption::TopMismatch);
                }
                return Ok(());
            }

            if size < MIN_CHUNK_SIZE || size % MALLOC_ALIGNMENT != 0 {
                return Err(HeapCorruption::BadSize { chunk, size });
            }
            if !seg.holds(Chunk::next(p).cast::<u8>()) {
                return Err(HeapCorruption::OutsideSegment { chunk });
            }

            match kind {
                ChunkKind::Small | ChunkKind::Tree => {
                    if prev_free {
                        return Err(HeapCorruption::AdjacentFree { chunk });
                    }
                    if (*Chunk::next(p)).prev_foot != size {
                        return Err(HeapCorruption::FooterMismatch { chunk });
                    }
                    let binned = if kind == ChunkKind::Small {
                        self.small.contains(p, size)
                    } else {
                        self.tree.contains(p.cast(), size)
                    };
                    if !binned {
                        return Err(HeapCorruption::NotBinned { chunk });
                    }
                    walked_free += 1;
                    prev_free = true;
                }
                _ => prev_free = false,
            }
            Ok(())
        })?;

        if !seen_top && self.has_top() {
            return Err(HeapCorruption::TopMismatch);
        }
        if span != self.footprint || self.footprint > self.max_footprint {
            return Err(HeapCorruption::FootprintMismatch {
                footprint: self.footprint,
                segments: span,
            });
        }

        let binned = self.check_small_bins()? + self.check_tree_bins()?;
        if binned != walked_free {
            return Err(HeapCorruption::BinnedCount { binned, walked: walked_free });
        }

        Ok(self.stats())
    }

    /// Validates the small bins and returns how many chunks they hold.
    unsafe fn check_small_bins(&self) -> Result<usize, HeapCorruption> {
        let mut count = 0;
        for bin in 0..NSMALLBINS as u32 {
            if self.small.map().is_marked(bin) != self.small.head(bin).is_some() {
                return Err(HeapCorruption::BinmapMismatch { tree: false, bin });
            }
            for p in self.small.iter(bin) {
                let size = Chunk::size(p);
                if Chunk::cinuse(p) || small_index(size) != bin {
                    return Err(HeapCorruption::WrongBin { chunk: addr(p), size });
                }
                if (*(*p).next).prev != p {
                    return Err(HeapCorruption::BadLinks { chunk: addr(p) });
                }
                count += 1;
            }
        }
        Ok(count)
    }

    /// Validates the tree bins and returns how many chunks they hold.
    unsafe fn check_tree_bins(&self) -> Result<usize, HeapCorruption> {
        let mut count = 0;
        for bin in 0..NTREEBINS as u32 {
            let root = self.tree.root(bin);
            if self.tree.map().is_marked(bin) != root.is_some() {
                return Err(HeapCorruption::BinmapMismatch { tree: true, bin });
            }
            if let Some(root) = root {
                if !(*root.as_ptr()).parent.is_null() {
                    return Err(HeapCorruption::BadLinks { chunk: addr(root.as_ptr()) });
                }
            }

            let lower = min_size_for_tree_index(bin).max(MIN_LARGE_SIZE);
            let upper = if bin as usize == NTREEBINS - 1 {
                usize::MAX
            } else {
                min_size_for_tree_index(bin + 1)
            };
            let mut result = Ok(());
            self.tree.for_each(bin, |t| {
                if result.is_err() {
                    return;
                }
                let p = TreeChunk::as_chunk(t);
                let size = Chunk::size(p);
                if Chunk::cinuse(p) || size < lower || size >= upper {
                    result = Err(HeapCorruption::WrongBin { chunk: addr(p), size });
                } else if (*t).in_tree && !tree_links_agree(t, bin) {
                    result = Err(HeapCorruption::BadLinks { chunk: addr(p) });
                }
                count += 1;
            });
            result?;
        }
        Ok(count)
    }
}

/// Checks that a trie node points back at its children and that all of them belong to `bin`.
unsafe fn tree_links_agree(t: *mut TreeChunk, bin: u32) -> bool {
    if (*t).index != bin {
        return false;
    }
    let parent = (*t).parent;
    if !parent.is_null() && (*parent).child[0] != t && (*parent).child[1] != t {
        return false;
    }
    (*t).child
        .iter()
        .all(|&c| c.is_null() || ((*c).parent == t && (*c).in_tree && (*c).index == bin))
}
