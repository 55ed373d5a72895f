//! The [`Heap`] context and its growth machinery.

use core::alloc::AllocError;
use core::ptr::{null_mut, NonNull};

use tracing::{debug, error, instrument, Level};

use super::util::{SEGMENT_CHUNK_SIZE, TOP_FOOT_SIZE};
use crate::bins::is_small;
use crate::freelist::SmallBins;
use crate::growers::Grower;
use crate::header::{Chunk, FENCEPOST_HEAD, MALLOC_ALIGNMENT, MIN_CHUNK_SIZE, PINUSE, WORD};
use crate::segment::Segment;
use crate::tree::{TreeBins, TreeChunk};
use crate::util::align_up;

/// Everything the allocator knows about its memory.
///
/// Until the first growth there is no top chunk and `seg` is empty. Afterwards `top` always
/// lies in `seg` (the newest segment) and is followed by exactly [`TOP_FOOT_SIZE`] bytes of
/// trailer reaching to the end of the segment.
#[derive(Debug)]
pub(super) struct Heap {
    pub(super) small: SmallBins,
    pub(super) tree: TreeBins,
    pub(super) top: *mut Chunk,
    pub(super) topsize: usize,
    pub(super) seg: Segment,
    pub(super) footprint: usize,
    pub(super) max_footprint: usize,
    pub(super) granularity: usize,
    /// Smallest chunk size the grower refused to make room for.
    pub(super) growth_floor: usize,
}

impl Heap {
    pub(super) const fn new(granularity: usize) -> Self {
        Heap {
            small: SmallBins::new(),
            tree: TreeBins::new(),
            top: null_mut(),
            topsize: 0,
            seg: Segment::empty(),
            footprint: 0,
            max_footprint: 0,
            granularity,
            growth_floor: usize::MAX,
        }
    }

    #[inline(always)]
    pub(super) fn has_top(&self) -> bool {
        !self.top.is_null()
    }

    /// Puts the free chunk `p` of `size` bytes into its bin.
    ///
    /// # Safety
    /// `p` must be a free chunk with valid boundary tags, not currently binned.
    #[inline]
    pub(super) unsafe fn insert_chunk(&mut self, p: *mut Chunk, size: usize) {
        if is_small(size) {
            self.small.insert(p, size);
        } else {
            self.tree.insert(p.cast::<TreeChunk>(), size);
        }
    }

    /// Takes the free chunk `p` of `size` bytes out of its bin.
    ///
    /// # Safety
    /// `p` must be binned.
    #[inline]
    pub(super) unsafe fn unlink_chunk(&mut self, p: *mut Chunk, size: usize) {
        if is_small(size) {
            self.small.unlink(p, size);
        } else {
            self.tree.unlink(p.cast::<TreeChunk>());
        }
    }

    /// Makes `p` the top chunk with `size` bytes, writing the trailer right behind it.
    ///
    /// # Safety
    /// `[p, p + size + TOP_FOOT_SIZE)` must be owned by the heap and hold no live chunks.
    pub(super) unsafe fn init_top(&mut self, p: *mut Chunk, size: usize) {
        self.top = p;
        self.topsize = size;
        (*p).head = size | PINUSE;
        (*Chunk::plus_offset(p, size)).head = TOP_FOOT_SIZE;
    }

    /// Carves a chunk of `nb` bytes off the front of the top chunk.
    ///
    /// # Safety
    /// There must be a top chunk and `nb < self.topsize`.
    pub(super) unsafe fn allocate_from_top(&mut self, nb: usize) -> NonNull<u8> {
        debug_assert!(nb < self.topsize);
        let p = self.top;
        let rsize = self.topsize - nb;
        let r = Chunk::plus_offset(p, nb);
        self.top = r;
        self.topsize = rsize;
        (*r).head = rsize | PINUSE;
        Chunk::set_size_and_pinuse_of_inuse_chunk(p, nb);
        debug!(chunk = ?p, nb, topsize = rsize, "Carved chunk from top.");
        NonNull::new_unchecked(Chunk::to_mem(p))
    }

    /// Asks the grower for room for a chunk of `nb` bytes and serves the chunk from the new top.
    ///
    /// The heap is left untouched if the grower refuses. Once it has refused,
    /// requests of at least the same size fail without asking it again.
    ///
    /// # Safety
    /// `grower` must be the grower this heap has been fed from so far.
    #[instrument(level = "debug", skip(self, grower), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub(super) unsafe fn sys_alloc<G: Grower + ?Sized>(
        &mut self,
        grower: &mut G,
        nb: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if nb >= self.growth_floor {
            debug!(growth_floor = self.growth_floor, "Growth known to fail, skipping grower.");
            return Err(AllocError);
        }

        let asize = nb
            .checked_add(TOP_FOOT_SIZE + MALLOC_ALIGNMENT)
            .and_then(|size| align_up(size, self.granularity))
            .ok_or(AllocError)?;

        let (base, got) = match grower.grow(asize) {
            Ok(extent) => extent,
            Err(AllocError) => {
                error!(nb, asize, "Growth failure, grower refused to provide memory.");
                self.growth_floor = self.growth_floor.min(nb);
                return Err(AllocError);
            }
        };
        let base = base.as_ptr();
        debug_assert!(got >= asize, "Grower returned a short extent.");
        debug_assert_eq!(base as usize % MALLOC_ALIGNMENT, 0);
        debug_assert_eq!(got % MALLOC_ALIGNMENT, 0);

        self.footprint += got;
        self.max_footprint = self.max_footprint.max(self.footprint);

        if !self.has_top() {
            debug!(?base, got, "Initial extent.");
            self.seg = Segment { base, size: got, next: null_mut() };
            self.init_top(base.cast(), got - TOP_FOOT_SIZE);
        } else if base == self.seg.end() {
            debug!(?base, got, "Extent is contiguous, extending top.");
            self.seg.size += got;
            self.init_top(self.top, self.topsize + got);
        } else {
            debug!(?base, got, "Extent is disjoint, sealing the current segment.");
            self.add_segment(base, got);
        }

        Ok(self.allocate_from_top(nb))
    }

    /// Seals the current segment and makes the extent `[base, base + size)` the new
    /// head segment, with all of it (but the trailer) as top.
    ///
    /// The old top is replaced by the record chunk of the old segment followed by fenceposts.
    /// Whatever part of it precedes the record becomes an ordinary free chunk.
    ///
    /// # Safety
    /// The extent must be fresh memory of at least [`TOP_FOOT_SIZE`] + [`MIN_CHUNK_SIZE`]
    /// bytes, disjoint from every segment.
    unsafe fn add_segment(&mut self, base: *mut u8, size: usize) {
        let old_top = self.top.cast::<u8>();
        let old_end = self.seg.end();
        let asp = old_end.sub(TOP_FOOT_SIZE);
        let csp = if asp < old_top.add(MIN_CHUNK_SIZE) { old_top } else { asp };
        let sp: *mut Chunk = csp.cast();
        let record: *mut Segment = Chunk::to_mem(sp).cast();

        self.init_top(base.cast(), size - TOP_FOOT_SIZE);

        Chunk::set_size_and_pinuse_of_inuse_chunk(sp, SEGMENT_CHUNK_SIZE);
        record.write(self.seg);
        self.seg = Segment { base, size, next: record };

        let mut p = Chunk::plus_offset(sp, SEGMENT_CHUNK_SIZE);
        let mut fenceposts = 0;
        loop {
            (*p).head = FENCEPOST_HEAD;
            fenceposts += 1;
            let next = Chunk::plus_offset(p, WORD);
            if (next as *mut u8).add(WORD) < old_end {
                p = next;
            } else {
                break;
            }
        }
        debug!(record = ?sp, fenceposts, "Sealed segment.");

        if csp != old_top {
            let q: *mut Chunk = old_top.cast();
            let psize = csp as usize - old_top as usize;
            Chunk::set_free_with_pinuse(q, psize, sp);
            self.insert_chunk(q, psize);
            debug!(chunk = ?q, size = psize, "Binned the old top.");
        }
    }
}
