//! The allocation path.
//!
//! A request is served by the first of these that succeeds:
//! 1. the exact small bin, or the one right above it (the leftover would be too small to split);
//! 2. any larger small bin, splitting off the remainder;
//! 3. the tree bins, best fit, splitting off the remainder;
//! 4. the top chunk;
//! 5. growing the heap.

use core::alloc::AllocError;
use core::ptr::NonNull;

use tracing::{debug, instrument, Level};

use super::heap::Heap;
use super::util::request_to_chunk_size;
use crate::bins::{small_index, small_index2size, MAX_SMALL_REQUEST};
use crate::growers::Grower;
use crate::header::{Chunk, MIN_CHUNK_SIZE};
use crate::tree::TreeChunk;

impl Heap {
    /// Returns the payload of a fresh chunk able to hold `bytes` bytes.
    ///
    /// # Safety
    /// `grower` must be the grower this heap has been fed from so far.
    #[instrument(level = "debug", skip(self, grower), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub(super) unsafe fn allocate<G: Grower + ?Sized>(
        &mut self,
        grower: &mut G,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let nb = request_to_chunk_size(bytes).ok_or(AllocError)?;

        let binned = if bytes <= MAX_SMALL_REQUEST {
            self.allocate_small(nb)
        } else if self.tree.map().is_empty() {
            None
        } else {
            self.allocate_large(nb)
        };
        if let Some(mem) = binned {
            return Ok(mem);
        }

        if nb < self.topsize {
            return Ok(self.allocate_from_top(nb));
        }
        self.sys_alloc(grower, nb)
    }

    /// Serves a small chunk size from the bins.
    unsafe fn allocate_small(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let idx = small_index(nb);
        let bits = self.small.map().bits();

        if (bits >> idx) & 0b11 != 0 {
            // Exact fit, or 8 bytes too much.
            let i = idx + (!(bits >> idx) & 1);
            let p = self.small.pop(i);
            let size = small_index2size(i);
            Chunk::set_inuse_and_pinuse(p, size);
            debug!(chunk = ?p, size, "Small bin hit.");
            return Some(NonNull::new_unchecked(Chunk::to_mem(p)));
        }

        if let Some(i) = self.small.map().first_above(idx) {
            let p = self.small.pop(i);
            debug!(chunk = ?p, bin = i, "Larger small bin hit.");
            return Some(self.carve(p, small_index2size(i), nb));
        }

        let t = self.tree.smallest()?.as_ptr();
        self.tree.unlink(t);
        let p = TreeChunk::as_chunk(t);
        debug!(chunk = ?p, "Small request served from a tree bin.");
        Some(self.carve(p, Chunk::size(p), nb))
    }

    /// Serves a large chunk size from the tree bins.
    unsafe fn allocate_large(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let t = self.tree.best_fit(nb)?.as_ptr();
        self.tree.unlink(t);
        let p = TreeChunk::as_chunk(t);
        debug!(chunk = ?p, size = Chunk::size(p), "Tree bin best fit.");
        Some(self.carve(p, Chunk::size(p), nb))
    }

    /// Hands out the first `nb` bytes of the unbinned free chunk `p` of `size` bytes.
    /// The rest is binned if it can stand on its own, and handed out too otherwise.
    ///
    /// # Safety
    /// `p` must be free, unbinned, and `size >= nb`.
    pub(super) unsafe fn carve(&mut self, p: *mut Chunk, size: usize, nb: usize) -> NonNull<u8> {
        debug_assert!(size >= nb);
        let rsize = size - nb;
        if rsize < MIN_CHUNK_SIZE {
            Chunk::set_inuse_and_pinuse(p, size);
        } else {
            Chunk::set_size_and_pinuse_of_inuse_chunk(p, nb);
            let r = Chunk::plus_offset(p, nb);
            Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
            self.insert_chunk(r, rsize);
            debug!(remainder = ?r, rsize, "Split off remainder.");
        }
        NonNull::new_unchecked(Chunk::to_mem(p))
    }
}
