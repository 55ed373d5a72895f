//! Resizing and aligned allocation.

use core::alloc::AllocError;
use core::ptr::{copy_nonoverlapping, NonNull};

use tracing::{debug, instrument, Level};

use super::heap::Heap;
use super::util::request_to_chunk_size;
use crate::growers::Grower;
use crate::header::{Chunk, CHUNK_OVERHEAD, MALLOC_ALIGNMENT, MIN_CHUNK_SIZE, PINUSE};

impl Heap {
    /// Resizes the allocation at `mem` to `bytes` bytes, in place if possible.
    /// A null `mem` is a plain allocation.
    ///
    /// On failure the original allocation is left untouched.
    ///
    /// # Safety
    /// `mem` must be null or a live payload of this heap, and `grower` the grower
    /// this heap has been fed from so far.
    #[instrument(level = "debug", skip(self, grower), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub(super) unsafe fn resize<G: Grower + ?Sized>(
        &mut self,
        grower: &mut G,
        mem: *mut u8,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if mem.is_null() {
            return self.allocate(grower, bytes);
        }
        if self.resize_in_place(mem, bytes) {
            return Ok(NonNull::new_unchecked(mem));
        }

        debug!("Couldn't resize in place, moving the allocation.");
        let new_mem = self.allocate(grower, bytes)?;
        let usable = Chunk::size(Chunk::from_mem(mem)) - CHUNK_OVERHEAD;
        copy_nonoverlapping(mem, new_mem.as_ptr(), usable.min(bytes));
        self.release(mem);
        Ok(new_mem)
    }

    /// Tries to make the allocation at `mem` hold exactly `bytes` bytes without moving it.
    /// Shrinking always succeeds. Growing succeeds if the next chunk is top or free and
    /// large enough.
    ///
    /// # Safety
    /// `mem` must be a live payload of this heap.
    pub(super) unsafe fn resize_in_place(&mut self, mem: *mut u8, bytes: usize) -> bool {
        let Some(nb) = request_to_chunk_size(bytes) else {
            return false;
        };
        let p = Chunk::from_mem(mem);
        debug_assert!(Chunk::cinuse(p));
        let oldsize = Chunk::size(p);
        let next = Chunk::plus_offset(p, oldsize);

        if oldsize >= nb {
            let rsize = oldsize - nb;
            if rsize >= MIN_CHUNK_SIZE {
                let r = Chunk::plus_offset(p, nb);
                Chunk::set_inuse(p, nb);
                Chunk::set_inuse(r, rsize);
                self.dispose_chunk(r, rsize);
                debug!(chunk = ?p, nb, rsize, "Shrunk in place.");
            }
            return true;
        }

        if next == self.top {
            let total = oldsize + self.topsize;
            if total <= nb {
                return false;
            }
            let newtop = Chunk::plus_offset(p, nb);
            Chunk::set_inuse(p, nb);
            (*newtop).head = (total - nb) | PINUSE;
            self.top = newtop;
            self.topsize = total - nb;
            debug!(chunk = ?p, nb, topsize = self.topsize, "Grew into top.");
            return true;
        }

        if !Chunk::cinuse(next) {
            let nextsize = Chunk::size(next);
            let total = oldsize + nextsize;
            if total < nb {
                return false;
            }
            self.unlink_chunk(next, nextsize);
            let rsize = total - nb;
            if rsize < MIN_CHUNK_SIZE {
                Chunk::set_inuse(p, total);
            } else {
                let r = Chunk::plus_offset(p, nb);
                Chunk::set_inuse(p, nb);
                Chunk::set_inuse(r, rsize);
                self.dispose_chunk(r, rsize);
            }
            debug!(chunk = ?p, nb, "Grew into next free chunk.");
            return true;
        }

        false
    }

    /// Returns a payload of at least `bytes` bytes aligned to `alignment`.
    ///
    /// Over-allocates, then gives back the slack in front of and behind the aligned chunk.
    ///
    /// # Safety
    /// `alignment` must be a power of two, and `grower` the grower this heap
    /// has been fed from so far.
    #[instrument(level = "debug", skip(self, grower), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub(super) unsafe fn memalign<G: Grower + ?Sized>(
        &mut self,
        grower: &mut G,
        alignment: usize,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(alignment.is_power_of_two());
        if alignment <= MALLOC_ALIGNMENT {
            return self.allocate(grower, bytes);
        }
        let alignment = alignment.max(MIN_CHUNK_SIZE);
        let nb = request_to_chunk_size(bytes).ok_or(AllocError)?;
        let req = nb
            .checked_add(alignment)
            .and_then(|req| req.checked_add(MIN_CHUNK_SIZE - CHUNK_OVERHEAD))
            .ok_or(AllocError)?;

        let mem = self.allocate(grower, req)?.as_ptr();
        let mut p = Chunk::from_mem(mem);

        if mem as usize % alignment != 0 {
            let br = Chunk::from_mem(mem.add(mem.align_offset(alignment)));
            let newp = if br as usize - p as usize >= MIN_CHUNK_SIZE {
                br
            } else {
                Chunk::plus_offset(br, alignment)
            };
            let leadsize = newp as usize - p as usize;
            let newsize = Chunk::size(p) - leadsize;

            Chunk::set_inuse(newp, newsize);
            Chunk::set_inuse(p, leadsize);
            self.dispose_chunk(p, leadsize);
            debug!(lead = ?p, leadsize, "Gave back leading slack.");
            p = newp;
        }

        let size = Chunk::size(p);
        if size > nb + MIN_CHUNK_SIZE {
            let rsize = size - nb;
            let r = Chunk::plus_offset(p, nb);
            Chunk::set_inuse(p, nb);
            Chunk::set_inuse(r, rsize);
            self.dispose_chunk(r, rsize);
            debug!(tail = ?r, rsize, "Gave back trailing slack.");
        }

        debug_assert_eq!(Chunk::to_mem(p) as usize % alignment, 0);
        Ok(NonNull::new_unchecked(Chunk::to_mem(p)))
    }
}
