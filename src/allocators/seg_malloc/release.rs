//! The release path: coalescing with free neighbours and rebinning.

use tracing::{debug, instrument};

use super::heap::Heap;
use crate::header::{Chunk, PINUSE};

impl Heap {
    /// Releases the chunk whose payload starts at `mem`. A null `mem` is ignored.
    ///
    /// # Safety
    /// `mem` must be null or a payload handed out by this heap and not released since.
    #[instrument(level = "debug", skip(self))]
    pub(super) unsafe fn release(&mut self, mem: *mut u8) {
        if mem.is_null() {
            return;
        }
        let p = Chunk::from_mem(mem);
        debug_assert!(Chunk::cinuse(p), "Releasing a chunk that isn't in use.");
        debug_assert!(!Chunk::is_fencepost(p), "Releasing a fencepost.");
        self.dispose_chunk(p, Chunk::size(p));
    }

    /// Frees the `psize` bytes at `p`, merging them with the free chunks around them,
    /// and bins the result or hands it to top.
    ///
    /// # Safety
    /// `p` must be a chunk marked in use, with a valid `PINUSE` bit, sized `psize`.
    pub(super) unsafe fn dispose_chunk(&mut self, mut p: *mut Chunk, mut psize: usize) {
        let next = Chunk::plus_offset(p, psize);

        if !Chunk::pinuse(p) {
            let prevsize = (*p).prev_foot;
            let prev = Chunk::prev(p);
            self.unlink_chunk(prev, prevsize);
            debug!(chunk = ?p, ?prev, prevsize, "Merged with previous chunk.");
            p = prev;
            psize += prevsize;
        }

        if !Chunk::cinuse(next) {
            if next == self.top {
                self.topsize += psize;
                self.top = p;
                (*p).head = self.topsize | PINUSE;
                debug!(top = ?p, topsize = self.topsize, "Merged into top.");
                return;
            }
            let nsize = Chunk::size(next);
            self.unlink_chunk(next, nsize);
            debug!(chunk = ?p, ?next, nsize, "Merged with next chunk.");
            psize += nsize;
            Chunk::set_size_and_pinuse_of_free_chunk(p, psize);
        } else {
            Chunk::set_free_with_pinuse(p, psize, next);
        }

        self.insert_chunk(p, psize);
    }
}
