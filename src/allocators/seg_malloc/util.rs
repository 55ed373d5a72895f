//! Request sizing specific to the [`SegMalloc`](super::SegMalloc) allocator.

use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::header::{Chunk, CHUNK_ALIGN_MASK, CHUNK_OVERHEAD, MALLOC_ALIGNMENT, MIN_CHUNK_SIZE};
use crate::segment::Segment;

/// Requests below this are served by a [`MIN_CHUNK_SIZE`] chunk.
pub const MIN_REQUEST: usize = MIN_CHUNK_SIZE - CHUNK_OVERHEAD - 1;

/// Requests at or above this can never be satisfied.
pub const MAX_REQUEST: usize = (isize::MAX as usize & !CHUNK_ALIGN_MASK) - 2 * MALLOC_ALIGNMENT;

/// Size of the in-use chunk holding the record of a sealed segment.
pub const SEGMENT_CHUNK_SIZE: usize = pad_request(size_of::<Segment>());

/// Bytes kept free past the top chunk so that the segment can always be sealed
/// with a record chunk and fenceposts.
pub const TOP_FOOT_SIZE: usize = SEGMENT_CHUNK_SIZE + MIN_CHUNK_SIZE;

pub const DEFAULT_GRANULARITY: usize = 64 * 1024;

// The record payload spills into the first fencepost's `prev_foot`, never into its head.
const_assert!(SEGMENT_CHUNK_SIZE - 2 * size_of::<usize>() + CHUNK_OVERHEAD >= size_of::<Segment>());
const_assert!(TOP_FOOT_SIZE % MALLOC_ALIGNMENT == 0);
const_assert!(DEFAULT_GRANULARITY.is_power_of_two());

#[inline(always)]
pub const fn pad_request(req: usize) -> usize {
    (req + CHUNK_OVERHEAD + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK
}

/// Returns the size of the chunk serving a request of `req` bytes
/// or `None` if no chunk could ever serve it.
#[inline]
pub fn request_to_chunk_size(req: usize) -> Option<usize> {
    if req >= MAX_REQUEST {
        None
    } else if req < MIN_REQUEST {
        Some(MIN_CHUNK_SIZE)
    } else {
        Some(pad_request(req))
    }
}

/// Converts a payload pointer to a fat pointer covering the full usable payload.
///
/// # Safety
/// This function is unsafe since it assumes that `mem` is the payload of a chunk in use.
#[inline]
pub unsafe fn to_nonnull_slice(mem: NonNull<u8>) -> NonNull<[u8]> {
    let p = Chunk::from_mem(mem.as_ptr());
    debug_assert!(Chunk::cinuse(p));
    NonNull::slice_from_raw_parts(mem, Chunk::size(p) - CHUNK_OVERHEAD)
}
