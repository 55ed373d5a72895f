//! Defines the [`Chunk`] header and the boundary-tag accessors built on top of it.
//!
//! Every block of memory managed by the allocator is a chunk:
//!
//! ```text
//!     chunk -> +-----------------------------------------------+
//!              | prev_foot: size of previous chunk (if free)   |
//!              +-----------------------------------------------+
//!              | head: size of this chunk | CINUSE | PINUSE    |
//!       mem -> +-----------------------------------------------+
//!              | payload (in use) or bin links (free) ...      |
//!              .                                               .
//! next chunk ->+-----------------------------------------------+
//!              | prev_foot: payload if in use / size if free   |
//! ```
//!
//! An in-use chunk may use the `prev_foot` word of its successor, so the per-allocation
//! overhead is a single word.

use core::mem::size_of;

use static_assertions::const_assert;

pub const WORD: usize = size_of::<usize>();

pub const MALLOC_ALIGNMENT: usize = 8;
pub const CHUNK_ALIGN_MASK: usize = MALLOC_ALIGNMENT - 1;
pub const CHUNK_OVERHEAD: usize = WORD;

/// Smallest chunk that can hold the links of a free list node.
pub const MIN_CHUNK_SIZE: usize = (size_of::<Chunk>() + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK;

/// The previous physical chunk is in use.
pub const PINUSE: usize = 1;
/// This chunk is in use.
pub const CINUSE: usize = 2;
pub const INUSE: usize = PINUSE | CINUSE;
pub const FLAG_BITS: usize = 7;

/// Head of the fake chunks sealing the end of an extent.
pub const FENCEPOST_HEAD: usize = INUSE | WORD;

// The two flag bits live below the alignment.
const_assert!(MALLOC_ALIGNMENT > INUSE);
const_assert!(MALLOC_ALIGNMENT.is_power_of_two());
// `mem` must be aligned whenever the chunk is.
const_assert!((2 * WORD) % MALLOC_ALIGNMENT == 0);

#[derive(Debug)]
#[repr(C)]
pub struct Chunk {
    pub prev_foot: usize,
    pub head: usize,
    pub next: *mut Chunk,
    pub prev: *mut Chunk,
}

/// What a chunk is, as seen by a heap walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    InUse,
    /// Free and stored in a small bin.
    Small,
    /// Free and stored in a tree bin.
    Tree,
    Top,
    /// The in-use chunk holding the record of a sealed segment.
    SegmentRecord,
    Fencepost,
}

// All accessors operate on raw chunk pointers. Callers guarantee that the pointer
// designates a chunk header inside the managed heap.
impl Chunk {
    #[inline(always)]
    pub unsafe fn size(p: *const Chunk) -> usize {
        (*p).head & !FLAG_BITS
    }

    #[inline(always)]
    pub unsafe fn pinuse(p: *const Chunk) -> bool {
        (*p).head & PINUSE != 0
    }

    #[inline(always)]
    pub unsafe fn cinuse(p: *const Chunk) -> bool {
        (*p).head & CINUSE != 0
    }

    #[inline(always)]
    pub unsafe fn is_fencepost(p: *const Chunk) -> bool {
        (*p).head == FENCEPOST_HEAD
    }

    #[inline(always)]
    pub unsafe fn plus_offset(p: *mut Chunk, offset: usize) -> *mut Chunk {
        p.cast::<u8>().add(offset).cast()
    }

    #[inline(always)]
    pub unsafe fn minus_offset(p: *mut Chunk, offset: usize) -> *mut Chunk {
        p.cast::<u8>().sub(offset).cast()
    }

    /// The physically next chunk.
    #[inline(always)]
    pub unsafe fn next(p: *mut Chunk) -> *mut Chunk {
        Chunk::plus_offset(p, Chunk::size(p))
    }

    /// The physically previous chunk. Only meaningful when `p`'s `PINUSE` is clear.
    #[inline(always)]
    pub unsafe fn prev(p: *mut Chunk) -> *mut Chunk {
        Chunk::minus_offset(p, (*p).prev_foot)
    }

    #[inline(always)]
    pub unsafe fn to_mem(p: *mut Chunk) -> *mut u8 {
        p.cast::<u8>().add(2 * WORD)
    }

    #[inline(always)]
    pub unsafe fn from_mem(mem: *mut u8) -> *mut Chunk {
        mem.sub(2 * WORD).cast()
    }

    /// Marks `p` in use with size `size`, keeping its `PINUSE` bit,
    /// and tells the successor that `p` is in use.
    #[inline]
    pub unsafe fn set_inuse(p: *mut Chunk, size: usize) {
        (*p).head = ((*p).head & PINUSE) | size | CINUSE;
        (*Chunk::plus_offset(p, size)).head |= PINUSE;
    }

    #[inline]
    pub unsafe fn set_inuse_and_pinuse(p: *mut Chunk, size: usize) {
        (*p).head = size | INUSE;
        (*Chunk::plus_offset(p, size)).head |= PINUSE;
    }

    /// Like [`set_inuse_and_pinuse`](Chunk::set_inuse_and_pinuse) but leaves the successor alone.
    #[inline]
    pub unsafe fn set_size_and_pinuse_of_inuse_chunk(p: *mut Chunk, size: usize) {
        (*p).head = size | INUSE;
    }

    #[inline]
    pub unsafe fn set_size_and_pinuse_of_free_chunk(p: *mut Chunk, size: usize) {
        (*p).head = size | PINUSE;
        Chunk::set_foot(p, size);
    }

    /// Writes the boundary tag of a free chunk into its successor's `prev_foot`.
    #[inline]
    pub unsafe fn set_foot(p: *mut Chunk, size: usize) {
        (*Chunk::plus_offset(p, size)).prev_foot = size;
    }

    #[inline]
    pub unsafe fn clear_pinuse(p: *mut Chunk) {
        (*p).head &= !PINUSE;
    }

    /// Turns `p` into a free chunk of `size` bytes followed by `next`.
    #[inline]
    pub unsafe fn set_free_with_pinuse(p: *mut Chunk, size: usize, next: *mut Chunk) {
        Chunk::clear_pinuse(next);
        Chunk::set_size_and_pinuse_of_free_chunk(p, size);
    }
}
