//! The [`SegMalloc`] allocator and the types it reports with.

pub mod seg_malloc;

pub use seg_malloc::{HeapCorruption, SegMalloc, Stats};
