//! A dlmalloc-style segregated-fit memory allocator written in Rust.
//!
//! The allocator manages memory handed to it by a [grower](#growers) and serves `malloc`,
//! `free`, `realloc` and `memalign` style requests with low fragmentation and predictable,
//! mostly constant-time operations. It can be used through its own methods, as an
//! [`Allocator`] for collections, or as a [`GlobalAlloc`].
//!
//! # Usage
//! ```no_run
//! #![feature(allocator_api)]
//! use seg_malloc::growers::ArenaGrower;
//! use seg_malloc::SegMalloc;
//!
//! let mut buf = vec![0u64; 1 << 16];
//! let grower = ArenaGrower::new(buf.as_mut_ptr().cast(), buf.len() * 8, 0);
//! let allocator = unsafe { SegMalloc::with_grower(grower) };
//!
//! let mut v: Vec<u32, _> = Vec::new_in(&allocator);
//! v.extend([1, 2, 3]);
//!
//! let p = allocator.malloc(100).unwrap();
//! unsafe { allocator.free(p.as_ptr()) };
//! drop(v);
//! assert_eq!(allocator.check().unwrap().in_use, 0);
//! ```
//!
//! [`SegMalloc`] is single-threaded: it is not `Sync`, and so it can't back a
//! `#[global_allocator]` static on its own. Wrap it in your own lock if you need that.
//!
//! # Mode of operation
//! The heap is a sequence of [chunks](#chunks). Free chunks are kept in [bins](#bins)
//! sorted by size, and the memory that hasn't been carved up yet forms the [top chunk](#top).
//! - An allocation request is first turned into a chunk size. Small sizes are looked up in
//!   the small bin of exactly that size, then the next one, then any larger bin. Large sizes
//!   go to the tree bins, which find the best (smallest sufficient) fit. Oversized chunks
//!   are split and the remainder is binned again.
//! - If no bin can serve the request it is carved off the top chunk.
//! - If the top chunk is too small too, the allocator asks its grower for more memory.
//!   A new extent adjacent to the current one simply extends top, a disjoint one starts
//!   a new [segment](#segments).
//! - On release a chunk is merged with its free neighbours right away, and the result
//!   is either binned or absorbed into top.
//!
//! ## Chunks
//! Every chunk starts with two words: the size of the previous chunk (only meaningful while
//! that chunk is free) and the chunk's own size with two status bits, whether this chunk is in
//! use and whether the previous one is. The payload follows right after the header. Free chunks
//! store their size again at the end, as the next chunk's first word, so the neighbours of any
//! chunk can be found in constant time. This is the classic boundary-tag layout.
//!
//! ## Bins
//! There are 32 small bins, each a ring of free chunks of one exact size (in steps of 8 bytes),
//! and 32 tree bins covering ranges of sizes that double every two bins. Every tree bin is a
//! bitwise trie keyed on chunk size; chunks of equal size hang off the same trie node.
//! A bitmap per bin family records which bins are non-empty, so the next non-empty
//! larger bin is a single bit scan away.
//!
//! ## Top
//! The top chunk is the free space at the end of the most recent segment. It is never binned and
//! is followed by a small reserved trailer, so carving from it never touches memory outside the
//! segment.
//!
//! ## Segments
//! A segment is a maximal contiguous region obtained from the grower. When the grower hands out
//! memory that does not continue the current segment, the old segment is sealed: its top chunk
//! is binned and a record describing the segment is placed at its end, followed by fenceposts
//! that stop coalescing from running past it.
//!
//! ## Growers
//! A grower is the allocator's memory source. [`SegMalloc`] is generic over its grower,
//! so anything that implements [`Grower`] can back it. Two are provided:
//! [`BrkGrower`] moves the program break, and [`ArenaGrower`] carves a caller-provided buffer.
//! When a grower refuses a request, the allocator stops asking it for that size or more until
//! [`forget_growth_failure`](SegMalloc::forget_growth_failure) is called.
//!
//! # Debugging
//! [`SegMalloc::check`] walks the whole heap and verifies every invariant the allocator
//! relies on. With the `heap-checks` feature enabled, debug builds run it after every
//! operation. The allocator emits [`tracing`] events and spans, which the tests print when
//! `SEG_MALLOC_LOG` holds an `EnvFilter` directive.
//!
//! [`Allocator`]: core::alloc::Allocator
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc
//! [`Grower`]: growers::Grower
//! [`BrkGrower`]: growers::BrkGrower
//! [`ArenaGrower`]: growers::ArenaGrower
#![feature(allocator_api)]

pub use crate::allocators::{HeapCorruption, SegMalloc, Stats};

pub mod allocators;
mod bins;
mod freelist;
pub mod growers;
mod header;
mod segment;
mod tree;
mod util;
