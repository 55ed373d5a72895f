use crate::bins::MAX_SMALL_REQUEST;
use crate::growers::ArenaGrower;
use crate::header::{CINUSE, MIN_CHUNK_SIZE, PINUSE, WORD};

use self::format::init_logging;

use super::util::{request_to_chunk_size, TOP_FOOT_SIZE};
use super::*;

use std::cell::Cell;


const ARENA_SIZE: usize = 256 * 1024;
const GRANULARITY: usize = 4096;

/// 8-aligned backing memory for an [`ArenaGrower`].
fn buffer(size: usize) -> Vec<u64> {
    vec![0; size / 8]
}

fn arena(buf: &mut [u64]) -> ArenaGrower {
    ArenaGrower::new(buf.as_mut_ptr().cast(), buf.len() * 8, 0)
}

fn chunk_size(req: usize) -> usize {
    request_to_chunk_size(req).unwrap()
}

/// Counts the calls made to the wrapped grower.
struct CountingGrower<'a, G: Grower> {
    inner: G,
    calls: &'a Cell<usize>,
}

unsafe impl<G: Grower> Grower for CountingGrower<'_, G> {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        self.calls.set(self.calls.get() + 1);
        self.inner.grow(size)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

/// Leaves a hole in front of every extent but the first, so no two extents touch.
struct GappedGrower {
    inner: ArenaGrower,
    gap: usize,
    started: bool,
}

unsafe impl Grower for GappedGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        if self.started {
            self.inner.grow(self.gap)?;
        }
        self.started = true;
        self.inner.grow(size)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

fn distance(from: NonNull<u8>, to: NonNull<u8>) -> usize {
    to.as_ptr() as usize - from.as_ptr() as usize
}

#[test]
fn test_1() {
    init_logging();
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let a = allocator.malloc(16).unwrap();
    let b = allocator.malloc(32).unwrap();
    let c = allocator.malloc(64).unwrap();

    for p in [a, b, c] {
        assert_eq!(p.as_ptr() as usize % MALLOC_ALIGNMENT, 0);
    }
    // Carved from top back to back.
    assert_eq!(distance(a, b), chunk_size(16));
    assert_eq!(distance(b, c), chunk_size(32));
    unsafe {
        assert!(allocator.usable_size(a.as_ptr()) >= 16);
        assert!(allocator.usable_size(b.as_ptr()) >= 32);
        assert!(allocator.usable_size(c.as_ptr()) >= 64);

        allocator.free(b.as_ptr());
        assert_eq!(allocator.check().unwrap().free_chunks, 1);
        assert_eq!(allocator.malloc(32).unwrap(), b);
        assert_eq!(allocator.check().unwrap().free_chunks, 0);
    }
}

#[test]
fn test_exact_fit_is_lifo() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let mut blocks = vec![];
    for _ in 0..3 {
        blocks.push(allocator.malloc(100).unwrap());
        allocator.malloc(8).unwrap();
    }
    unsafe {
        for &p in &blocks {
            allocator.free(p.as_ptr());
        }
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free_chunks, 3);
    assert_eq!(stats.free, 3 * chunk_size(100));

    for &p in blocks.iter().rev() {
        assert_eq!(allocator.malloc(100).unwrap(), p);
    }
    assert_eq!(allocator.check().unwrap().free_chunks, 0);
}

#[test]
fn test_release_coalesces_neighbours() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let a = allocator.malloc(100).unwrap();
    let b = allocator.malloc(50).unwrap();
    let _guard = allocator.malloc(10).unwrap();

    unsafe {
        allocator.free(a.as_ptr());
        allocator.free(b.as_ptr());
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.free, chunk_size(100) + chunk_size(50));

    // The merged chunk fits a request larger than either of its parts.
    assert_eq!(allocator.malloc(160).unwrap(), a);
    assert_eq!(allocator.check().unwrap().free_chunks, 0);
}

#[test]
fn test_release_coalesces_backwards() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let _guard = allocator.malloc(10).unwrap();
    let a = allocator.malloc(300).unwrap();
    let b = allocator.malloc(300).unwrap();
    let _guard = allocator.malloc(10).unwrap();

    unsafe {
        allocator.free(b.as_ptr());
        allocator.free(a.as_ptr());
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.free, 2 * chunk_size(300));
    assert_eq!(allocator.malloc(600).unwrap(), a);
}

#[test]
fn test_release_merges_into_top() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let a = allocator.malloc(100).unwrap();
    let b = allocator.malloc(200).unwrap();
    let top_before = allocator.check().unwrap().top_size;

    unsafe { allocator.free(b.as_ptr()) };
    let stats = allocator.check().unwrap();
    assert_eq!(stats.top_size, top_before + chunk_size(200));
    assert_eq!(stats.free_chunks, 0);

    unsafe { allocator.free(a.as_ptr()) };
    let stats = allocator.check().unwrap();
    assert_eq!(stats.top_size, top_before + chunk_size(200) + chunk_size(100));
    assert_eq!(stats.in_use, 0);
    assert_eq!(allocator.malloc(100).unwrap(), a);
}

#[test]
fn test_next_larger_small_bin_is_split() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(56).unwrap();
    let _guard = allocator.malloc(8).unwrap();
    unsafe { allocator.free(p.as_ptr()) };
    assert_eq!(chunk_size(56), 2 * MIN_CHUNK_SIZE);

    // The free chunk is twice as large as needed: both halves get used.
    let q = allocator.malloc(8).unwrap();
    assert_eq!(q, p);
    assert_eq!(allocator.check().unwrap().free, MIN_CHUNK_SIZE);
    let r = allocator.malloc(8).unwrap();
    assert_eq!(distance(q, r), MIN_CHUNK_SIZE);
    assert_eq!(allocator.check().unwrap().free_chunks, 0);
}

#[test]
fn test_slightly_larger_chunk_is_not_split() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let req = MIN_CHUNK_SIZE;
    assert_eq!(chunk_size(req), MIN_CHUNK_SIZE + MALLOC_ALIGNMENT);
    let p = allocator.malloc(req).unwrap();
    let _guard = allocator.malloc(8).unwrap();
    unsafe { allocator.free(p.as_ptr()) };

    let q = allocator.malloc(8).unwrap();
    assert_eq!(q, p);
    unsafe { assert_eq!(allocator.usable_size(q.as_ptr()), req) };
    assert_eq!(allocator.check().unwrap().free_chunks, 0);
}

#[test]
fn test_largest_small_request_uses_small_bins() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(MAX_SMALL_REQUEST).unwrap();
    let _guard = allocator.malloc(8).unwrap();
    unsafe { allocator.free(p.as_ptr()) };

    // One byte more needs a large chunk, which the small bin can't provide.
    let q = allocator.malloc(MAX_SMALL_REQUEST + 1).unwrap();
    assert_ne!(q, p);
    assert_eq!(allocator.malloc(MAX_SMALL_REQUEST).unwrap(), p);
    assert_eq!(allocator.check().unwrap().free_chunks, 0);
}

#[test]
fn test_emptied_bin_falls_through_to_top() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(16).unwrap();
    let guard = allocator.malloc(16).unwrap();
    unsafe { allocator.free(p.as_ptr()) };

    assert_eq!(allocator.malloc(16).unwrap(), p);
    let q = allocator.malloc(16).unwrap();
    assert_eq!(distance(guard, q), chunk_size(16));
}

#[test]
fn test_tree_best_fit() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let mut blocks = vec![];
    for size in [1000, 2000, 1500] {
        blocks.push(allocator.malloc(size).unwrap());
        allocator.malloc(16).unwrap();
    }
    unsafe {
        for &p in &blocks {
            allocator.free(p.as_ptr());
        }
    }
    assert_eq!(allocator.check().unwrap().free_chunks, 3);

    assert_eq!(allocator.malloc(1400).unwrap(), blocks[2]);
    // The tail of the 1500 chunk went to a small bin.
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free_chunks, 3);
    assert_eq!(stats.free, chunk_size(1000) + chunk_size(2000) + chunk_size(1500) - chunk_size(1400));

    assert_eq!(allocator.malloc(1900).unwrap(), blocks[1]);
    assert_eq!(allocator.malloc(900).unwrap(), blocks[0]);
    allocator.check().unwrap();
}

#[test]
fn test_small_request_served_from_tree() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let big = allocator.malloc(600).unwrap();
    let _guard = allocator.malloc(16).unwrap();
    unsafe { allocator.free(big.as_ptr()) };

    let top_before = allocator.check().unwrap().top_size;
    assert_eq!(allocator.malloc(40).unwrap(), big);
    let stats = allocator.check().unwrap();
    assert_eq!(stats.top_size, top_before);
    assert_eq!(stats.free, chunk_size(600) - chunk_size(40));
}

#[test]
fn test_growth_is_contiguous() {
    let calls = Cell::new(0);
    let mut buf = buffer(ARENA_SIZE);
    let grower = CountingGrower { inner: arena(&mut buf), calls: &calls };
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(grower, GRANULARITY) };

    allocator.malloc(10).unwrap();
    assert_eq!(calls.get(), 1);
    let stats = allocator.check().unwrap();
    assert_eq!(stats.footprint, GRANULARITY);
    assert_eq!(stats.top_size, GRANULARITY - TOP_FOOT_SIZE - chunk_size(10));

    let mut footprint = stats.footprint;
    let mut blocks = vec![];
    for _ in 0..200 {
        blocks.push(allocator.malloc(100).unwrap());
        let stats = allocator.check().unwrap();
        assert!(stats.footprint >= footprint);
        assert_eq!(stats.max_footprint, stats.footprint);
        assert_eq!(stats.footprint, stats.provided);
        assert_eq!(stats.segments, 1);
        footprint = stats.footprint;
    }
    assert!(calls.get() > 1);
    assert_eq!(footprint % GRANULARITY, 0);
    for w in blocks.windows(2) {
        assert_eq!(distance(w[0], w[1]), chunk_size(100));
    }
}

#[test]
fn test_one_growth_per_request() {
    let calls = Cell::new(0);
    let mut buf = buffer(ARENA_SIZE);
    let grower = CountingGrower { inner: arena(&mut buf), calls: &calls };
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(grower, GRANULARITY) };

    allocator.malloc(10).unwrap();
    let before = allocator.check().unwrap();
    assert!(before.top_size < 50_000);

    let p = allocator.malloc(50_000).unwrap();
    assert_eq!(calls.get(), 2);
    let after = allocator.check().unwrap();
    assert!(after.footprint - before.footprint >= chunk_size(50_000));
    assert_eq!(after.footprint % GRANULARITY, 0);
    unsafe { assert!(allocator.usable_size(p.as_ptr()) >= 50_000) };
}

#[test]
fn test_disjoint_extents() {
    let mut buf = buffer(ARENA_SIZE);
    let grower = GappedGrower { inner: arena(&mut buf), gap: 64, started: false };
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(grower, GRANULARITY) };

    let a = allocator.malloc(3000).unwrap();
    let old_top = GRANULARITY - TOP_FOOT_SIZE - chunk_size(3000);
    assert_eq!(allocator.check().unwrap().top_size, old_top);

    // Doesn't fit in what's left of top: the first extent gets sealed.
    let b = allocator.malloc(2000).unwrap();
    let stats = allocator.check().unwrap();
    assert_eq!(stats.segments, 2);
    assert_eq!(stats.footprint, 2 * GRANULARITY);
    assert_eq!(stats.provided, 2 * GRANULARITY + 64);
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.free, old_top);
    assert_eq!(stats.in_use, chunk_size(3000) + chunk_size(2000));

    // The old top is reused.
    let c = allocator.malloc(900).unwrap();
    assert_eq!(distance(a, c), chunk_size(3000));

    unsafe {
        allocator.free(a.as_ptr());
        allocator.free(c.as_ptr());
        let stats = allocator.check().unwrap();
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.free, GRANULARITY - TOP_FOOT_SIZE);

        allocator.free(b.as_ptr());
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.top_size, GRANULARITY - TOP_FOOT_SIZE);
}

#[test]
fn test_disjoint_extents_with_tiny_top() {
    let mut buf = buffer(ARENA_SIZE);
    let grower = GappedGrower { inner: arena(&mut buf), gap: 64, started: false };
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(grower, GRANULARITY) };

    // Leave less than a minimal chunk in top.
    let req = GRANULARITY - TOP_FOOT_SIZE - MIN_CHUNK_SIZE;
    let a = allocator.malloc(req).unwrap();
    assert!(allocator.check().unwrap().top_size < MIN_CHUNK_SIZE);

    let b = allocator.malloc(100).unwrap();
    let stats = allocator.check().unwrap();
    assert_eq!(stats.segments, 2);
    assert_eq!(stats.free_chunks, 0);

    unsafe {
        allocator.free(a.as_ptr());
        allocator.free(b.as_ptr());
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.in_use, 0);
}

#[test]
fn test_growth_failure_is_remembered() {
    init_logging();
    let calls = Cell::new(0);
    let mut buf = buffer(8 * 1024);
    let grower = CountingGrower { inner: arena(&mut buf), calls: &calls };
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(grower, GRANULARITY) };

    assert!(allocator.malloc(20_000).is_err());
    assert_eq!(calls.get(), 1);
    let stats = allocator.check().unwrap();
    assert_eq!(stats.footprint, 0);
    assert_eq!(stats.top_size, 0);

    // At least as large: the grower isn't asked again.
    assert!(allocator.malloc(30_000).is_err());
    assert!(allocator.malloc(20_000).is_err());
    assert_eq!(calls.get(), 1);

    // Smaller requests still may grow the heap.
    let p = allocator.malloc(100).unwrap();
    assert_eq!(calls.get(), 2);

    allocator.forget_growth_failure();
    assert!(allocator.malloc(20_000).is_err());
    assert_eq!(calls.get(), 3);

    unsafe { allocator.free(p.as_ptr()) };
    assert_eq!(allocator.check().unwrap().in_use, 0);
}

#[test]
fn test_exhaustion() {
    let mut buf = buffer(16 * 1024);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let mut blocks = vec![];
    while let Ok(p) = allocator.malloc(200) {
        blocks.push(p);
    }
    assert!(!blocks.is_empty());
    let stats = allocator.check().unwrap();
    assert_eq!(stats.footprint, 16 * 1024);
    assert_eq!(stats.in_use, blocks.len() * chunk_size(200));

    unsafe {
        for p in blocks.drain(..) {
            allocator.free(p.as_ptr());
        }
    }
    // Everything went back to top.
    let stats = allocator.check().unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.free_chunks, 0);
    assert_eq!(stats.top_size, 16 * 1024 - TOP_FOOT_SIZE);
}

#[test]
fn test_oversized_request() {
    let mut buf = buffer(GRANULARITY);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };
    assert!(allocator.malloc(usize::MAX).is_err());
    assert!(allocator.malloc(isize::MAX as usize).is_err());
    assert!(allocator.memalign(64, usize::MAX - 64).is_err());
    assert_eq!(allocator.check().unwrap().footprint, 0);
}

#[test]
fn test_zero_size() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(0).unwrap();
    let q = allocator.malloc(0).unwrap();
    assert_ne!(p, q);
    unsafe {
        assert_eq!(allocator.usable_size(p.as_ptr()), MIN_CHUNK_SIZE - WORD);
        allocator.free(p.as_ptr());
        allocator.free(q.as_ptr());
        allocator.free(core::ptr::null_mut());
        assert_eq!(allocator.usable_size(core::ptr::null()), 0);
    }
    assert_eq!(allocator.check().unwrap().in_use, 0);
}

#[test]
fn test_payload_fills_usable_size() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let mut blocks = vec![];
    for size in (0..600).step_by(7) {
        let p = allocator.malloc(size).unwrap();
        let usable = unsafe { allocator.usable_size(p.as_ptr()) };
        assert!(usable >= size);
        unsafe { p.as_ptr().write_bytes(0xA5, usable) };
        blocks.push(p);
    }
    allocator.check().unwrap();
    unsafe {
        for p in blocks.into_iter().step_by(2) {
            allocator.free(p.as_ptr());
        }
    }
    allocator.check().unwrap();
}

#[test]
fn test_resize_shrinks_in_place() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(1000).unwrap();
    let _guard = allocator.malloc(16).unwrap();
    unsafe {
        assert_eq!(allocator.resize(p.as_ptr(), 100).unwrap(), p);
        assert_eq!(allocator.usable_size(p.as_ptr()), chunk_size(100) - WORD);
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.free, chunk_size(1000) - chunk_size(100));
}

#[test]
fn test_resize_grows_into_top() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(100).unwrap();
    let top_before = allocator.check().unwrap().top_size;
    unsafe {
        assert_eq!(allocator.resize(p.as_ptr(), 1000).unwrap(), p);
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.top_size, top_before - (chunk_size(1000) - chunk_size(100)));
    assert_eq!(stats.in_use, chunk_size(1000));
}

#[test]
fn test_resize_grows_into_free_neighbour() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(100).unwrap();
    let q = allocator.malloc(200).unwrap();
    let _guard = allocator.malloc(16).unwrap();
    unsafe {
        allocator.free(q.as_ptr());
        assert!(allocator.resize_in_place(p, 250));
        assert!(!allocator.resize_in_place(p, 400));
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.free, chunk_size(100) + chunk_size(200) - chunk_size(250));
}

#[test]
fn test_resize_moves_and_preserves_contents() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let p = allocator.malloc(100).unwrap();
    let _guard = allocator.malloc(16).unwrap();
    unsafe {
        for i in 0..100 {
            p.as_ptr().add(i).write(i as u8);
        }
        assert!(!allocator.resize_in_place(p, 5000));
        let q = allocator.resize(p.as_ptr(), 5000).unwrap();
        assert_ne!(q, p);
        for i in 0..100 {
            assert_eq!(q.as_ptr().add(i).read(), i as u8);
        }
        // The old chunk was released.
        assert_eq!(allocator.check().unwrap().free, chunk_size(100));

        let r = allocator.resize(core::ptr::null_mut(), 10).unwrap();
        assert_eq!(r, p);
    }
}

#[test]
fn test_memalign() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let _offset = allocator.malloc(24).unwrap();
    for align in [1, 8, 16, 64, 256, 4096] {
        let p = allocator.memalign(align, 100).unwrap();
        assert_eq!(p.as_ptr() as usize % align, 0, "alignment {align}");
        let usable = unsafe { allocator.usable_size(p.as_ptr()) };
        assert!(usable >= 100);
        unsafe { p.as_ptr().write_bytes(0x5A, usable) };
        allocator.check().unwrap();

        let in_use = allocator.check().unwrap().in_use;
        unsafe { allocator.free(p.as_ptr()) };
        assert_eq!(allocator.check().unwrap().in_use, in_use - chunk_size(usable));
    }
}

#[test]
#[should_panic]
fn test_memalign_rejects_bad_alignment() {
    let mut buf = buffer(GRANULARITY);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };
    let _ = allocator.memalign(48, 10);
}

#[test]
#[should_panic]
fn test_rejects_bad_granularity() {
    let mut buf = buffer(GRANULARITY);
    let _ = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), 3000) };
}

#[test]
fn test_allocator_api() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower(arena(&mut buf)) };

    let mut v = Vec::new_in(&allocator);
    for i in 0..10_000_u32 {
        v.push(i);
    }
    assert!(v.iter().enumerate().all(|(i, &x)| i as u32 == x));
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!(v, (0..10).collect::<Vec<_>>());

    #[repr(align(64))]
    struct Aligned([u8; 64]);
    let boxed = Box::new_in(Aligned([7; 64]), &allocator);
    assert_eq!(&*boxed as *const Aligned as usize % 64, 0);
    assert!(boxed.0.iter().all(|&b| b == 7));

    let mut aligned = Vec::with_capacity_in(4, &allocator);
    for i in 0..100_u8 {
        aligned.push(Aligned([i; 64]));
    }
    assert_eq!(aligned.as_ptr() as usize % 64, 0);
    assert!(aligned.iter().enumerate().all(|(i, a)| a.0[63] == i as u8));

    allocator.check().unwrap();
    drop(v);
    drop(boxed);
    drop(aligned);
    assert_eq!(allocator.check().unwrap().in_use, 0);
}

#[test]
fn test_global_alloc_api() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower(arena(&mut buf)) };

    unsafe {
        let layout = Layout::from_size_align(24, 8).unwrap();
        let p = allocator.alloc(layout);
        assert!(!p.is_null());
        p.write_bytes(1, 24);

        let q = allocator.realloc(p, layout, 4000);
        assert!(!q.is_null());
        assert!((0..24).all(|i| *q.add(i) == 1));

        let wide = Layout::from_size_align(32, 128).unwrap();
        let r = allocator.alloc(wide);
        assert_eq!(r as usize % 128, 0);
        let r = allocator.realloc(r, wide, 3000);
        assert_eq!(r as usize % 128, 0);

        assert!(allocator.alloc(Layout::from_size_align(1 << 30, 8).unwrap()).is_null());

        allocator.dealloc(q, Layout::from_size_align(4000, 8).unwrap());
        allocator.dealloc(r, Layout::from_size_align(3000, 128).unwrap());
    }
    assert_eq!(allocator.check().unwrap().in_use, 0);
}

#[test]
fn test_check_reports_corruption() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let a = allocator.malloc(100).unwrap();
    let b = allocator.malloc(100).unwrap();
    unsafe {
        allocator.free(a.as_ptr());
        assert!(allocator.check().is_ok());

        // Claim that the free chunk in front of `b` is in use.
        let head = b.as_ptr().sub(WORD).cast::<usize>();
        *head |= PINUSE;
    }
    let err = allocator.check().unwrap_err();
    assert!(matches!(err, HeapCorruption::PinuseMismatch { .. }), "{err}");
}

#[test]
fn test_check_reports_chunk_crossing_segment_end() {
    let mut buf = buffer(ARENA_SIZE);
    let allocator = unsafe { SegMalloc::with_grower_and_granularity(arena(&mut buf), GRANULARITY) };

    let _a = allocator.malloc(100).unwrap();
    let b = allocator.malloc(100).unwrap();
    unsafe {
        let head = b.as_ptr().sub(WORD).cast::<usize>();
        *head = 16 * GRANULARITY | PINUSE | CINUSE;
    }
    let err = allocator.check().unwrap_err();
    assert!(matches!(err, HeapCorruption::OutsideSegment { .. }), "{err}");
}

#[test]
fn test_equality_is_identity() {
    let mut buf1 = buffer(GRANULARITY);
    let mut buf2 = buffer(GRANULARITY);
    let a = unsafe { SegMalloc::with_grower(arena(&mut buf1)) };
    let b = unsafe { SegMalloc::with_grower(arena(&mut buf2)) };
    assert_eq!(a, a);
    assert_ne!(a, b);
}
