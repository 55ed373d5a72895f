//! A single-threaded segregated-fit memory allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Requests and chunk sizes
// Every request is turned into a chunk size by `util::request_to_chunk_size`: one word of
// overhead is added and the sum is rounded up to `MALLOC_ALIGNMENT`, with `MIN_CHUNK_SIZE`
// as the floor. All internal paths (`Heap::allocate`, `Heap::resize_in_place`, ...) work with
// chunk sizes, the public methods with byte counts.
//
// ## Borrowing
// The heap and the grower live in separate `UnsafeCell`s. Each public method borrows both
// mutably for its whole duration, which is sound as long as no method is reentered. Growers
// can't call back into the allocator, so reentrancy can only come from the caller.

use self::heap::Heap;
use self::util::{to_nonnull_slice, DEFAULT_GRANULARITY};
use crate::growers::Grower;
use crate::header::{Chunk, CHUNK_OVERHEAD, MALLOC_ALIGNMENT};
use crate::util::raw_ptr;

use core::alloc::{AllocError, Allocator, GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::ptr::{copy_nonoverlapping, NonNull};

use tracing::{instrument, Level};

pub use self::check::{HeapCorruption, Stats};

mod alloc;
mod check;
mod heap;
mod release;
mod resize;
mod util;

/// A single-threaded segregated-fit allocator over the memory of a [`Grower`].
///
/// The allocator is neither `Sync` nor reentrant. Callers that share it between
/// threads must serialize all calls themselves.
#[repr(C)]
pub struct SegMalloc<T: Grower> {
    heap: UnsafeCell<Heap>,
    grower: UnsafeCell<T>,
}

impl<T: Grower> Debug for SegMalloc<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let heap = unsafe { &*self.heap.get() };
        f.debug_struct("SegMalloc")
            .field("granularity", &heap.granularity)
            .field("footprint", &heap.footprint)
            .field("max_footprint", &heap.max_footprint)
            .field("top", &heap.top)
            .field("topsize", &heap.topsize)
            .finish()
    }
}

impl<T: Grower> SegMalloc<T> {
    /// Creates an allocator instance with the specified grower.
    /// The heap grows in multiples of 64 KiB.
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying memory for the lifetime of the returned allocator.
    pub const unsafe fn with_grower(grower: T) -> Self {
        Self::with_grower_and_granularity(grower, DEFAULT_GRANULARITY)
    }

    /// Creates an allocator instance that asks `grower` for multiples of `granularity` bytes.
    ///
    /// # Panics
    /// Panics if `granularity` is not a power of two or is smaller than 8.
    ///
    /// # Safety
    /// Same as [`with_grower`](SegMalloc::with_grower).
    pub const unsafe fn with_grower_and_granularity(grower: T, granularity: usize) -> Self {
        assert!(
            granularity.is_power_of_two() && granularity >= MALLOC_ALIGNMENT,
            "Granularity must be a power of two no smaller than the chunk alignment."
        );
        SegMalloc {
            heap: UnsafeCell::new(Heap::new(granularity)),
            grower: UnsafeCell::new(grower),
        }
    }

    /// Returns a pointer to at least `size` bytes aligned to 8,
    /// or `Err(AllocError)` if the grower can't provide the memory.
    /// A zero `size` still yields a distinct minimal allocation.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::WARN))]
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let result = unsafe { (*self.heap.get()).allocate(&mut *self.grower.get(), size) };
        self.audit();
        result
    }

    /// Releases the allocation at `ptr`. A null `ptr` is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or returned by this allocator and not freed since.
    #[instrument(level = "info", skip(self))]
    pub unsafe fn free(&self, ptr: *mut u8) {
        (*self.heap.get()).release(ptr);
        self.audit();
    }

    /// Resizes the allocation at `ptr` to `size` bytes, moving it if it can't be
    /// resized in place. A null `ptr` behaves like [`malloc`](SegMalloc::malloc).
    /// On failure the original allocation is left untouched.
    ///
    /// # Safety
    /// `ptr` must be null or returned by this allocator and not freed since.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::WARN))]
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        let result = (*self.heap.get()).resize(&mut *self.grower.get(), ptr, size);
        self.audit();
        result
    }

    /// Resizes the allocation at `ptr` to `size` bytes if that can be done without moving it.
    /// Returns whether it could.
    ///
    /// # Safety
    /// `ptr` must be returned by this allocator and not freed since.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO))]
    pub unsafe fn resize_in_place(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let resized = (*self.heap.get()).resize_in_place(ptr.as_ptr(), size);
        self.audit();
        resized
    }

    /// Returns a pointer to at least `size` bytes aligned to `align`.
    ///
    /// # Panics
    /// Panics if `align` is not a power of two.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::WARN))]
    pub fn memalign(&self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        assert!(align.is_power_of_two(), "Alignment must be a power of two.");
        let result = unsafe { (*self.heap.get()).memalign(&mut *self.grower.get(), align, size) };
        self.audit();
        result
    }

    /// Returns how many bytes the allocation at `ptr` can actually hold, 0 for null.
    ///
    /// # Safety
    /// `ptr` must be null or returned by this allocator and not freed since.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        Chunk::size(Chunk::from_mem(ptr.cast_mut())) - CHUNK_OVERHEAD
    }

    /// Walks the heap and reports how its memory is used.
    pub fn stats(&self) -> Stats {
        let mut stats = unsafe { (*self.heap.get()).stats() };
        stats.provided = unsafe { (*self.grower.get()).size() };
        stats
    }

    /// Walks the heap and verifies every invariant the allocator relies on.
    pub fn check(&self) -> Result<Stats, HeapCorruption> {
        let mut stats = unsafe { (*self.heap.get()).check()? };
        stats.provided = unsafe { (*self.grower.get()).size() };
        Ok(stats)
    }

    /// Lets the allocator ask the grower again for sizes it refused before.
    pub fn forget_growth_failure(&self) {
        unsafe { (*self.heap.get()).growth_floor = usize::MAX };
    }

    #[inline(always)]
    fn audit(&self) {
        #[cfg(all(feature = "heap-checks", debug_assertions))]
        if let Err(corruption) = self.check() {
            panic!("Heap corrupted: {corruption}.");
        }
    }

    /// Allocates for `layout`, going through [`memalign`](SegMalloc::memalign) only
    /// for alignments the chunks don't already provide.
    #[inline]
    fn alloc_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.align() <= MALLOC_ALIGNMENT {
            self.malloc(layout.size())
        } else {
            self.memalign(layout.align(), layout.size())
        }
    }

    /// Moves or resizes the allocation at `ptr`, described by `old_layout`,
    /// to `new_size` bytes aligned to `new_align`.
    ///
    /// # Safety
    /// `ptr` must be returned by this allocator and not freed since.
    unsafe fn realloc_layout(
        &self,
        ptr: *mut u8,
        old_layout: Layout,
        new_align: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if new_align <= MALLOC_ALIGNMENT {
            return self.resize(ptr, new_size);
        }
        if ptr as usize % new_align == 0 && self.resize_in_place(NonNull::new_unchecked(ptr), new_size) {
            return Ok(NonNull::new_unchecked(ptr));
        }
        let new_ptr = self.memalign(new_align, new_size)?;
        copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_layout.size().min(new_size));
        self.free(ptr);
        Ok(new_ptr)
    }
}

//---------------impl Allocator for SegMalloc---------------//

unsafe impl<T: Grower> Allocator for SegMalloc<T> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.alloc_layout(layout)?;
        Ok(unsafe { to_nonnull_slice(ptr) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(ptr.as_ptr())
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(old_layout.size() <= new_layout.size());
        let ptr = self.realloc_layout(ptr.as_ptr(), old_layout, new_layout.align(), new_layout.size())?;
        Ok(to_nonnull_slice(ptr))
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(old_layout.size() >= new_layout.size());
        let ptr = self.realloc_layout(ptr.as_ptr(), old_layout, new_layout.align(), new_layout.size())?;
        Ok(to_nonnull_slice(ptr))
    }
}

//---------------impl GlobalAlloc for SegMalloc---------------//

unsafe impl<T: Grower> GlobalAlloc for SegMalloc<T> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        raw_ptr(self.alloc_layout(layout).ok())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        raw_ptr(self.realloc_layout(ptr, layout, layout.align(), new_size).ok())
    }
}

impl<T: Grower> PartialEq for SegMalloc<T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<T: Grower> Eq for SegMalloc<T> {}

#[cfg(test)]
mod tests;
