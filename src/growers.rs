//! [`Grower`] trait and structures that implement it.
//!
//! A grower is the memory provider behind a [`SegMalloc`](crate::SegMalloc).
//! The allocator calls it whenever no bin and no part of the top chunk can satisfy a request.

use crate::header::MALLOC_ALIGNMENT;
use crate::util::{align_ptr_up, align_up, checked_add};

use core::alloc::AllocError;
use core::ptr::NonNull;

use libc::{brk, sbrk};
use tracing::{debug, warn};

/// A source of fresh memory extents.
///
/// # Safety
/// * Every extent returned by [`grow`](Grower::grow) must start at a [`MALLOC_ALIGNMENT`]-aligned
///   address, have a size that is a multiple of [`MALLOC_ALIGNMENT`] and at least the requested
///   size, and must not overlap any extent handed out earlier.
/// * Copying, cloning, or moving the grower must not invalidate extents already handed out.
///   In practice growers reference their memory rather than own it.
/// * Extents are expected to stay valid for as long as the allocator using them is alive.
pub unsafe trait Grower {
    /// Requests at least `size` more bytes.
    /// Returns the start of the new extent and its actual size, or `Err(AllocError)` if the
    /// grower is exhausted. An extent starting exactly where the previous one ended is
    /// treated as a contiguous continuation of it.
    ///
    /// # Safety
    /// Callers must treat the returned memory as uninitialized.
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), AllocError>;

    /// Returns the total number of bytes handed out so far.
    fn size(&self) -> usize;
}

#[derive(Debug)]
/// A grower that internally uses [`libc::brk`] to operate
/// on the end of the process's data segment.
///
/// Consecutive extents are contiguous as long as nothing else moves the program break.
/// If something does, the next extent starts at the new break instead.
pub struct BrkGrower {
    heap_end: Option<NonNull<u8>>,
    total: usize,
    min_increment: usize,
}

impl BrkGrower {
    /// Creates a grower that never moves the program break by less than `min_increment` bytes.
    #[inline(always)]
    pub const fn new(min_increment: usize) -> Self {
        BrkGrower {
            heap_end: None,
            total: 0,
            min_increment,
        }
    }

    /// Returns where the next extent starts: the end of the previous one if the
    /// program break hasn't moved since, the aligned current break otherwise.
    ///
    /// # Safety
    /// This function is unsafe since it calls `sbrk(0)`, which races with any other
    /// thread moving the program break.
    unsafe fn next_start(&self) -> Result<NonNull<u8>, AllocError> {
        let current = unsafe { sbrk(0) };
        if current as isize == -1 {
            warn!("sbrk(0) failed, the program break is unavailable.");
            return Err(AllocError);
        }
        match self.heap_end {
            Some(end) if end.as_ptr() == current.cast() => Ok(end),
            previous => {
                if previous.is_some() {
                    debug!(?current, "Program break moved, starting a disjoint extent.");
                }
                align_ptr_up(current as *const u8, MALLOC_ALIGNMENT)
                    .and_then(|p| NonNull::new(p.cast_mut()))
                    .ok_or(AllocError)
            }
        }
    }
}

unsafe impl Grower for BrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let size = align_up(size.max(self.min_increment), MALLOC_ALIGNMENT).ok_or(AllocError)?;
        let start = unsafe { self.next_start()? };
        let new_heap_end = checked_add(start.as_ptr(), size).ok_or(AllocError)?;
        if unsafe { brk(new_heap_end.cast_mut().cast()) } == -1 {
            warn!(size, "brk refused to move the program break.");
            return Err(AllocError);
        }
        self.heap_end = NonNull::new(new_heap_end.cast_mut());
        self.total += size;
        Ok((start, size))
    }

    fn size(&self) -> usize {
        self.total
    }
}

/// A grower handing out consecutive extents of a caller-provided buffer.
///
/// This is the simplest possible backing store: a flat byte array grown from its
/// start towards its end, refusing any growth past the end.
#[derive(Debug)]
pub struct ArenaGrower {
    start: *mut u8,
    heap_end: *mut u8,
    arena_end: *mut u8,
    min_increment: usize,
}

impl ArenaGrower {
    /// Creates a grower over the `size` bytes at `buf`. Leading bytes are skipped if `buf`
    /// is not [`MALLOC_ALIGNMENT`]-aligned.
    ///
    /// The buffer must stay alive and untouched for as long as the grower's extents are in use.
    pub fn new(buf: *mut u8, size: usize, min_increment: usize) -> Self {
        let arena_end = buf.wrapping_add(size);
        let start = match align_ptr_up(buf, MALLOC_ALIGNMENT) {
            Some(p) if p <= arena_end.cast_const() => p.cast_mut(),
            _ => arena_end,
        };
        ArenaGrower {
            start,
            heap_end: start,
            arena_end,
            min_increment,
        }
    }

    /// Returns the number of bytes still available.
    pub fn remaining(&self) -> usize {
        self.arena_end as usize - self.heap_end as usize
    }
}

unsafe impl Grower for ArenaGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let heap_end = NonNull::new(self.heap_end).ok_or(AllocError)?;
        let size = align_up(size.max(self.min_increment), MALLOC_ALIGNMENT).ok_or(AllocError)?;
        if size > self.remaining() {
            debug!(size, remaining = self.remaining(), "Arena exhausted.");
            return Err(AllocError);
        }
        self.heap_end = self.heap_end.add(size);
        Ok((heap_end, size))
    }

    fn size(&self) -> usize {
        self.heap_end as usize - self.start as usize
    }
}

unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        (**self).grow(size)
    }

    fn size(&self) -> usize {
        (**self).size()
    }
}
