//! Defines the [`SmallBins`] struct: the exact-size free lists for small chunks.

use core::ptr::{null_mut, NonNull};

use crate::bins::{small_index, small_index2size, Binmap, NSMALLBINS};
use crate::header::Chunk;

/// 32 circular doubly-linked lists of free chunks, one per 8-byte size class,
/// plus the bitmap recording which of them are non-empty.
///
/// The lists are threaded through the `next`/`prev` fields of the free chunks themselves.
/// Only the list heads are stored here, so the struct holds no pointers into itself and
/// may be moved freely.
#[derive(Debug)]
pub struct SmallBins {
    heads: [*mut Chunk; NSMALLBINS],
    map: Binmap,
}

impl SmallBins {
    #[inline]
    pub const fn new() -> Self {
        SmallBins {
            heads: [null_mut(); NSMALLBINS],
            map: Binmap::new(),
        }
    }

    #[inline(always)]
    pub fn map(&self) -> Binmap {
        self.map
    }

    #[inline]
    pub fn head(&self, idx: u32) -> Option<NonNull<Chunk>> {
        NonNull::new(self.heads[idx as usize])
    }

    /// Adds the free chunk `p` of `size` bytes to the front of its bin.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `p` must point to a free chunk that is not currently part of any bin.
    pub unsafe fn insert(&mut self, p: *mut Chunk, size: usize) {
        let idx = small_index(size);
        let head = self.heads[idx as usize];
        if head.is_null() {
            debug_assert!(!self.map.is_marked(idx));
            (*p).next = p;
            (*p).prev = p;
            self.map.mark(idx);
        } else {
            let last = (*head).prev;
            (*p).next = head;
            (*p).prev = last;
            (*last).next = p;
            (*head).prev = p;
        }
        self.heads[idx as usize] = p;
    }

    /// Removes `p` from the bin of `size`-byte chunks.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `p` must be part of that bin.
    pub unsafe fn unlink(&mut self, p: *mut Chunk, size: usize) {
        let idx = small_index(size);
        let next = (*p).next;
        if next == p {
            debug_assert_eq!(self.heads[idx as usize], p);
            self.heads[idx as usize] = null_mut();
            self.map.clear(idx);
        } else {
            let prev = (*p).prev;
            (*prev).next = next;
            (*next).prev = prev;
            if self.heads[idx as usize] == p {
                self.heads[idx as usize] = next;
            }
        }
    }

    /// Removes and returns the most recently inserted chunk of bin `idx`.
    ///
    /// # Safety
    /// The bin must not be empty.
    pub unsafe fn pop(&mut self, idx: u32) -> *mut Chunk {
        let p = self.heads[idx as usize];
        debug_assert!(!p.is_null(), "Popping from an empty small bin.");
        self.unlink(p, small_index2size(idx));
        p
    }

    /// Returns whether `p` is linked into the bin for `size`.
    ///
    /// # Safety
    /// The bin's list must be well formed.
    pub unsafe fn contains(&self, p: *mut Chunk, size: usize) -> bool {
        self.iter(small_index(size)).any(|q| q == p)
    }

    /// Iterates over the chunks of bin `idx`, starting from the head.
    ///
    /// # Safety
    /// The bin's list must be well formed and must not change during iteration.
    pub unsafe fn iter(&self, idx: u32) -> impl Iterator<Item = *mut Chunk> + '_ {
        let head = self.heads[idx as usize];
        let mut cursor = head;
        core::iter::from_fn(move || {
            if cursor.is_null() {
                return None;
            }
            let current = cursor;
            let next = unsafe { (*current).next };
            cursor = if next == head { null_mut() } else { next };
            Some(current)
        })
    }
}
