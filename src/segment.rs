//! Defines the [`Segment`] record describing one extent obtained from a grower.

use core::ptr::null_mut;

/// A contiguous extent of memory handed out by a grower.
///
/// The allocator keeps the record of the newest extent inline. Older extents are sealed
/// when a disjoint extent arrives, and their records are stored inside themselves, just
/// before their trailing fenceposts. Together they form a singly-linked list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Segment {
    pub base: *mut u8,
    pub size: usize,
    pub next: *mut Segment,
}

impl Segment {
    #[inline]
    pub const fn empty() -> Self {
        Segment {
            base: null_mut(),
            size: 0,
            next: null_mut(),
        }
    }

    #[inline(always)]
    pub fn end(&self) -> *mut u8 {
        self.base.wrapping_add(self.size)
    }

    #[inline]
    pub fn holds(&self, p: *const u8) -> bool {
        self.base as *const u8 <= p && p < self.end() as *const u8
    }
}
