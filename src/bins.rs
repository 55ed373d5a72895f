//! Size classes and the occupancy bitmaps used to find a bin in *O*(1).
//!
//! Chunks smaller than [`MIN_LARGE_SIZE`] live in one of [`NSMALLBINS`] exact-size bins spaced
//! 8 bytes apart. Larger chunks live in one of [`NTREEBINS`] tree bins. Each power of two is
//! split in two classes, and the last class catches everything from 16 MiB upwards.

use crate::header::{CHUNK_ALIGN_MASK, CHUNK_OVERHEAD};

pub const NSMALLBINS: usize = 32;
pub const NTREEBINS: usize = 32;
pub const SMALLBIN_SHIFT: usize = 3;
pub const TREEBIN_SHIFT: usize = 8;

pub const MIN_LARGE_SIZE: usize = 1 << TREEBIN_SHIFT;
pub const MAX_SMALL_SIZE: usize = MIN_LARGE_SIZE - 1;
/// Largest request whose padded chunk size is still small.
pub const MAX_SMALL_REQUEST: usize = MAX_SMALL_SIZE - CHUNK_ALIGN_MASK - CHUNK_OVERHEAD;

const USIZE_BITS: u32 = usize::BITS;

#[inline(always)]
pub fn is_small(size: usize) -> bool {
    size >> SMALLBIN_SHIFT < NSMALLBINS
}

#[inline(always)]
pub fn small_index(size: usize) -> u32 {
    (size >> SMALLBIN_SHIFT) as u32
}

#[inline(always)]
pub fn small_index2size(idx: u32) -> usize {
    (idx as usize) << SMALLBIN_SHIFT
}

/// Returns the tree bin holding chunks of `size` bytes.
///
/// The bin is given by the position of the most significant bit of `size >> 8`,
/// refined by the bit right below it.
pub fn tree_index(size: usize) -> u32 {
    let x = size >> TREEBIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        NTREEBINS as u32 - 1
    } else {
        let k = USIZE_BITS - 1 - x.leading_zeros();
        (k << 1) + ((size >> (k as usize + TREEBIN_SHIFT - 1)) & 1) as u32
    }
}

/// Smallest chunk size stored in tree bin `idx`.
pub fn min_size_for_tree_index(idx: u32) -> usize {
    let idx = idx as usize;
    (1 << ((idx >> 1) + TREEBIN_SHIFT)) | ((idx & 1) << ((idx >> 1) + TREEBIN_SHIFT - 1))
}

/// Shift that moves the first size bit distinguishing chunks inside bin `idx`
/// to the most significant position.
pub fn leftshift_for_tree_index(idx: u32) -> u32 {
    let idx = idx as usize;
    if idx == NTREEBINS - 1 {
        0
    } else {
        USIZE_BITS - 1 - ((idx >> 1) + TREEBIN_SHIFT - 2) as u32
    }
}

/// Occupancy bitmap over 32 bins. Bit `i` is set iff bin `i` is non-empty.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Binmap(u32);

impl Binmap {
    #[inline]
    pub const fn new() -> Self {
        Binmap(0)
    }

    #[inline(always)]
    pub fn bits(&self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_marked(&self, idx: u32) -> bool {
        self.0 & (1 << idx) != 0
    }

    #[inline(always)]
    pub fn mark(&mut self, idx: u32) {
        self.0 |= 1 << idx;
    }

    #[inline(always)]
    pub fn clear(&mut self, idx: u32) {
        self.0 &= !(1 << idx);
    }

    /// Returns the smallest non-empty bin with index `>= idx`.
    #[inline]
    pub fn first_at_or_above(&self, idx: u32) -> Option<u32> {
        debug_assert!(idx < 32);
        let bits = self.0 & (u32::MAX << idx);
        (bits != 0).then(|| bits.trailing_zeros())
    }

    /// Returns the smallest non-empty bin with index `> idx`.
    #[inline]
    pub fn first_above(&self, idx: u32) -> Option<u32> {
        if idx >= 31 {
            return None;
        }
        self.first_at_or_above(idx + 1)
    }
}
