//! Defines the [`TreeBins`] struct: best-fit bins for large chunks.
//!
//! Each tree bin is a bitwise trie embedded in the free chunks it indexes. A node's
//! children are selected by successive size bits below the bin's class prefix, so a
//! descent is bounded by the number of bits in a size. Chunks of equal size hang off
//! the trie node as a ring threaded through their `next`/`prev` fields. Only one ring member
//! takes part in the trie and has `in_tree` set.

use core::mem::size_of;
use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

use crate::bins::{leftshift_for_tree_index, tree_index, Binmap, MIN_LARGE_SIZE, NTREEBINS};
use crate::header::Chunk;

const_assert!(size_of::<TreeChunk>() <= MIN_LARGE_SIZE);

#[repr(C)]
pub struct TreeChunk {
    pub chunk: Chunk,
    pub child: [*mut TreeChunk; 2],
    pub parent: *mut TreeChunk,
    pub index: u32,
    pub in_tree: bool,
}

impl TreeChunk {
    #[inline(always)]
    pub fn as_chunk(p: *mut TreeChunk) -> *mut Chunk {
        p.cast()
    }

    #[inline(always)]
    unsafe fn ring_next(p: *mut TreeChunk) -> *mut TreeChunk {
        (*p).chunk.next.cast()
    }

    #[inline(always)]
    unsafe fn ring_prev(p: *mut TreeChunk) -> *mut TreeChunk {
        (*p).chunk.prev.cast()
    }

    #[inline(always)]
    unsafe fn leftmost_child(p: *mut TreeChunk) -> *mut TreeChunk {
        let left = (*p).child[0];
        if left.is_null() {
            (*p).child[1]
        } else {
            left
        }
    }
}

#[inline(always)]
fn top_bit(bits: usize) -> usize {
    (bits >> (usize::BITS - 1)) & 1
}

#[derive(Debug)]
pub struct TreeBins {
    roots: [*mut TreeChunk; NTREEBINS],
    map: Binmap,
}

impl TreeBins {
    #[inline]
    pub const fn new() -> Self {
        TreeBins {
            roots: [null_mut(); NTREEBINS],
            map: Binmap::new(),
        }
    }

    #[inline(always)]
    pub fn map(&self) -> Binmap {
        self.map
    }

    #[inline]
    pub fn root(&self, idx: u32) -> Option<NonNull<TreeChunk>> {
        NonNull::new(self.roots[idx as usize])
    }

    /// Inserts the free chunk `x` of `size` bytes into its tree bin.
    ///
    /// # Safety
    /// `x` must point to a free chunk of at least [`MIN_LARGE_SIZE`] bytes
    /// that is not part of any bin.
    pub unsafe fn insert(&mut self, x: *mut TreeChunk, size: usize) {
        let idx = tree_index(size);
        let xc = TreeChunk::as_chunk(x);
        (*x).index = idx;
        (*x).child = [null_mut(); 2];

        if !self.map.is_marked(idx) {
            self.map.mark(idx);
            self.roots[idx as usize] = x;
            (*x).parent = null_mut();
            (*x).in_tree = true;
            (*xc).next = xc;
            (*xc).prev = xc;
            return;
        }

        let mut t = self.roots[idx as usize];
        let mut bits = size << leftshift_for_tree_index(idx);
        loop {
            if Chunk::size(TreeChunk::as_chunk(t)) != size {
                let dir = top_bit(bits);
                bits <<= 1;
                let c = (*t).child[dir];
                if c.is_null() {
                    (*t).child[dir] = x;
                    (*x).parent = t;
                    (*x).in_tree = true;
                    (*xc).next = xc;
                    (*xc).prev = xc;
                    return;
                }
                t = c;
            } else {
                // Same size: join the ring behind the trie node.
                let tc = TreeChunk::as_chunk(t);
                let last = (*tc).prev;
                (*last).next = xc;
                (*tc).prev = xc;
                (*xc).prev = last;
                (*xc).next = tc;
                (*x).parent = null_mut();
                (*x).in_tree = false;
                return;
            }
        }
    }

    /// Removes `x` from its tree bin without any rebalancing.
    ///
    /// A ring sibling takes over `x`'s position when there is one. Otherwise the right-most
    /// leaf of `x`'s subtree is detached and promoted into `x`'s slot.
    ///
    /// # Safety
    /// `x` must be part of a tree bin.
    pub unsafe fn unlink(&mut self, x: *mut TreeChunk) {
        let parent = (*x).parent;
        let replacement: *mut TreeChunk;

        if TreeChunk::ring_prev(x) != x {
            let prev = TreeChunk::ring_prev(x);
            let next = TreeChunk::ring_next(x);
            (*prev).chunk.next = TreeChunk::as_chunk(next);
            (*next).chunk.prev = TreeChunk::as_chunk(prev);
            replacement = next;
        } else {
            let mut slot: *mut *mut TreeChunk = &mut (*x).child[1];
            if (*slot).is_null() {
                slot = &mut (*x).child[0];
            }
            if (*slot).is_null() {
                replacement = null_mut();
            } else {
                loop {
                    let mut child_slot: *mut *mut TreeChunk = &mut (**slot).child[1];
                    if (*child_slot).is_null() {
                        child_slot = &mut (**slot).child[0];
                    }
                    if (*child_slot).is_null() {
                        break;
                    }
                    slot = child_slot;
                }
                replacement = *slot;
                *slot = null_mut();
            }
        }

        if !(*x).in_tree {
            // A ring member outside the trie: unlinking from the ring was enough.
            return;
        }

        let idx = (*x).index;
        if self.roots[idx as usize] == x {
            self.roots[idx as usize] = replacement;
            if replacement.is_null() {
                self.map.clear(idx);
            }
        } else if (*parent).child[0] == x {
            (*parent).child[0] = replacement;
        } else {
            (*parent).child[1] = replacement;
        }

        if !replacement.is_null() {
            (*replacement).parent = parent;
            (*replacement).in_tree = true;
            for dir in 0..2 {
                let c = (*x).child[dir];
                if !c.is_null() {
                    (*replacement).child[dir] = c;
                    (*c).parent = replacement;
                }
            }
        }
    }

    /// Finds the smallest chunk with a size of at least `nb` bytes, searching the bin of `nb`
    /// first and then the next non-empty larger bin. The chunk is not unlinked.
    ///
    /// # Safety
    /// The tree bins must be well formed.
    pub unsafe fn best_fit(&self, nb: usize) -> Option<NonNull<TreeChunk>> {
        let mut best: *mut TreeChunk = null_mut();
        let mut best_rem = usize::MAX;
        let idx = tree_index(nb);
        let mut t = self.roots[idx as usize];

        if !t.is_null() {
            let mut bits = nb << leftshift_for_tree_index(idx);
            // Deepest right subtree passed over on the way down.
            let mut rst: *mut TreeChunk = null_mut();
            loop {
                let size = Chunk::size(TreeChunk::as_chunk(t));
                if size >= nb && size - nb < best_rem {
                    best = t;
                    best_rem = size - nb;
                    if best_rem == 0 {
                        break;
                    }
                }
                let right = (*t).child[1];
                t = (*t).child[top_bit(bits)];
                if !right.is_null() && right != t {
                    rst = right;
                }
                if t.is_null() {
                    t = rst;
                    break;
                }
                bits <<= 1;
            }
        }

        if t.is_null() && best.is_null() {
            if let Some(i) = self.map.first_above(idx) {
                t = self.roots[i as usize];
            }
        }

        while !t.is_null() {
            let size = Chunk::size(TreeChunk::as_chunk(t));
            if size >= nb && size - nb < best_rem {
                best = t;
                best_rem = size - nb;
            }
            t = TreeChunk::leftmost_child(t);
        }

        NonNull::new(best)
    }

    /// Returns the smallest chunk in the smallest non-empty tree bin.
    ///
    /// # Safety
    /// The tree bins must be well formed.
    pub unsafe fn smallest(&self) -> Option<NonNull<TreeChunk>> {
        let idx = self.map.first_at_or_above(0)?;
        let mut t = self.roots[idx as usize];
        let mut best = t;
        let mut best_size = Chunk::size(TreeChunk::as_chunk(t));
        loop {
            t = TreeChunk::leftmost_child(t);
            if t.is_null() {
                break;
            }
            let size = Chunk::size(TreeChunk::as_chunk(t));
            if size < best_size {
                best = t;
                best_size = size;
            }
        }
        NonNull::new(best)
    }

    /// Returns whether `x` is stored in the bin for `size`.
    ///
    /// # Safety
    /// The tree bins must be well formed.
    pub unsafe fn contains(&self, x: *mut TreeChunk, size: usize) -> bool {
        let idx = tree_index(size);
        let mut t = self.roots[idx as usize];
        let mut bits = size << leftshift_for_tree_index(idx);
        while !t.is_null() && Chunk::size(TreeChunk::as_chunk(t)) != size {
            t = (*t).child[top_bit(bits)];
            bits <<= 1;
        }
        if t.is_null() {
            return false;
        }
        let mut u = t;
        loop {
            if u == x {
                return true;
            }
            u = TreeChunk::ring_next(u);
            if u == t {
                return false;
            }
        }
    }

    /// Calls `f` on every chunk of bin `idx`: trie nodes in pre-order, each followed by
    /// the rest of its ring.
    ///
    /// # Safety
    /// The bin must be well formed and must not change during the walk.
    pub unsafe fn for_each(&self, idx: u32, mut f: impl FnMut(*mut TreeChunk)) {
        let mut stack = Vec::new();
        let root = self.roots[idx as usize];
        if !root.is_null() {
            stack.push(root);
        }
        while let Some(t) = stack.pop() {
            let mut u = t;
            loop {
                f(u);
                u = TreeChunk::ring_next(u);
                if u == t {
                    break;
                }
            }
            for dir in (0..2).rev() {
                let c = (*t).child[dir];
                if !c.is_null() {
                    stack.push(c);
                }
            }
        }
    }
}
