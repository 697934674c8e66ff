//! Super-slabs: levels of a fixed-fanout tree over the leaf slabs.
//!
//! The tree lives in one arena. Leaves are stored in index order and every
//! node owns a contiguous run of them, so a node is addressed by
//! `(level, index)`: its children are `index * FANOUT + 0..FANOUT` one level
//! down, and its slots are one contiguous run of the backing region.
//! Mapping a slot to a child is a division by the child's slot span, done
//! with precomputed [`Divisor64`] tables.

use crate::const_arith::Divisor64;
use crate::error::Result;
use crate::geometry::{Geometry, MAX_DEPTH, leaves_under, slots_under};
use crate::region::Region;
use crate::rseq::CoreId;
use crate::slab::SharedSlab;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;
use crossbeam_utils::CachePadded;

/// Result of a tree scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan<T> {
    Acquired { leaf: usize, ptr: NonNull<T> },
    /// Nothing acquired, but some leaf with free slots was held by another
    /// thread. A rescan may succeed.
    Busy,
    Exhausted,
}

/// Arena holding the backing region and every leaf slab.
pub struct SlabTree<T, G: Geometry> {
    leaves: Box<[CachePadded<SharedSlab<T>>]>,
    region: Region<T>,
    _shape: PhantomData<fn() -> G>,
}

const fn child_slot_divisors<G: Geometry>() -> [Divisor64; MAX_DEPTH] {
    let mut table = [Divisor64::ONE; MAX_DEPTH];
    let mut level = 0;
    while level < G::DEPTH {
        table[level] = Divisor64::new(slots_under::<G>(level + 1) as u64);
        level += 1;
    }
    table
}

const fn child_leaf_divisors<G: Geometry>() -> [Divisor64; MAX_DEPTH] {
    let mut table = [Divisor64::ONE; MAX_DEPTH];
    let mut level = 0;
    while level < G::DEPTH {
        table[level] = Divisor64::new(leaves_under::<G>(level + 1) as u64);
        level += 1;
    }
    table
}

impl<T, G: Geometry> SlabTree<T, G> {
    /// Slots spanned by one child of a node at each level.
    const CHILD_SLOTS: [Divisor64; MAX_DEPTH] = child_slot_divisors::<G>();
    /// Leaves spanned by one child of a node at each level.
    const CHILD_LEAVES: [Divisor64; MAX_DEPTH] = child_leaf_divisors::<G>();
    pub(crate) const CAPACITY: Divisor64 = Divisor64::new(G::SLAB_CAPACITY as u64);

    pub fn new() -> Result<Self> {
        let () = G::CHECK;
        let region = Region::new(G::SLOT_COUNT)?;
        let leaves = (0..G::LEAF_COUNT)
            .map(|leaf| {
                let base = region.slot_ptr(leaf * G::SLAB_CAPACITY);
                // SAFETY: leaf runs are disjoint and the region outlives them.
                CachePadded::new(unsafe { SharedSlab::new(base, G::SLAB_CAPACITY) })
            })
            .collect();
        Ok(Self {
            leaves,
            region,
            _shape: PhantomData,
        })
    }

    #[inline(always)]
    pub fn region(&self) -> &Region<T> {
        &self.region
    }

    #[inline(always)]
    pub fn leaf(&self, index: usize) -> &SharedSlab<T> {
        &self.leaves[index]
    }

    #[inline(always)]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Free slots across all leaves, as reported by their hints.
    pub fn available(&self) -> usize {
        self.leaves.iter().map(|leaf| leaf.available()).sum()
    }

    #[inline]
    pub fn root(&self) -> Node<'_, T, G> {
        if G::DEPTH == 0 {
            Node::Slab { index: 0, slab: &self.leaves[0] }
        } else {
            Node::Super(SuperSlab { tree: self, level: 0, index: 0 })
        }
    }

    /// `(leaf, slot within leaf)` for a flat slot index.
    #[inline(always)]
    pub fn locate(&self, slot: usize) -> (usize, usize) {
        Self::CAPACITY.div_rem_usize(slot)
    }
}

/// One child of a super-slab (or the root of a depth-0 tree).
pub enum Node<'t, T, G: Geometry> {
    Slab { index: usize, slab: &'t SharedSlab<T> },
    Super(SuperSlab<'t, T, G>),
}

impl<T, G: Geometry> Node<'_, T, G> {
    /// Acquire a slot anywhere under this node, starting from the part of
    /// the subtree that contains `hint` (a leaf index).
    #[inline]
    pub fn try_acquire(&self, core: CoreId, hint: usize) -> Scan<T> {
        match self {
            Node::Slab { index, slab } => {
                if slab.available() == 0 {
                    return Scan::Exhausted;
                }
                match slab.enter(core) {
                    Ok(mut section) => match section.try_acquire() {
                        Some(ptr) => Scan::Acquired { leaf: *index, ptr },
                        None => Scan::Exhausted,
                    },
                    Err(_) => Scan::Busy,
                }
            }
            Node::Super(sup) => sup.try_acquire(core, hint),
        }
    }

    /// # Safety
    ///
    /// `slot` (relative to this node) must be occupied.
    #[inline]
    pub unsafe fn release(&self, slot: usize) {
        match self {
            Node::Slab { slab, .. } => unsafe { slab.release(slot) },
            Node::Super(sup) => unsafe { sup.release(slot) },
        }
    }

    pub fn slot_range(&self) -> Range<usize> {
        match self {
            Node::Slab { index, .. } => {
                let first = index * G::SLAB_CAPACITY;
                first..first + G::SLAB_CAPACITY
            }
            Node::Super(sup) => sup.slot_range(),
        }
    }
}

/// View of one super-slab node.
pub struct SuperSlab<'t, T, G: Geometry> {
    tree: &'t SlabTree<T, G>,
    level: usize,
    index: usize,
}

impl<T, G: Geometry> Clone for SuperSlab<'_, T, G> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, G: Geometry> Copy for SuperSlab<'_, T, G> {}

impl<'t, T, G: Geometry> SuperSlab<'t, T, G> {
    #[inline(always)]
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn slot_range(&self) -> Range<usize> {
        let span = slots_under::<G>(self.level);
        let first = self.index * span;
        first..first + span
    }

    pub fn leaf_range(&self) -> Range<usize> {
        let span = leaves_under::<G>(self.level);
        let first = self.index * span;
        first..first + span
    }

    /// Whether `ptr` falls inside this node's run of the region.
    pub fn owns(&self, ptr: *const T) -> bool {
        let slots = self.slot_range();
        self.tree
            .region()
            .slot_addr_range(slots.start, slots.len())
            .contains(&ptr.addr())
    }

    /// Child `child` (in `0..FANOUT`).
    #[inline]
    pub fn child_at(&self, child: usize) -> Node<'t, T, G> {
        assert!(child < G::FANOUT, "child {} out of range", child);
        let index = self.index * G::FANOUT + child;
        if self.level + 1 == G::DEPTH {
            Node::Slab { index, slab: self.tree.leaf(index) }
        } else {
            Node::Super(SuperSlab {
                tree: self.tree,
                level: self.level + 1,
                index,
            })
        }
    }

    /// Child `C`, with the bound checked when the call is monomorphized.
    ///
    /// ```compile_fail
    /// use coreslab::super_slab::{Node, SlabTree};
    /// use coreslab::Shape;
    ///
    /// let tree = SlabTree::<u64, Shape<4, 2, 2>>::new().unwrap();
    /// if let Node::Super(root) = tree.root() {
    ///     let _ = root.child::<2>();
    /// }
    /// ```
    #[inline]
    pub fn child<const C: usize>(&self) -> Node<'t, T, G> {
        const { assert!(C < G::FANOUT, "child index out of range") };
        self.child_at(C)
    }

    /// `(child, slot within child)` for a slot relative to this node.
    #[inline(always)]
    pub fn locate(&self, slot: usize) -> (usize, usize) {
        SlabTree::<T, G>::CHILD_SLOTS[self.level].div_rem_usize(slot)
    }

    /// Scan children in ascending order (wrapping) from the one on the
    /// path to `hint`, so at most `FANOUT` children are tried per level.
    pub fn try_acquire(&self, core: CoreId, hint: usize) -> Scan<T> {
        let leaves = self.leaf_range();
        let (start, hint) = if leaves.contains(&hint) {
            (SlabTree::<T, G>::CHILD_LEAVES[self.level].div_usize(hint - leaves.start), hint)
        } else {
            (0, leaves.start)
        };
        let mut busy = false;
        for step in 0..G::FANOUT {
            let mut child = start + step;
            if child >= G::FANOUT {
                child -= G::FANOUT;
            }
            match self.child_at(child).try_acquire(core, hint) {
                acquired @ Scan::Acquired { .. } => return acquired,
                Scan::Busy => busy = true,
                Scan::Exhausted => {}
            }
        }
        if busy { Scan::Busy } else { Scan::Exhausted }
    }

    /// # Safety
    ///
    /// `slot` (relative to this node) must be occupied.
    #[inline]
    pub unsafe fn release(&self, slot: usize) {
        let (child, rest) = self.locate(slot);
        unsafe { self.child_at(child).release(rest) };
    }
}
