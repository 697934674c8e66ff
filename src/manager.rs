//! The allocator entry point.
//!
//! `allocate` first tries the calling core's preferred leaf inside a
//! core-local section. When that leaf is empty (or stays contended) it falls
//! back to a scan of the whole tree and moves the core's hint to whichever
//! leaf satisfied the request. `free` is a range test against the backing
//! region followed by arithmetic routing to the owning leaf.

use crate::const_arith::{Divisor64, Multiplier64};
use crate::error::{Error, Result};
use crate::geometry::{CORE_SLOTS, Geometry, SECTION_RETRIES, SLOW_PATH_PASSES};
use crate::region::Region;
use crate::rseq::{self, CoreId};
use crate::super_slab::{Scan, SlabTree};
use crate::vec_arith::U64x4;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::{Backoff, CachePadded};
use log::{debug, trace};

pub struct SlabManager<T, G: Geometry> {
    tree: SlabTree<T, G>,
    /// Preferred leaf per core slot. Advisory.
    hints: Box<[CachePadded<AtomicUsize>]>,
}

impl<T, G: Geometry> SlabManager<T, G> {
    const LEAVES: Divisor64 = Divisor64::new(G::LEAF_COUNT as u64);
    const CAPACITY_MUL: Multiplier64 = Multiplier64::new(G::SLAB_CAPACITY as u64);

    /// Reserve the backing region and build the tree.
    pub fn new() -> Result<Self> {
        let tree = SlabTree::<T, G>::new()?;
        // Spread cores over the leaves so they start on different slabs.
        let hints = (0..CORE_SLOTS)
            .map(|slot| CachePadded::new(AtomicUsize::new(Self::LEAVES.rem(slot as u64) as usize)))
            .collect();
        debug!(
            "slab manager: {} leaves x {} slots ({} bytes), fanout {}, depth {}",
            G::LEAF_COUNT,
            G::SLAB_CAPACITY,
            tree.region().bytes(),
            G::FANOUT,
            G::DEPTH
        );
        Ok(Self { tree, hints })
    }

    /// Hand out one free slot, or `Err(Error::Exhausted)` when the tree has
    /// none left.
    #[inline]
    pub fn allocate(&self) -> Result<NonNull<T>> {
        let local = rseq::with_retries(SECTION_RETRIES, |core| {
            let slab = self.tree.leaf(self.preferred_leaf(core));
            if slab.available() == 0 {
                return Ok(None);
            }
            let mut section = slab.enter(core)?;
            Ok(section.try_acquire())
        });
        match local {
            Ok(Some(ptr)) => Ok(ptr),
            Ok(None) | Err(_) => self.allocate_slow(),
        }
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&self) -> Result<NonNull<T>> {
        let root = self.tree.root();
        let backoff = Backoff::new();
        for _ in 0..SLOW_PATH_PASSES {
            let core = CoreId::current();
            let hint = self.preferred_leaf(core);
            match root.try_acquire(core, hint) {
                Scan::Acquired { leaf, ptr } => {
                    if leaf != hint {
                        self.hints[core.slot()].store(leaf, Ordering::Relaxed);
                    }
                    return Ok(ptr);
                }
                Scan::Busy => backoff.snooze(),
                Scan::Exhausted => {
                    trace!("slab tree exhausted ({} slots)", G::SLOT_COUNT);
                    return Err(Error::Exhausted);
                }
            }
        }
        trace!("gave up after {} busy passes over the slab tree", SLOW_PATH_PASSES);
        Err(Error::Exhausted)
    }

    /// Return a slot to its leaf.
    ///
    /// Pointers outside the backing region are rejected with
    /// [`Error::Foreign`] and leave every slab untouched; they belong to
    /// the caller's fallback allocator.
    ///
    /// # Safety
    ///
    /// If `ptr` is owned by this manager it must have been returned by
    /// [`allocate`](Self::allocate) and not freed since.
    #[inline]
    pub unsafe fn free(&self, ptr: NonNull<T>) -> Result<()> {
        let slot = self.tree.region().slot_of(ptr.as_ptr())?;
        unsafe { self.tree.root().release(slot) };
        Ok(())
    }

    /// Free many pointers, resolving their leaves four at a time. Rejected
    /// pointers are passed to `on_reject` and not touched. Returns the
    /// number released.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for every element of `ptrs`.
    pub unsafe fn free_batch(
        &self,
        ptrs: &[NonNull<T>],
        mut on_reject: impl FnMut(NonNull<T>, Error),
    ) -> usize {
        let range = self.tree.region().addr_range();
        let base = range.start as u64;
        let mut released = 0;
        for chunk in ptrs.chunks(U64x4::LANES) {
            let mut lanes = [base; U64x4::LANES];
            for (lane, ptr) in lanes.iter_mut().zip(chunk) {
                *lane = ptr.as_ptr().addr() as u64;
            }
            let offsets = U64x4(lanes).sub_const(base);
            let slots = offsets.div(&Region::<T>::STRIDE);
            let leaves = slots.div(&SlabTree::<T, G>::CAPACITY);
            let within = slots.sub_lanes(leaves.mul(&Self::CAPACITY_MUL));
            let rebuilt = slots.mul(&Region::<T>::STRIDE_MUL);
            for (lane, &ptr) in chunk.iter().enumerate() {
                let addr = ptr.as_ptr().addr();
                if !range.contains(&addr) {
                    on_reject(ptr, Error::Foreign { addr });
                } else if rebuilt.0[lane] != offsets.0[lane] {
                    on_reject(ptr, Error::Misaligned { addr });
                } else {
                    let leaf = self.tree.leaf(leaves.0[lane] as usize);
                    unsafe { leaf.release(within.0[lane] as usize) };
                    released += 1;
                }
            }
        }
        released
    }

    /// Whether `ptr` lies in `[&m, &m + 1)`.
    #[inline(always)]
    pub fn owns(&self, ptr: *const T) -> bool {
        self.tree.region().owns(ptr)
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        G::SLOT_COUNT
    }

    /// Approximate number of free slots. Exact when no call is in flight.
    pub fn available(&self) -> usize {
        self.tree.available()
    }

    #[inline(always)]
    pub fn preferred_leaf(&self, core: CoreId) -> usize {
        self.hints[core.slot()].load(Ordering::Relaxed)
    }

    pub fn tree(&self) -> &SlabTree<T, G> {
        &self.tree
    }
}
