//! Leaf slabs.
//!
//! A [`Slab`] is a fixed run of slots plus an index-linked free list. It is
//! not thread-safe; [`SharedSlab`] wraps it in a core-local section and adds
//! a lock-free stack for frees that could not claim the section in time.
//! Slot memory itself is never written by the allocator, so a free slot's
//! bytes stay exactly as the last owner left them.

use crate::const_arith::Divisor64;
use crate::geometry::SECTION_RETRIES;
use crate::region::Region;
use crate::rseq::{self, Abort, CoreId, Section, SectionCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use log::trace;

/// End of a free list.
const NIL: u32 = u32::MAX;
/// Link value of a slot that is handed out.
const OCCUPIED: u32 = u32::MAX - 1;

/// Fixed-capacity arena of `T` slots.
///
/// Slots below `fresh` have been handed out at least once and are tracked
/// by `links`; slots at or above `fresh` were never used and are free.
pub struct Slab<T> {
    base: NonNull<T>,
    capacity: u32,
    /// Head of the free list of recycled slots.
    head: u32,
    fresh: u32,
    free: u32,
    links: Box<[u32]>,
}

// SAFETY: the slab only hands out pointers into its own run of slots.
unsafe impl<T: Send> Send for Slab<T> {}

impl<T> Slab<T> {
    const STRIDE: Divisor64 = Region::<T>::STRIDE;

    /// # Safety
    ///
    /// `base` must point at `capacity` slots of `T` that no other slab
    /// manages and that outlive this slab.
    pub unsafe fn new(base: NonNull<T>, capacity: usize) -> Self {
        debug_assert!(capacity > 0 && capacity < OCCUPIED as usize);
        Self {
            base,
            capacity: capacity as u32,
            head: NIL,
            fresh: 0,
            free: capacity as u32,
            links: vec![NIL; capacity].into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline(always)]
    pub fn free_count(&self) -> usize {
        self.free as usize
    }

    #[inline(always)]
    pub fn occupied(&self) -> usize {
        (self.capacity - self.free) as usize
    }

    #[inline(always)]
    pub fn is_exhausted(&self) -> bool {
        self.free == 0
    }

    #[inline]
    pub fn owns(&self, ptr: *const T) -> bool {
        let start = self.base.as_ptr().addr();
        let end = self.slot(self.capacity()).as_ptr().addr();
        (start..end).contains(&ptr.addr())
    }

    #[inline]
    pub fn is_occupied(&self, index: usize) -> bool {
        index < self.fresh as usize && self.links[index] == OCCUPIED
    }

    /// Pointer to slot `index` (one past the end is allowed).
    #[inline(always)]
    pub fn slot(&self, index: usize) -> NonNull<T> {
        unsafe { self.base.byte_add(Region::<T>::STRIDE_MUL.mul_usize(index)) }
    }

    #[inline(always)]
    pub fn index_of(&self, ptr: NonNull<T>) -> usize {
        Self::STRIDE.div_usize(ptr.as_ptr().addr() - self.base.as_ptr().addr())
    }

    /// Take a free slot, preferring recently released ones.
    #[inline]
    pub fn try_acquire(&mut self) -> Option<NonNull<T>> {
        self.acquire_index().map(|index| self.slot(index))
    }

    #[inline]
    pub fn acquire_index(&mut self) -> Option<usize> {
        let index = if self.head != NIL {
            let index = self.head;
            self.head = self.links[index as usize];
            index
        } else if self.fresh < self.capacity {
            self.fresh += 1;
            self.fresh - 1
        } else {
            return None;
        };
        self.links[index as usize] = OCCUPIED;
        self.free -= 1;
        Some(index as usize)
    }

    /// # Safety
    ///
    /// `ptr` must have come from [`Slab::try_acquire`] on this slab and not
    /// been released since.
    #[inline]
    pub unsafe fn release(&mut self, ptr: NonNull<T>) {
        debug_assert!(self.owns(ptr.as_ptr()));
        unsafe { self.release_index(self.index_of(ptr)) };
    }

    /// # Safety
    ///
    /// Slot `index` must be occupied.
    #[inline]
    pub unsafe fn release_index(&mut self, index: usize) {
        debug_assert!(self.is_occupied(index), "slot {} released twice", index);
        self.links[index] = self.head;
        self.head = index as u32;
        self.free += 1;
    }
}

/// Lock-free stack of released slot indices.
///
/// Pushes race with each other through one CAS; the owner detaches the
/// whole stack with a swap, which keeps the stack free of ABA.
pub struct DeferredList {
    head: AtomicU32,
    links: Box<[AtomicU32]>,
}

impl DeferredList {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: AtomicU32::new(NIL),
            links: (0..capacity).map(|_| AtomicU32::new(NIL)).collect(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == NIL
    }

    pub fn push(&self, index: usize) {
        let link = &self.links[index];
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            link.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                index as u32,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detach every pushed index.
    pub fn take_all(&self) -> Deferred<'_> {
        Deferred {
            links: &self.links,
            next: self.head.swap(NIL, Ordering::Acquire),
        }
    }
}

/// A detached chain from [`DeferredList::take_all`].
pub struct Deferred<'a> {
    links: &'a [AtomicU32],
    next: u32,
}

impl Iterator for Deferred<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == NIL {
            return None;
        }
        let index = self.next as usize;
        self.next = self.links[index].load(Ordering::Relaxed);
        Some(index)
    }
}

/// A slab shared between threads.
pub struct SharedSlab<T> {
    section: SectionCell<Slab<T>>,
    deferred: DeferredList,
    /// Local free slots plus deferred ones. Advisory.
    available: AtomicU32,
}

impl<T> SharedSlab<T> {
    /// # Safety
    ///
    /// Same contract as [`Slab::new`].
    pub unsafe fn new(base: NonNull<T>, capacity: usize) -> Self {
        Self {
            section: SectionCell::new(unsafe { Slab::new(base, capacity) }),
            deferred: DeferredList::new(capacity),
            available: AtomicU32::new(capacity as u32),
        }
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.section.generation()
    }

    #[inline]
    pub fn enter(&self, core: CoreId) -> Result<SlabSection<'_, T>, Abort> {
        Ok(SlabSection {
            slab: self.section.enter(core)?,
            deferred: &self.deferred,
            available: &self.available,
        })
    }

    /// Return slot `index` through the core-local section, or push it on the
    /// deferred stack if the section stays contended.
    ///
    /// # Safety
    ///
    /// Slot `index` must be occupied and owned by the caller.
    #[inline]
    pub unsafe fn release(&self, index: usize) {
        let local = rseq::with_retries(SECTION_RETRIES, |core| {
            let mut section = self.enter(core)?;
            unsafe { section.release_index(index) };
            Ok(())
        });
        if local.is_err() {
            unsafe { self.defer(index) };
        }
    }

    /// # Safety
    ///
    /// Same contract as [`SharedSlab::release`].
    #[cold]
    pub unsafe fn defer(&self, index: usize) {
        // Count first so `available` can over-report transiently but never
        // underflow when a drain races the push.
        self.available.fetch_add(1, Ordering::Release);
        self.deferred.push(index);
    }
}

/// A claimed [`SharedSlab`].
pub struct SlabSection<'a, T> {
    slab: Section<'a, Slab<T>>,
    deferred: &'a DeferredList,
    available: &'a AtomicU32,
}

impl<T> SlabSection<'_, T> {
    #[inline]
    pub fn slab(&self) -> &Slab<T> {
        &self.slab
    }

    #[inline]
    pub fn try_acquire(&mut self) -> Option<NonNull<T>> {
        let ptr = match self.slab.try_acquire() {
            Some(ptr) => ptr,
            None => {
                if self.drain_deferred() == 0 {
                    return None;
                }
                self.slab.try_acquire()?
            }
        };
        self.available.fetch_sub(1, Ordering::Relaxed);
        Some(ptr)
    }

    /// # Safety
    ///
    /// Slot `index` must be occupied.
    #[inline]
    pub unsafe fn release_index(&mut self, index: usize) {
        unsafe { self.slab.release_index(index) };
        self.available.fetch_add(1, Ordering::Release);
    }

    #[cold]
    fn drain_deferred(&mut self) -> usize {
        if self.deferred.is_empty() {
            return 0;
        }
        let mut drained = 0;
        for index in self.deferred.take_all() {
            unsafe { self.slab.release_index(index) };
            drained += 1;
        }
        trace!("drained {} deferred frees", drained);
        drained
    }
}
