//! Fixed-size allocation with a compile-time fallback.
//!
//! A [`SlabAllocator`] is the handle containers hold. Single-element requests
//! go to the slab manager; everything else (and any request the tree cannot
//! serve) goes to the fallback `F`, chosen as a type parameter.
//!
//! ```
//! use coreslab::{Shape, SlabAllocator, SlabManager};
//!
//! let manager = SlabManager::<[u8; 32], Shape<64, 4, 1>>::new().unwrap();
//! let alloc = SlabAllocator::new(&manager);
//! let one = alloc.allocate(1).unwrap();
//! let many = alloc.allocate(3).unwrap();
//! assert!(manager.owns(one.as_ptr()));
//! assert!(!manager.owns(many.as_ptr()));
//! unsafe {
//!     alloc.deallocate(many, 3);
//!     alloc.deallocate(one, 1);
//! }
//! assert_eq!(alloc.stats().fallback_allocs(), 1);
//! ```

use crate::error::{Error, Result};
use crate::geometry::{Geometry, HISTOGRAM_BUCKETS};
use crate::manager::SlabManager;
use crate::registry;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{error, warn};
use std::alloc::System;

pub struct SlabAllocator<'m, T, G: Geometry, F: GlobalAlloc = System> {
    manager: &'m SlabManager<T, G>,
    fallback: F,
    stats: AllocStats,
}

impl<'m, T, G: Geometry> SlabAllocator<'m, T, G> {
    pub fn new(manager: &'m SlabManager<T, G>) -> Self {
        Self::with_fallback(manager, System)
    }
}

impl<T: Send + 'static, G: Geometry> SlabAllocator<'static, T, G> {
    /// Allocator over the process-wide default manager, if one of this
    /// type was installed.
    pub fn from_installed() -> Option<Self> {
        registry::installed::<T, G>().map(Self::new)
    }
}

impl<'m, T, G: Geometry, F: GlobalAlloc> SlabAllocator<'m, T, G, F> {
    pub fn with_fallback(manager: &'m SlabManager<T, G>, fallback: F) -> Self {
        Self {
            manager,
            fallback,
            stats: AllocStats::new(),
        }
    }

    #[inline(always)]
    pub fn manager(&self) -> &'m SlabManager<T, G> {
        self.manager
    }

    #[inline(always)]
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Storage for `count` contiguous elements. `count == 0` yields a
    /// dangling, well-aligned pointer.
    #[inline]
    pub fn allocate(&self, count: usize) -> Result<NonNull<T>> {
        self.stats.record_request(count);
        if count == 0 {
            return Ok(NonNull::dangling());
        }
        if count == 1
            && let Ok(ptr) = self.manager.allocate()
        {
            self.stats.slab_allocs.fetch_add(1, Ordering::Relaxed);
            return Ok(ptr);
        }
        self.allocate_fallback(count)
    }

    #[cold]
    #[inline(never)]
    fn allocate_fallback(&self, count: usize) -> Result<NonNull<T>> {
        let layout = Layout::array::<T>(count).map_err(|_| Error::LayoutOverflow { count })?;
        let raw = unsafe { self.fallback.alloc(layout) };
        match NonNull::new(raw.cast::<T>()) {
            Some(ptr) => {
                self.stats.fallback_allocs.fetch_add(1, Ordering::Relaxed);
                Ok(ptr)
            }
            None => {
                warn!(
                    "fallback allocator returned null for {} elements ({} bytes)",
                    count,
                    layout.size()
                );
                Err(Error::FallbackFailed { count })
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator
    /// with the same `count`, and must not have been freed since.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        if count == 0 {
            return;
        }
        if count == 1 && self.manager.owns(ptr.as_ptr()) {
            match unsafe { self.manager.free(ptr) } {
                Ok(()) => {
                    self.stats.slab_frees.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => error!("dropping bad slab free of {:p}: {}", ptr, e),
            }
            return;
        }
        unsafe { self.deallocate_fallback(ptr, count) };
    }

    #[cold]
    #[inline(never)]
    unsafe fn deallocate_fallback(&self, ptr: NonNull<T>, count: usize) {
        // allocate() only hands out fallback memory for layouts that exist.
        let Ok(layout) = Layout::array::<T>(count) else {
            error!("dropping fallback free of {:p}: bad count {}", ptr, count);
            return;
        };
        unsafe { self.fallback.dealloc(ptr.as_ptr().cast(), layout) };
        self.stats.fallback_frees.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters kept by a [`SlabAllocator`].
///
/// The histogram counts requests by element count; the last bucket also
/// collects every larger request.
pub struct AllocStats {
    slab_allocs: AtomicU64,
    fallback_allocs: AtomicU64,
    slab_frees: AtomicU64,
    fallback_frees: AtomicU64,
    histogram: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl AllocStats {
    pub const fn new() -> Self {
        Self {
            slab_allocs: AtomicU64::new(0),
            fallback_allocs: AtomicU64::new(0),
            slab_frees: AtomicU64::new(0),
            fallback_frees: AtomicU64::new(0),
            histogram: [const { AtomicU64::new(0) }; HISTOGRAM_BUCKETS],
        }
    }

    #[inline(always)]
    fn record_request(&self, count: usize) {
        let bucket = count.min(HISTOGRAM_BUCKETS - 1);
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn slab_allocs(&self) -> u64 {
        self.slab_allocs.load(Ordering::Relaxed)
    }

    pub fn fallback_allocs(&self) -> u64 {
        self.fallback_allocs.load(Ordering::Relaxed)
    }

    pub fn slab_frees(&self) -> u64 {
        self.slab_frees.load(Ordering::Relaxed)
    }

    pub fn fallback_frees(&self) -> u64 {
        self.fallback_frees.load(Ordering::Relaxed)
    }

    pub fn requests_of(&self, count: usize) -> u64 {
        self.histogram[count.min(HISTOGRAM_BUCKETS - 1)].load(Ordering::Relaxed)
    }

    /// Non-empty `(count, requests)` buckets in ascending order.
    pub fn histogram(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.histogram
            .iter()
            .enumerate()
            .map(|(count, n)| (count, n.load(Ordering::Relaxed)))
            .filter(|&(_, n)| n != 0)
    }

    /// Share of non-empty allocations served by the fallback.
    pub fn fallback_rate(&self) -> f64 {
        let slab = self.slab_allocs();
        let fallback = self.fallback_allocs();
        match slab + fallback {
            0 => 0.0,
            total => fallback as f64 / total as f64,
        }
    }
}

impl Default for AllocStats {
    fn default() -> Self {
        Self::new()
    }
}
