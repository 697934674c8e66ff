//! Backing memory: one contiguous, never-resized block of `T` slots.
//!
//! Ownership of a pointer is a half-open address-range test against this
//! block. Slot indices are recovered with the constant stride divisor.

use crate::const_arith::{Divisor64, Multiplier64};
use crate::error::{Error, Result};
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ops::Range;
use core::ptr::NonNull;
use std::alloc::{self, Layout};

/// Regions start on a cache line so leaf slabs do not share a line with
/// unrelated data.
const REGION_ALIGN: usize = 64;

pub struct Region<T> {
    base: NonNull<T>,
    slots: usize,
    layout: Layout,
    _slots: PhantomData<T>,
}

// SAFETY: the region is raw storage; it never reads or drops a `T`.
unsafe impl<T: Send> Send for Region<T> {}
unsafe impl<T: Send> Sync for Region<T> {}

impl<T> Region<T> {
    /// Slot stride. A zero-sized `T` fails here at compile time.
    pub const STRIDE: Divisor64 = Divisor64::new(size_of::<T>() as u64);
    pub const STRIDE_MUL: Multiplier64 = Multiplier64::new(size_of::<T>() as u64);

    pub fn new(slots: usize) -> Result<Self> {
        let _ = Self::STRIDE;
        let bytes = size_of::<T>()
            .checked_mul(slots)
            .ok_or(Error::OutOfMemory { bytes: usize::MAX })?;
        let layout = Layout::from_size_align(bytes, align_of::<T>().max(REGION_ALIGN))
            .map_err(|_| Error::OutOfMemory { bytes })?;
        if bytes == 0 {
            return Err(Error::OutOfMemory { bytes });
        }
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw.cast::<T>()).ok_or(Error::OutOfMemory { bytes })?;
        Ok(Self {
            base,
            slots,
            layout,
            _slots: PhantomData,
        })
    }

    #[inline(always)]
    pub fn base(&self) -> NonNull<T> {
        self.base
    }

    #[inline(always)]
    pub fn bytes(&self) -> usize {
        self.layout.size()
    }

    /// `[&m, &m + 1)` as addresses.
    #[inline(always)]
    pub fn addr_range(&self) -> Range<usize> {
        let start = self.base.as_ptr().addr();
        start..start + self.layout.size()
    }

    /// Address range covering `count` slots starting at `first`.
    #[inline]
    pub fn slot_addr_range(&self, first: usize, count: usize) -> Range<usize> {
        let start = self.base.as_ptr().addr() + Self::STRIDE_MUL.mul_usize(first);
        start..start + Self::STRIDE_MUL.mul_usize(count)
    }

    #[inline(always)]
    pub fn owns(&self, ptr: *const T) -> bool {
        self.addr_range().contains(&ptr.addr())
    }

    /// Index of the slot `ptr` points at.
    #[inline]
    pub fn slot_of(&self, ptr: *const T) -> Result<usize> {
        let addr = ptr.addr();
        let range = self.addr_range();
        if !range.contains(&addr) {
            return Err(Error::Foreign { addr });
        }
        let (slot, rem) = Self::STRIDE.div_rem_usize(addr - range.start);
        if rem != 0 {
            return Err(Error::Misaligned { addr });
        }
        Ok(slot)
    }

    #[inline(always)]
    pub fn slot_ptr(&self, slot: usize) -> NonNull<T> {
        debug_assert!(slot < self.slots);
        unsafe { self.base.byte_add(Self::STRIDE_MUL.mul_usize(slot)) }
    }
}

impl<T> Drop for Region<T> {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr().cast(), self.layout) };
    }
}
