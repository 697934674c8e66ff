//! Workloads shared by the benchmarks.

use coreslab::const_arith::Divisor64;
use coreslab::{Geometry, SlabAllocator};
use core::alloc::GlobalAlloc;
use core::ptr::NonNull;

/// Fixed-width record stored by the workloads.
pub type Record = [u8; 32];

/// Node of a [`ChainedSet`] chain.
pub struct Entry {
    key: u64,
    value: Record,
    next: Option<NonNull<Entry>>,
}

/// Chained hash set whose entries are obtained from a [`SlabAllocator`].
pub struct ChainedSet<'a, 'm, G: Geometry, F: GlobalAlloc> {
    alloc: &'a SlabAllocator<'m, Entry, G, F>,
    buckets: Box<[Option<NonNull<Entry>>]>,
    bucket_div: Divisor64,
    len: usize,
}

impl<'a, 'm, G: Geometry, F: GlobalAlloc> ChainedSet<'a, 'm, G, F> {
    pub fn new(alloc: &'a SlabAllocator<'m, Entry, G, F>, buckets: usize) -> Self {
        Self {
            alloc,
            buckets: vec![None; buckets].into_boxed_slice(),
            bucket_div: Divisor64::new(buckets as u64),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn bucket(&self, key: u64) -> usize {
        self.bucket_div.rem(key.wrapping_mul(0x9e37_79b9_7f4a_7c15)) as usize
    }

    pub fn contains(&self, key: u64) -> bool {
        let mut cur = self.buckets[self.bucket(key)];
        while let Some(entry) = cur {
            let entry = unsafe { entry.as_ref() };
            if entry.key == key {
                return true;
            }
            cur = entry.next;
        }
        false
    }

    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: u64) -> bool {
        if self.contains(key) {
            return false;
        }
        let Ok(entry) = self.alloc.allocate(1) else {
            return false;
        };
        let bucket = self.bucket(key);
        let mut value = [0u8; 32];
        value[..8].copy_from_slice(&key.to_le_bytes());
        unsafe {
            entry.as_ptr().write(Entry {
                key,
                value,
                next: self.buckets[bucket],
            })
        };
        self.buckets[bucket] = Some(entry);
        self.len += 1;
        true
    }

    pub fn remove(&mut self, key: u64) -> bool {
        let bucket = self.bucket(key);
        let mut link: *mut Option<NonNull<Entry>> = &mut self.buckets[bucket];
        unsafe {
            while let Some(entry) = *link {
                if (*entry.as_ptr()).key == key {
                    *link = (*entry.as_ptr()).next;
                    debug_assert_eq!((*entry.as_ptr()).value[..8], key.to_le_bytes());
                    self.alloc.deallocate(entry, 1);
                    self.len -= 1;
                    return true;
                }
                link = &mut (*entry.as_ptr()).next;
            }
        }
        false
    }

    pub fn clear(&mut self) {
        for head in self.buckets.iter_mut() {
            while let Some(entry) = *head {
                *head = unsafe { (*entry.as_ptr()).next };
                unsafe { self.alloc.deallocate(entry, 1) };
            }
        }
        self.len = 0;
    }
}

impl<G: Geometry, F: GlobalAlloc> Drop for ChainedSet<'_, '_, G, F> {
    fn drop(&mut self) {
        self.clear();
    }
}
