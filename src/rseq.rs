//! Core-local critical sections: optimistic claim, validate, commit or abort.
//!
//! A [`SectionCell`] guards a value with a sequence word. An even word is
//! open; an odd word is held by exactly one thread. One attempt reads the
//! current core and the word (READ_CURRENT), claims the word with a single
//! CAS and re-checks that the thread is still on the same core (VALIDATE),
//! then either publishes `start + 2` on exit (COMMIT) or restores `start`
//! (ABORT). A failed CAS or a migration aborts the attempt; nothing ever
//! waits on a held word. [`with_retries`] bounds the number of attempts and
//! reports [`GiveUp`] so the caller can take a slower path.
//!
//! Core ids come from `sched_getcpu` when the `percpu` feature is enabled on
//! Linux. Otherwise each thread is given a stable pseudo core id, so the
//! migration check never fires and sections degrade to per-thread lanes.

use crate::geometry::CORE_SLOTS;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

#[cold]
#[inline(never)]
fn next_thread_slot() -> usize {
    NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed)
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static mut THREAD_SLOT: usize = usize::MAX;

        #[inline(always)]
        fn thread_slot() -> usize {
            let slot = unsafe { THREAD_SLOT };
            if slot != usize::MAX {
                return slot;
            }
            let slot = next_thread_slot();
            unsafe { THREAD_SLOT = slot };
            slot
        }
    } else {
        use core::cell::Cell;

        std::thread_local! {
            static THREAD_SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
        }

        #[inline(always)]
        fn thread_slot() -> usize {
            THREAD_SLOT
                .try_with(|cell| {
                    let slot = cell.get();
                    if slot != usize::MAX {
                        return slot;
                    }
                    let slot = next_thread_slot();
                    cell.set(slot);
                    slot
                })
                // TLS already torn down on this thread; any lane is correct.
                .unwrap_or(0)
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(feature = "percpu", target_os = "linux"))] {
        #[inline(always)]
        fn current_cpu() -> usize {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 { cpu as usize } else { thread_slot() }
        }
    } else {
        #[inline(always)]
        fn current_cpu() -> usize {
            thread_slot()
        }
    }
}

/// Identity of the core (or pseudo core) the calling thread runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoreId(usize);

impl CoreId {
    #[inline(always)]
    pub fn current() -> Self {
        Self(current_cpu())
    }

    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// Position of this core in a table of [`CORE_SLOTS`] entries.
    #[inline(always)]
    pub const fn slot(self) -> usize {
        self.0 & (CORE_SLOTS - 1)
    }
}

/// Why one attempt did not reach COMMIT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Abort {
    /// Another thread holds the section or changed it since it was read.
    Contended,
    /// The thread changed cores between READ_CURRENT and VALIDATE.
    Migrated,
}

/// Every attempt aborted; take the slower shared path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GiveUp {
    pub attempts: u32,
}

/// A value that is mutated only from inside a claimed section.
pub struct SectionCell<V> {
    seq: AtomicU64,
    value: UnsafeCell<V>,
}

// SAFETY: `value` is only reachable through a `Section`, and at most one
// `Section` exists per cell at a time (the sequence word is odd while held).
unsafe impl<V: Send> Sync for SectionCell<V> {}

impl<V> SectionCell<V> {
    pub const fn new(value: V) -> Self {
        Self {
            seq: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Number of committed sections so far.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.seq.load(Ordering::Acquire) >> 1
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.seq.load(Ordering::Relaxed) & 1 == 1
    }

    /// One attempt at claiming the section for `core`.
    #[inline]
    pub fn enter(&self, core: CoreId) -> Result<Section<'_, V>, Abort> {
        let start = self.seq.load(Ordering::Relaxed);
        if start & 1 != 0 {
            return Err(Abort::Contended);
        }
        if self
            .seq
            .compare_exchange(start, start + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Abort::Contended);
        }
        if CoreId::current() != core {
            self.seq.store(start, Ordering::Release);
            return Err(Abort::Migrated);
        }
        Ok(Section { cell: self, start })
    }

    pub fn into_inner(self) -> V {
        self.value.into_inner()
    }
}

/// A claimed section. Dropping it commits.
pub struct Section<'a, V> {
    cell: &'a SectionCell<V>,
    start: u64,
}

impl<V> Section<'_, V> {
    /// Generation observed when the section was claimed.
    pub fn generation(&self) -> u64 {
        self.start >> 1
    }

    /// Leave without advancing the generation. Only valid when the value
    /// was not modified.
    pub fn abort(self) {
        self.cell.seq.store(self.start, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<V> Deref for Section<'_, V> {
    type Target = V;

    #[inline(always)]
    fn deref(&self) -> &V {
        unsafe { &*self.cell.value.get() }
    }
}

impl<V> DerefMut for Section<'_, V> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut V {
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<V> Drop for Section<'_, V> {
    #[inline(always)]
    fn drop(&mut self) {
        self.cell.seq.store(self.start + 2, Ordering::Release);
    }
}

/// Run `attempt` against the current core until it commits or `limit`
/// attempts have aborted.
#[inline]
pub fn with_retries<R>(
    limit: u32,
    mut attempt: impl FnMut(CoreId) -> Result<R, Abort>,
) -> Result<R, GiveUp> {
    for _ in 0..limit {
        match attempt(CoreId::current()) {
            Ok(r) => return Ok(r),
            Err(_) => core::hint::spin_loop(),
        }
    }
    Err(GiveUp { attempts: limit })
}
