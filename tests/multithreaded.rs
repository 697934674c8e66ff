//! Multi-threaded integration test.

use coreslab::{Error, Shape, SlabAllocator, SlabManager};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

type Small = Shape<4, 2, 2>;

fn ptr_of(addr: usize) -> NonNull<u64> {
    NonNull::new(addr as *mut u64).unwrap()
}

/// Each of `threads` threads allocates `each` slots after a common start.
/// Addresses are returned because `NonNull` is not `Send`.
fn allocate_concurrently<G: coreslab::Geometry>(
    manager: &SlabManager<u64, G>,
    threads: usize,
    each: usize,
) -> Vec<Result<usize, Error>> {
    let barrier = Barrier::new(threads);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    (0..each)
                        .map(|_| manager.allocate().map(|p| p.as_ptr().addr()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_four_threads_sixteen_slots() {
    let manager = SlabManager::<u64, Small>::new().unwrap();
    for _ in 0..20 {
        let addrs: Vec<usize> = allocate_concurrently(&manager, 4, 4)
            .into_iter()
            .map(|r| r.expect("no exhaustion with exactly sixteen requests"))
            .collect();
        assert_eq!(addrs.len(), 16);
        assert_eq!(addrs.iter().collect::<HashSet<_>>().len(), 16);
        assert!(addrs.iter().all(|&a| manager.owns(a as *const u64)));
        assert_eq!(manager.allocate(), Err(Error::Exhausted));
        for addr in addrs {
            unsafe { manager.free(ptr_of(addr)).unwrap() };
        }
        assert_eq!(manager.available(), 16);
    }
}

#[test]
fn test_no_double_issue_past_capacity() {
    type Wide = Shape<32, 4, 2>;
    const CAPACITY: usize = 32 * 16;
    let manager = SlabManager::<u64, Wide>::new().unwrap();
    let results = allocate_concurrently(&manager, 8, CAPACITY / 4);
    let granted: Vec<usize> = results.iter().filter_map(|r| r.ok()).collect();
    assert!(granted.len() <= CAPACITY);
    assert_eq!(granted.iter().collect::<HashSet<_>>().len(), granted.len());
    assert!(results.iter().all(|r| matches!(r, Ok(_) | Err(Error::Exhausted))));
}

#[test]
fn test_cross_thread_free() {
    // Allocate on producer threads, free on one consumer.
    let num_threads = 4;
    let manager = Arc::new(SlabManager::<u64, Shape<64, 4, 1>>::new().unwrap());
    let (tx, rx) = std::sync::mpsc::channel::<Vec<usize>>();

    let producers: Vec<_> = (0..num_threads)
        .map(|t| {
            let tx = tx.clone();
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let mut items = Vec::new();
                while items.len() < 50 {
                    if let Ok(p) = manager.allocate() {
                        unsafe { p.as_ptr().write(t as u64) };
                        items.push(p.as_ptr().addr());
                    }
                }
                tx.send(items).unwrap();
            })
        })
        .collect();
    drop(tx);

    let consumer = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            let mut freed = 0;
            for items in rx {
                for addr in items {
                    let p = ptr_of(addr);
                    assert!(unsafe { p.as_ptr().read() } < 4);
                    unsafe { manager.free(p).unwrap() };
                    freed += 1;
                }
            }
            freed
        })
    };

    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(consumer.join().unwrap(), num_threads * 50);
    assert_eq!(manager.available(), manager.capacity());
}

#[test]
fn test_concurrent_churn() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 5000;
    let manager = SlabManager::<u64, Shape<16, 4, 2>>::new().unwrap();
    let live = Mutex::new(HashSet::new());
    let exhausted = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let (manager, live, exhausted, barrier) = (&manager, &live, &exhausted, &barrier);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xc0de + t as u64);
                let mut held: Vec<usize> = Vec::new();
                barrier.wait();
                for _ in 0..ROUNDS {
                    if held.is_empty() || rng.next_u32() % 3 != 0 {
                        match manager.allocate() {
                            Ok(p) => {
                                let addr = p.as_ptr().addr();
                                assert!(live.lock().unwrap().insert(addr), "slot issued twice");
                                held.push(addr);
                            }
                            Err(Error::Exhausted) => {
                                exhausted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => panic!("unexpected {}", e),
                        }
                    } else {
                        let i = rng.next_u32() as usize % held.len();
                        let addr = held.swap_remove(i);
                        assert!(live.lock().unwrap().remove(&addr));
                        unsafe { manager.free(ptr_of(addr)).unwrap() };
                    }
                }
                for addr in held {
                    assert!(live.lock().unwrap().remove(&addr));
                    unsafe { manager.free(ptr_of(addr)).unwrap() };
                }
            });
        }
    });

    assert!(live.lock().unwrap().is_empty());
    assert_eq!(manager.available(), manager.capacity());
}

#[test]
fn test_shared_allocator_handle() {
    let manager = SlabManager::<u64, Small>::new().unwrap();
    let alloc = SlabAllocator::new(&manager);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..1000 {
                    let p = alloc.allocate(1).unwrap();
                    unsafe { alloc.deallocate(p, 1) };
                }
            });
        }
    });
    let stats = alloc.stats();
    assert_eq!(stats.slab_allocs() + stats.fallback_allocs(), 4000);
    assert_eq!(stats.slab_frees() + stats.fallback_frees(), 4000);
    assert_eq!(manager.available(), 16);
}
