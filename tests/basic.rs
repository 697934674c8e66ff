//! Basic integration test: single-threaded allocate/free traffic against a
//! slab manager and the fallback-backed allocator.

use coreslab::{Error, Shape, SlabAllocator, SlabManager};
use std::collections::HashSet;
use std::ptr::NonNull;

type Record = [u8; 24];
type Tree = Shape<8, 4, 2>;

const CAPACITY: usize = 8 * 4 * 4;

#[test]
fn test_round_trip_reuse() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    let p = manager.allocate().unwrap();
    unsafe { manager.free(p).unwrap() };
    let q = manager.allocate().unwrap();
    assert_eq!(p, q);
    unsafe { manager.free(q).unwrap() };
    assert_eq!(manager.available(), CAPACITY);
}

#[test]
fn test_every_pointer_is_contained() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    assert_eq!(manager.capacity(), CAPACITY);
    let ptrs: Vec<_> = (0..CAPACITY).map(|_| manager.allocate().unwrap()).collect();
    let region = manager.tree().region().addr_range();
    for p in &ptrs {
        assert!(manager.owns(p.as_ptr()));
        assert!(region.contains(&p.as_ptr().addr()));
        assert_eq!((p.as_ptr().addr() - region.start) % size_of::<Record>(), 0);
    }
    assert_eq!(ptrs.iter().collect::<HashSet<_>>().len(), CAPACITY);
}

#[test]
fn test_exhaustion_correctness() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    let ptrs: Vec<_> = (0..CAPACITY).map(|_| manager.allocate().unwrap()).collect();
    assert_eq!(manager.allocate(), Err(Error::Exhausted));
    assert_eq!(manager.allocate(), Err(Error::Exhausted));
    unsafe { manager.free(ptrs[CAPACITY / 2]).unwrap() };
    assert_eq!(manager.allocate(), Ok(ptrs[CAPACITY / 2]));
    assert_eq!(manager.allocate(), Err(Error::Exhausted));
}

#[test]
fn test_freed_slots_keep_contents() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    let p = manager.allocate().unwrap();
    unsafe {
        p.as_ptr().write([0xab; 24]);
        manager.free(p).unwrap();
        assert_eq!(p.as_ptr().read(), [0xab; 24]);
    }
}

#[test]
fn test_foreign_free_does_not_mutate() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    let held: Vec<_> = (0..10).map(|_| manager.allocate().unwrap()).collect();
    let before = manager.available();

    let boxed = Box::new([0u8; 24]);
    let foreign = NonNull::from(Box::leak(boxed));
    let end = unsafe { manager.tree().region().base().add(CAPACITY) };
    for p in [foreign, end] {
        assert!(!manager.owns(p.as_ptr()));
        assert_eq!(
            unsafe { manager.free(p) },
            Err(Error::Foreign { addr: p.as_ptr().addr() })
        );
    }
    assert_eq!(manager.available(), before);
    drop(unsafe { Box::from_raw(foreign.as_ptr()) });

    for p in held {
        unsafe { manager.free(p).unwrap() };
    }
    assert_eq!(manager.available(), CAPACITY);
}

#[test]
fn test_free_batch_matches_single_frees() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    let ptrs: Vec<_> = (0..CAPACITY).map(|_| manager.allocate().unwrap()).collect();
    let (odd, even): (Vec<_>, Vec<_>) = ptrs.iter().enumerate().partition(|(i, _)| i % 2 == 1);
    let odd: Vec<_> = odd.into_iter().map(|(_, p)| *p).collect();

    let released = unsafe { manager.free_batch(&odd, |p, e| panic!("{:p} rejected: {}", p, e)) };
    assert_eq!(released, CAPACITY / 2);
    for (_, p) in even {
        unsafe { manager.free(*p).unwrap() };
    }
    assert_eq!(manager.available(), CAPACITY);
    for leaf in 0..manager.tree().leaf_count() {
        assert_eq!(manager.tree().leaf(leaf).available(), 8);
    }
}

#[test]
fn test_allocator_fallback_and_stats() {
    let manager = SlabManager::<Record, Tree>::new().unwrap();
    let alloc = SlabAllocator::new(&manager);

    let mut singles: Vec<_> = (0..CAPACITY + 5).map(|_| alloc.allocate(1).unwrap()).collect();
    let array = alloc.allocate(4).unwrap();
    unsafe { array.as_ptr().write_bytes(0x11, 4) };
    assert!(!manager.owns(array.as_ptr()));
    assert_eq!(manager.available(), 0);

    let stats = alloc.stats();
    assert_eq!(stats.slab_allocs(), CAPACITY as u64);
    assert_eq!(stats.fallback_allocs(), 6);
    assert_eq!(stats.requests_of(1), CAPACITY as u64 + 5);
    assert_eq!(stats.histogram().collect::<Vec<_>>(), [(1, CAPACITY as u64 + 5), (4, 1)]);

    unsafe { alloc.deallocate(array, 4) };
    for p in singles.drain(..) {
        unsafe { alloc.deallocate(p, 1) };
    }
    assert_eq!(stats.slab_frees(), CAPACITY as u64);
    assert_eq!(stats.fallback_frees(), 6);
    assert_eq!(manager.available(), CAPACITY);
}

/// A chained set of keys whose nodes live in the slab.
struct Node {
    key: u64,
    next: Option<NonNull<Node>>,
}

#[test]
fn test_chained_set_workload() {
    const BUCKETS: usize = 16;
    let manager = SlabManager::<Node, Shape<16, 2, 3>>::new().unwrap();
    let alloc = SlabAllocator::new(&manager);
    let mut buckets: [Option<NonNull<Node>>; BUCKETS] = [None; BUCKETS];

    for key in 0..200u64 {
        let node = alloc.allocate(1).unwrap();
        let bucket = coreslab::const_arith::rem_u64::<{ BUCKETS as u64 }>(key) as usize;
        unsafe { node.as_ptr().write(Node { key, next: buckets[bucket] }) };
        buckets[bucket] = Some(node);
    }
    assert_eq!(alloc.stats().fallback_allocs(), 200 - 128);

    let mut seen = 0;
    for (bucket, head) in buckets.iter_mut().enumerate() {
        while let Some(node) = *head {
            let Node { key, next } = unsafe { node.as_ptr().read() };
            assert_eq!(key as usize % BUCKETS, bucket);
            unsafe { alloc.deallocate(node, 1) };
            *head = next;
            seen += 1;
        }
    }
    assert_eq!(seen, 200);
    assert_eq!(manager.available(), 128);
}
