//! Compile-time shape of the slab tree and the allocator's tuning constants.
//!
//! A tree has `DEPTH` levels of super-slabs, each node owning `FANOUT`
//! children, above `FANOUT^DEPTH` leaf slabs of `SLAB_CAPACITY` slots.
//! With `DEPTH = 0` the root is a single slab.

/// Deepest supported tree (levels of super-slabs above the leaves).
pub const MAX_DEPTH: usize = 8;

/// Number of per-core hint slots. Core ids are folded into this range.
pub const CORE_SLOTS: usize = 256;

/// Attempts of a core-local section before giving up on the fast lane.
pub const SECTION_RETRIES: u32 = 4;

/// Tree rescans allowed while some leaf with free slots is busy.
pub const SLOW_PATH_PASSES: u32 = 64;

/// Buckets in the per-count allocation histogram.
pub const HISTOGRAM_BUCKETS: usize = 256;

const _: () = assert!(CORE_SLOTS.is_power_of_two());
const _: () = assert!(SECTION_RETRIES > 0);

/// Shape of a slab tree, fixed at build time.
pub trait Geometry: 'static {
    /// Slots per leaf slab.
    const SLAB_CAPACITY: usize;
    /// Children per super-slab.
    const FANOUT: usize;
    /// Levels of super-slabs above the leaves.
    const DEPTH: usize;

    const LEAF_COUNT: usize = checked_pow(Self::FANOUT, Self::DEPTH);
    const SLOT_COUNT: usize = checked_product(Self::LEAF_COUNT, Self::SLAB_CAPACITY);

    /// Evaluating this rejects a misconfigured shape at compile time.
    const CHECK: () = {
        assert!(Self::SLAB_CAPACITY > 0, "slab capacity must be non-zero");
        assert!(
            Self::SLAB_CAPACITY < (u32::MAX - 1) as usize,
            "slab capacity must fit 32-bit slot links"
        );
        assert!(Self::FANOUT > 0, "fanout must be non-zero");
        assert!(Self::DEPTH <= MAX_DEPTH, "tree is deeper than MAX_DEPTH");
        assert!(Self::SLOT_COUNT > 0);
    };
}

/// Zero-sized [`Geometry`] carrying its parameters as const generics.
///
/// `Shape<4, 2, 2>` is two levels of binary super-slabs over four-slot
/// slabs: 4 leaves, 16 slots.
#[derive(Clone, Copy, Debug, Default)]
pub struct Shape<const CAPACITY: usize, const FANOUT: usize, const DEPTH: usize>;

impl<const CAPACITY: usize, const FANOUT: usize, const DEPTH: usize> Geometry
    for Shape<CAPACITY, FANOUT, DEPTH>
{
    const SLAB_CAPACITY: usize = CAPACITY;
    const FANOUT: usize = FANOUT;
    const DEPTH: usize = DEPTH;
}

const fn checked_pow(base: usize, exp: usize) -> usize {
    let mut acc = 1usize;
    let mut i = 0;
    while i < exp {
        acc = checked_product(acc, base);
        i += 1;
    }
    acc
}

const fn checked_product(a: usize, b: usize) -> usize {
    match a.checked_mul(b) {
        Some(v) => v,
        None => panic!("slab tree size overflows usize"),
    }
}

/// Leaves under one node at `level` (the leaf level is `G::DEPTH`).
pub const fn leaves_under<G: Geometry>(level: usize) -> usize {
    checked_pow(G::FANOUT, G::DEPTH - level)
}

/// Slots under one node at `level`.
pub const fn slots_under<G: Geometry>(level: usize) -> usize {
    checked_product(leaves_under::<G>(level), G::SLAB_CAPACITY)
}
