#![cfg_attr(feature = "nightly", feature(thread_local))]

//! coreslab: a fixed-size-object allocator built from a tree of slabs.
//!
//! Two pieces work together:
//! - A slab hierarchy: leaf slabs of `T` slots under levels of super-slabs,
//!   all carved from one contiguous region. Allocation runs inside a
//!   core-local critical section against the calling core's preferred
//!   leaf and escalates to a tree scan when that leaf is empty.
//! - Constant-divisor arithmetic: division and multiplication by
//!   compile-time constants via magic multipliers, scalar and in 4/8-lane
//!   groups. Slot and leaf lookups on the hot path use it.
//!
//! # Usage
//!
//! ```
//! use coreslab::{Shape, SlabManager};
//!
//! // Two levels of binary super-slabs over four-slot slabs.
//! let manager = SlabManager::<u64, Shape<4, 2, 2>>::new().unwrap();
//! let slot = manager.allocate().unwrap();
//! assert!(manager.owns(slot.as_ptr()));
//! unsafe { manager.free(slot).unwrap() };
//! ```
//!
//! Requests the tree cannot serve are meant for a fallback allocator; see
//! [`SlabAllocator`].

pub mod const_arith;
pub mod vec_arith;
pub mod geometry;
pub mod error;
pub mod rseq;
pub mod region;
pub mod slab;
pub mod super_slab;
pub mod manager;
pub mod allocator;
pub mod registry;

pub use allocator::{AllocStats, SlabAllocator};
pub use error::{Error, Result};
pub use geometry::{Geometry, Shape};
pub use manager::SlabManager;
