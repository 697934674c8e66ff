//! Error types for the slab allocator.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free slot remains anywhere in the tree. Callers fall back to a
    /// general-purpose allocator.
    #[error("slab tree exhausted")]
    Exhausted,

    /// The pointer lies outside the managed region and belongs to someone
    /// else (usually the fallback allocator).
    #[error("pointer {addr:#x} is not owned by this slab manager")]
    Foreign { addr: usize },

    /// The pointer is inside the managed region but not at a slot boundary.
    #[error("pointer {addr:#x} does not start a slot")]
    Misaligned { addr: usize },

    #[error("failed to reserve {bytes} bytes of slab backing memory")]
    OutOfMemory { bytes: usize },

    #[error("fallback allocator returned null for {count} elements")]
    FallbackFailed { count: usize },

    #[error("layout for {count} elements overflows")]
    LayoutOverflow { count: usize },

    #[error("a default slab manager is already installed")]
    AlreadyInstalled,
}

pub type Result<T> = core::result::Result<T, Error>;
