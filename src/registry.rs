//! Process-wide default manager.
//!
//! Most code should pass a [`SlabManager`] (or a
//! [`SlabAllocator`](crate::SlabAllocator)) explicitly. The registry exists
//! for deallocation sites that carry no allocator context: one manager is
//! installed during start-up and is read-only from then on.

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::manager::SlabManager;
use core::any::{Any, type_name};
use log::info;
use std::sync::OnceLock;

static DEFAULT: OnceLock<&'static (dyn Any + Send + Sync)> = OnceLock::new();

/// Install `manager` as the default. Fails if any manager was installed
/// before.
pub fn install<T: Send + 'static, G: Geometry>(manager: &'static SlabManager<T, G>) -> Result<()> {
    DEFAULT.set(manager).map_err(|_| Error::AlreadyInstalled)?;
    info!(
        "installed default slab manager for {} ({} slots)",
        type_name::<T>(),
        manager.capacity()
    );
    Ok(())
}

/// The default manager, if one with exactly this element type and geometry
/// was installed.
pub fn installed<T: Send + 'static, G: Geometry>() -> Option<&'static SlabManager<T, G>> {
    DEFAULT.get().copied()?.downcast_ref()
}
