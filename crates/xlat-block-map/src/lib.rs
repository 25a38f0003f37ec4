//! Guest-address bookkeeping for translated code.
//!
//! The guest address space is cut into fixed power-of-two slices (64 KiB by default). Each slice
//! that has seen a translation owns a [`RegionBlockList`] holding the [`BlockDescriptor`]s whose
//! guest start lies inside it. [`BlockMap::lookup`] goes from an arbitrary guest address to that
//! list with a couple of atomic loads and no locks.
//!
//! # Invalidation
//! Self-modifying code is detected through page permissions: guest pages backing translations are
//! kept read+execute ([`BlockMap::protect`]). A write faults, and the fault handler calls
//! [`BlockMap::unprotect`], which restores write access and *soft*-invalidates the page.
//!
//! Soft invalidation never touches list structure. Every list keeps a version stamp per guest
//! page; marking a page stores a fresh stamp from a map-wide epoch counter. A descriptor records
//! the stamps of the pages it covers when it is committed and is valid only while all of them
//! still match. This keeps the fault path to atomic stores, and lets unchanged code be
//! re-validated ([`BlockMap::revalidate`]) instead of re-translated.
//!
//! Hard invalidation ([`BlockMap::invalidate_range`] with `destroy = true`) removes descriptors
//! and, once the last reference to a descriptor is gone, returns its executable memory to the
//! allocator. It runs under the map's structural lock.
//!
//! # Concurrency
//! - Lock-free: [`BlockMap::lookup`], [`BlockMap::protect`], [`BlockMap::unprotect`], soft
//!   invalidation, [`BlockMap::is_valid`].
//! - Structural lock: [`BlockMap::register_range`], [`BlockMap::commit_block`], destructive
//!   invalidation, [`BlockMap::clear`].
//!
//! A block may be marked invalid immediately after it is committed if a fault races the commit;
//! callers must check [`BlockMap::is_valid`] before running a cached block.

mod error;
mod map;
mod protect;
mod region;
mod table;

pub use error::{BlockMapError, Result};
pub use map::{BlockMap, BlockMapConfig};
pub use region::{BlockDescriptor, PageStamp, RegionBlockList};
