use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::arena::Arena;
use crate::host::{HostMemory, MemoryProvider};
use crate::{ExecMemError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecMemConfig {
    /// Size of each arena obtained from the OS. Requests larger than this get a dedicated mapping.
    pub arena_size: usize,
    /// Sub-allocation granularity; every returned address is aligned to it.
    pub granularity: usize,
}

impl Default for ExecMemConfig {
    fn default() -> Self {
        Self {
            arena_size: 4 * 1024 * 1024,
            granularity: 256,
        }
    }
}

impl ExecMemConfig {
    pub fn validate(&self) -> Result<()> {
        if self.granularity == 0 || !self.granularity.is_power_of_two() {
            return Err(ExecMemError::InvalidConfig(
                "granularity must be a non-zero power of two",
            ));
        }
        if self.arena_size == 0 || self.arena_size % self.granularity != 0 {
            return Err(ExecMemError::InvalidConfig(
                "arena_size must be a non-zero multiple of granularity",
            ));
        }
        Ok(())
    }

    pub fn sub_blocks_per_arena(&self) -> usize {
        self.arena_size / self.granularity
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecMemStats {
    pub arenas: usize,
    /// Bytes handed out from arenas, in whole sub-blocks.
    pub used_bytes: usize,
    pub oversized: usize,
    pub oversized_bytes: usize,
}

#[derive(Default)]
struct AllocatorState {
    /// Append-only while the allocator is live: arena indices never change.
    arenas: Vec<Arena>,
    /// Dedicated mappings for requests larger than an arena, keyed by base address.
    oversized: BTreeMap<usize, usize>,
}

/// Bitmap sub-allocator over read/write/execute arenas.
///
/// All arena mutations, including growth of the arena set, happen under one allocator-wide lock.
pub struct ExecAllocator {
    config: ExecMemConfig,
    provider: Arc<dyn MemoryProvider>,
    state: Mutex<AllocatorState>,
    oom_reported: AtomicBool,
}

impl ExecAllocator {
    pub fn new(config: ExecMemConfig) -> Result<Self> {
        Self::with_provider(config, Arc::new(HostMemory))
    }

    pub fn with_provider(config: ExecMemConfig, provider: Arc<dyn MemoryProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            state: Mutex::new(AllocatorState::default()),
            oom_reported: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ExecMemConfig {
        &self.config
    }

    /// Allocates `size` bytes of executable memory and returns its address.
    ///
    /// Arena-sized and smaller requests are rounded up to whole sub-blocks and placed in the first
    /// free run found, scanning arenas in creation order. A new arena is appended only when no
    /// existing arena has a long enough run. Mapping failures are reported, never retried.
    pub fn allocate(&self, size: usize) -> Result<usize> {
        if size > self.config.arena_size {
            return self.allocate_oversized(size);
        }
        let blocks = self.sub_blocks_for(size);

        let mut state = self.lock_state();
        for arena in state.arenas.iter_mut() {
            if let Some(addr) = arena.try_alloc(blocks) {
                return Ok(addr);
            }
        }

        let index = state.arenas.len();
        let base = self.map(self.config.arena_size)?;
        debug!(
            arena = index,
            base = format_args!("{base:#x}"),
            "created executable arena"
        );
        let mut arena = Arena::new(base, self.config.arena_size, self.config.granularity);
        let addr = arena
            .try_alloc(blocks)
            .ok_or(ExecMemError::SizeOverflow { len: size })?;
        state.arenas.push(arena);
        Ok(addr)
    }

    /// Releases memory obtained from [`ExecAllocator::allocate`] with the same `size`.
    ///
    /// Returns whether anything was released. Unknown addresses are ignored.
    pub fn free(&self, addr: usize, size: usize) -> bool {
        if size > self.config.arena_size {
            return self.free_oversized(addr, size);
        }
        let blocks = self.sub_blocks_for(size);

        let mut state = self.lock_state();
        match state
            .arenas
            .iter_mut()
            .find(|arena| arena.contains(addr, blocks))
        {
            Some(arena) => arena.release(addr, blocks),
            None => {
                debug!(
                    addr = format_args!("{addr:#x}"),
                    size, "free of untracked executable memory ignored"
                );
                false
            }
        }
    }

    /// Allocates an owned block that returns its memory to this allocator when dropped.
    pub fn allocate_block(self: &Arc<Self>, size: usize) -> Result<ExecBlock> {
        let addr = self.allocate(size)?;
        Ok(ExecBlock {
            allocator: Arc::clone(self),
            addr,
            size,
        })
    }

    /// Unmaps every arena and oversized mapping. Outstanding [`ExecBlock`]s become dangling and
    /// their drop is a no-op.
    pub fn release_all(&self) -> ExecMemStats {
        let mut state = self.lock_state();
        let released = self.stats_of(&state);
        for arena in std::mem::take(&mut state.arenas) {
            self.unmap(arena.base(), arena.size());
        }
        for (addr, len) in std::mem::take(&mut state.oversized) {
            self.unmap(addr, len);
        }
        if released.arenas != 0 || released.oversized != 0 {
            debug!(
                arenas = released.arenas,
                oversized = released.oversized,
                "released executable memory"
            );
        }
        released
    }

    pub fn stats(&self) -> ExecMemStats {
        self.stats_of(&self.lock_state())
    }

    pub fn arena_count(&self) -> usize {
        self.lock_state().arenas.len()
    }

    pub fn arena_base(&self, index: usize) -> Option<usize> {
        self.lock_state().arenas.get(index).map(Arena::base)
    }

    pub fn used_sub_blocks(&self, index: usize) -> Option<usize> {
        self.lock_state()
            .arenas
            .get(index)
            .map(Arena::used_sub_blocks)
    }

    pub fn is_sub_block_used(&self, index: usize, sub_block: usize) -> bool {
        self.lock_state()
            .arenas
            .get(index)
            .is_some_and(|arena| arena.is_sub_block_used(sub_block))
    }

    pub fn oversized_count(&self) -> usize {
        self.lock_state().oversized.len()
    }

    /// Number of sub-blocks a request of `size` bytes occupies. Zero-byte requests still take one
    /// sub-block so live allocations never share an address.
    pub fn sub_blocks_for(&self, size: usize) -> usize {
        size.div_ceil(self.config.granularity).max(1)
    }

    fn allocate_oversized(&self, size: usize) -> Result<usize> {
        let addr = self.map(size)?;
        self.lock_state().oversized.insert(addr, size);
        debug!(
            addr = format_args!("{addr:#x}"),
            size, "mapped oversized executable block"
        );
        Ok(addr)
    }

    fn free_oversized(&self, addr: usize, size: usize) -> bool {
        let mut state = self.lock_state();
        let tracked = state.oversized.get(&addr).copied();
        match tracked {
            Some(len) if len == size => {
                state.oversized.remove(&addr);
                drop(state);
                self.unmap(addr, len);
                true
            }
            _ => {
                debug!(
                    addr = format_args!("{addr:#x}"),
                    size, "free of untracked oversized mapping ignored"
                );
                false
            }
        }
    }

    fn map(&self, len: usize) -> Result<usize> {
        match self.provider.map(len) {
            Ok(ptr) => Ok(ptr.as_ptr() as usize),
            Err(source) => {
                // Report the first failure loudly; the translator decides what happens next.
                if !self.oom_reported.swap(true, Ordering::Relaxed) {
                    warn!(len, error = %source, "cannot map executable memory");
                } else {
                    debug!(len, error = %source, "cannot map executable memory");
                }
                Err(ExecMemError::OutOfMemory { len, source })
            }
        }
    }

    fn unmap(&self, addr: usize, len: usize) {
        if let Some(ptr) = NonNull::new(addr as *mut u8) {
            // SAFETY: every tracked address came from `self.provider.map(len)` and is removed from
            // the tracking state before being unmapped, so it is released exactly once.
            unsafe { self.provider.unmap(ptr, len) };
        }
    }

    fn stats_of(&self, state: &AllocatorState) -> ExecMemStats {
        ExecMemStats {
            arenas: state.arenas.len(),
            used_bytes: state
                .arenas
                .iter()
                .map(|a| a.used_sub_blocks() * self.config.granularity)
                .sum(),
            oversized: state.oversized.len(),
            oversized_bytes: state.oversized.values().sum(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AllocatorState> {
        // Every critical section leaves the bitmaps consistent, so a poisoned lock is still usable.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for ExecAllocator {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for ExecAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Executable memory owned by a translated block.
///
/// Dropping it returns the memory to the allocator it came from.
pub struct ExecBlock {
    allocator: Arc<ExecAllocator>,
    addr: usize,
    size: usize,
}

impl ExecBlock {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// View of the block's bytes, for emitting code into it.
    ///
    /// # Safety
    /// The owning allocator must not have been torn down with [`ExecAllocator::release_all`],
    /// and no other thread may be executing or writing the block concurrently.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr(), self.size)
    }
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        self.allocator.free(self.addr, self.size);
    }
}

impl fmt::Debug for ExecBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecBlock")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .finish()
    }
}
