use std::fmt;
use std::ops::{Range, RangeInclusive};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use xlat_exec_mem::ExecBlock;

/// Map-wide source of page version stamps.
///
/// Stamps only ever increase, so a list created for a slice after an earlier list for the same
/// slice was destroyed can never reproduce a stamp an old descriptor recorded.
#[derive(Debug)]
pub(crate) struct Epoch(AtomicU64);

impl Epoch {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Version of one guest page as recorded by a descriptor.
#[derive(Debug)]
pub struct PageStamp {
    /// Guest address of the page.
    pub page: u64,
    version: AtomicU64,
}

impl PageStamp {
    pub(crate) fn new(page: u64, version: u64) -> Self {
        Self {
            page,
            version: AtomicU64::new(version),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }
}

/// One translated block: a guest range and the executable memory holding its translation.
pub struct BlockDescriptor {
    guest_start: u64,
    guest_len: u64,
    code: ExecBlock,
    checksum: u64,
    stamps: Box<[PageStamp]>,
    freed: AtomicBool,
}

impl BlockDescriptor {
    pub(crate) fn new(
        guest_start: u64,
        guest_len: u64,
        code: ExecBlock,
        checksum: u64,
        stamps: Box<[PageStamp]>,
    ) -> Self {
        Self {
            guest_start,
            guest_len,
            code,
            checksum,
            stamps,
            freed: AtomicBool::new(false),
        }
    }

    pub fn guest_start(&self) -> u64 {
        self.guest_start
    }

    pub fn guest_len(&self) -> u64 {
        self.guest_len
    }

    /// Exclusive end of the guest range.
    pub fn guest_end(&self) -> u64 {
        self.guest_start.saturating_add(self.guest_len)
    }

    pub fn code(&self) -> &ExecBlock {
        &self.code
    }

    /// Translator-supplied checksum of the guest bytes the block was translated from.
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn stamps(&self) -> &[PageStamp] {
        &self.stamps
    }

    /// Whether the block was removed by hard invalidation.
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn set_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_start && addr < self.guest_end()
    }

    /// Whether `[start, start + len)` intersects the block's guest range.
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len);
        start < self.guest_end() && self.guest_start < end
    }
}

impl fmt::Debug for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDescriptor")
            .field("guest_start", &format_args!("{:#x}", self.guest_start))
            .field("guest_len", &self.guest_len)
            .field("code", &self.code)
            .field("freed", &self.is_freed())
            .finish()
    }
}

/// Translated blocks whose guest start lies in one address slice.
///
/// Structure (the descriptor vector) changes only under the owning map's structural lock. Page
/// versions are atomics and may be bumped from the fault path at any time.
pub struct RegionBlockList {
    start: u64,
    size: u64,
    page_shift: u32,
    epoch: Arc<Epoch>,
    versions: Box<[AtomicU64]>,
    /// Per page: made writable since it was last protected.
    writable: Box<[AtomicBool]>,
    /// Sorted by guest start.
    blocks: RwLock<Vec<Arc<BlockDescriptor>>>,
}

impl RegionBlockList {
    /// Creates a list scoped to `[start, start + size)`. A zero `size` creates an unscoped list
    /// with no page versions (blocks in it are never soft-invalidated).
    pub(crate) fn new(start: u64, size: u64, page_shift: u32, epoch: Arc<Epoch>) -> Self {
        let pages = if size == 0 { 0 } else { (size >> page_shift).max(1) as usize };
        let initial = epoch.next();
        Self {
            start,
            size,
            page_shift,
            epoch,
            versions: (0..pages).map(|_| AtomicU64::new(initial)).collect(),
            writable: (0..pages).map(|_| AtomicBool::new(false)).collect(),
            blocks: RwLock::new(Vec::new()),
        }
    }

    /// The guest span this list is scoped to, inclusive.
    pub fn span(&self) -> RangeInclusive<u64> {
        self.start..=self.end()
    }

    fn end(&self) -> u64 {
        self.start.saturating_add(self.size.saturating_sub(1))
    }

    /// Lowest block start to highest block end, if the list holds any blocks.
    pub fn blocks_span(&self) -> Option<Range<u64>> {
        let blocks = self.read();
        let start = blocks.iter().map(|b| b.guest_start()).min()?;
        let end = blocks.iter().map(|b| b.guest_end()).max()?;
        Some(start..end)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.size != 0 && addr >= self.start && addr <= self.end()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn blocks(&self) -> Vec<Arc<BlockDescriptor>> {
        self.read().clone()
    }

    /// The most recently inserted block among those starting latest at or before `addr` that
    /// covers `addr`.
    pub fn find(&self, addr: u64) -> Option<Arc<BlockDescriptor>> {
        let blocks = self.read();
        let upper = blocks.partition_point(|b| b.guest_start() <= addr);
        blocks[..upper]
            .iter()
            .rev()
            .find(|b| b.contains(addr))
            .cloned()
    }

    pub fn blocks_overlapping(&self, start: u64, len: u64) -> Vec<Arc<BlockDescriptor>> {
        self.read()
            .iter()
            .filter(|b| b.overlaps(start, len))
            .cloned()
            .collect()
    }

    /// Current version of the page holding `addr`, if the page lies inside this list's span.
    pub fn page_version(&self, addr: u64) -> Option<u64> {
        if !self.contains(addr) {
            return None;
        }
        let index = ((addr - self.start) >> self.page_shift) as usize;
        self.versions.get(index).map(|v| v.load(Ordering::Acquire))
    }

    /// Whether any page of this slice was made writable since it was last protected.
    pub fn is_writable(&self) -> bool {
        self.writable.iter().any(|w| w.load(Ordering::Acquire))
    }

    /// Whether the page holding `addr` was made writable since it was last protected.
    pub fn is_page_writable(&self, addr: u64) -> bool {
        self.page_indices(addr, 1)
            .is_some_and(|pages| self.writable[*pages.start()].load(Ordering::Acquire))
    }

    /// Sets the writable flag of every page of `[start, start + len)` inside this list. Lock-free.
    pub(crate) fn set_writable(&self, start: u64, len: u64, writable: bool) {
        if let Some(pages) = self.page_indices(start, len) {
            for flag in &self.writable[pages] {
                flag.store(writable, Ordering::Release);
            }
        }
    }

    /// Clears the writable flag of every page of `[start, start + len)` inside this list and
    /// calls `f(run_start, run_len)` for each run of adjacent pages that had it set.
    ///
    /// Flags are cleared before `f` re-protects the run, so a fault landing in between leaves a
    /// page flagged writable rather than writable but unflagged.
    pub(crate) fn take_writable_runs(&self, start: u64, len: u64, mut f: impl FnMut(u64, u64)) {
        let Some(pages) = self.page_indices(start, len) else {
            return;
        };
        let page_addr = |index: usize| self.start + ((index as u64) << self.page_shift);
        let mut run: Option<usize> = None;
        for index in pages.clone() {
            let was = self.writable[index].swap(false, Ordering::AcqRel);
            match (was, run) {
                (true, None) => run = Some(index),
                (false, Some(first)) => {
                    f(page_addr(first), page_addr(index) - page_addr(first));
                    run = None;
                }
                _ => {}
            }
        }
        if let Some(first) = run {
            let end = page_addr(*pages.end() + 1);
            f(page_addr(first), end - page_addr(first));
        }
    }

    /// Soft-invalidates every block touching a page of `[start, start + len)` inside this list.
    ///
    /// Lock-free and allocation-free; safe from a signal handler.
    pub fn mark_range(&self, start: u64, len: u64) {
        let Some(pages) = self.page_indices(start, len) else {
            return;
        };
        let stamp = self.epoch.next();
        for version in &self.versions[pages] {
            version.store(stamp, Ordering::Release);
        }
    }

    /// Indices of the pages of this list touched by `[start, start + len)`.
    fn page_indices(&self, start: u64, len: u64) -> Option<RangeInclusive<usize>> {
        if len == 0 || self.versions.is_empty() {
            return None;
        }
        let lo = start.max(self.start);
        let hi = start.saturating_add(len - 1).min(self.end());
        if lo > hi {
            return None;
        }
        let first = ((lo - self.start) >> self.page_shift) as usize;
        let last = ((hi - self.start) >> self.page_shift) as usize;
        Some(first..=last.min(self.versions.len() - 1))
    }

    /// Soft-invalidates every page of the list. Lock-free.
    pub fn mark_all(&self) {
        let stamp = self.epoch.next();
        for version in self.versions.iter() {
            version.store(stamp, Ordering::Release);
        }
    }

    pub(crate) fn insert(&self, block: Arc<BlockDescriptor>) {
        let mut blocks = self.write();
        let at = blocks.partition_point(|b| b.guest_start() <= block.guest_start());
        blocks.insert(at, block);
    }

    /// Removes every block overlapping `[start, start + len)`. Memory is released once the last
    /// reference to each removed descriptor is dropped. Returns the number removed.
    pub(crate) fn free_range(&self, start: u64, len: u64) -> usize {
        let removed: Vec<Arc<BlockDescriptor>> = {
            let mut blocks = self.write();
            let (gone, kept): (Vec<_>, Vec<_>) =
                blocks.drain(..).partition(|b| b.overlaps(start, len));
            *blocks = kept;
            gone
        };
        for block in &removed {
            block.set_freed();
        }
        removed.len()
    }

    pub(crate) fn free_all(&self) -> usize {
        let removed = std::mem::take(&mut *self.write());
        for block in &removed {
            block.set_freed();
        }
        removed.len()
    }

    /// Removes one specific descriptor.
    pub(crate) fn remove(&self, block: &Arc<BlockDescriptor>) -> bool {
        let mut blocks = self.write();
        match blocks.iter().position(|b| Arc::ptr_eq(b, block)) {
            Some(at) => {
                let removed = blocks.remove(at);
                drop(blocks);
                removed.set_freed();
                true
            }
            None => false,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<BlockDescriptor>>> {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<BlockDescriptor>>> {
        self.blocks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RegionBlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionBlockList")
            .field("start", &format_args!("{:#x}", self.start))
            .field("size", &format_args!("{:#x}", self.size))
            .field("blocks", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}
