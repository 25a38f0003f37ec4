use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use xlat_exec_mem::{ExecBlock, Protector};

use crate::error::{BlockMapError, Result};
use crate::region::{BlockDescriptor, Epoch, PageStamp, RegionBlockList};
use crate::table::SliceTable;

/// Widest guest address space the sparse table is built for.
const MAX_GUEST_ADDRESS_BITS: u32 = 48;

/// Above this many slices a range walk visits published lists instead of probing every index.
const DIRECT_WALK_LIMIT: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapConfig {
    /// log2 of the slice size. Defaults to 16 (64 KiB slices).
    pub slice_shift: u32,
    /// Width of the guest address space. Defaults to 32.
    pub guest_address_bits: u32,
}

impl Default for BlockMapConfig {
    fn default() -> Self {
        Self {
            slice_shift: 16,
            guest_address_bits: 32,
        }
    }
}

impl BlockMapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slice_shift < 12 {
            return Err(BlockMapError::InvalidConfig("slice_shift must be at least 12"));
        }
        if self.slice_shift >= self.guest_address_bits {
            return Err(BlockMapError::InvalidConfig(
                "slice_shift must be smaller than guest_address_bits",
            ));
        }
        if self.guest_address_bits > MAX_GUEST_ADDRESS_BITS {
            return Err(BlockMapError::InvalidConfig(
                "guest_address_bits must be at most 48",
            ));
        }
        Ok(())
    }

    pub fn slice_size(&self) -> u64 {
        1 << self.slice_shift
    }

    /// One past the highest guest address.
    pub fn address_limit(&self) -> u64 {
        1 << self.guest_address_bits
    }
}

/// Guest address to translated-code map.
///
/// See the crate docs for the locking split between the lock-free and structural operations.
pub struct BlockMap {
    config: BlockMapConfig,
    protector: Protector,
    page_shift: u32,
    table: SliceTable,
    epoch: Arc<Epoch>,
    largest_block: AtomicU64,
    global: RegionBlockList,
    /// Structural lock. Guards table writes and holds lists detached from the table, which stay
    /// allocated so references returned by [`BlockMap::lookup`] remain valid.
    retired: Mutex<Vec<Box<RegionBlockList>>>,
}

impl BlockMap {
    pub fn new(config: BlockMapConfig, protector: Protector) -> Result<Self> {
        config.validate()?;
        let page_shift = protector.page_size().trailing_zeros().min(config.slice_shift);
        let epoch = Arc::new(Epoch::new());
        Ok(Self {
            table: SliceTable::new(config.guest_address_bits - config.slice_shift),
            global: RegionBlockList::new(0, 0, page_shift, Arc::clone(&epoch)),
            config,
            protector,
            page_shift,
            epoch,
            largest_block: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BlockMapConfig {
        &self.config
    }

    pub fn protector(&self) -> &Protector {
        &self.protector
    }

    /// List for blocks that are not tied to any guest slice (never soft-invalidated).
    pub fn global(&self) -> &RegionBlockList {
        &self.global
    }

    /// Lock-free lookup of the list owning the slice that contains `addr`.
    #[inline]
    pub fn lookup(&self, addr: u64) -> Option<&RegionBlockList> {
        if addr >= self.config.address_limit() {
            return None;
        }
        let list = self.table.get(addr >> self.config.slice_shift);
        // SAFETY: published lists are only freed by `reclaim(&mut self)` or on drop, so they
        // outlive this shared borrow even if they are retired concurrently.
        unsafe { list.as_ref() }
    }

    /// Finds the block covering `addr` in the slice containing `addr` or, for blocks that start
    /// in an earlier slice, in the slices a block of the largest committed length could span.
    pub fn find_block(&self, addr: u64) -> Option<Arc<BlockDescriptor>> {
        let lookback = addr.saturating_sub(self.largest_block.load(Ordering::Acquire));
        let first = lookback >> self.config.slice_shift;
        let last = addr >> self.config.slice_shift;
        (first..=last)
            .rev()
            .filter_map(|index| self.lookup(index << self.config.slice_shift))
            .find_map(|list| list.find(addr))
    }

    /// Ensures every slice overlapping `[addr, addr + size)` has a list. Pages of the range that
    /// were made writable since they were last protected are re-protected.
    pub fn register_range(&self, addr: u64, size: u64) -> Result<()> {
        self.check_range(addr, size)?;
        let _guard = self.lock();
        let created = self.register_locked(addr, size);
        debug!(addr = format_args!("{addr:#x}"), size, created, "registered guest range");
        Ok(())
    }

    /// Invalidates translations overlapping `[addr, addr + size)`.
    ///
    /// A slice wholly covered by the range is dropped (`destroy`) or wholly marked. A partially
    /// covered slice has only the overlapping blocks freed or marked. Slices without a list are
    /// skipped. Ranges reaching past the guest address space are clipped.
    pub fn invalidate_range(&self, addr: u64, size: u64, destroy: bool) {
        if !destroy {
            self.mark_range_lock_free(addr, size);
            debug!(addr = format_args!("{addr:#x}"), size, "soft-invalidated guest range");
            return;
        }
        let Some(end) = self.clip_end(addr, size) else {
            return;
        };

        let guard = self.lock();
        let (freed, dropped) = self.destroy_locked(guard, addr, end);
        debug!(
            addr = format_args!("{addr:#x}"),
            size, freed, dropped, "destroyed guest range"
        );
    }

    /// Registers the slices covered by a freshly translated block and files the block under the
    /// slice containing its start. The descriptor records the current version of every guest page
    /// it covers; a fault racing the commit may leave it invalid immediately.
    pub fn commit_block(
        &self,
        guest_start: u64,
        guest_len: u64,
        code: ExecBlock,
        checksum: u64,
    ) -> Result<Arc<BlockDescriptor>> {
        let guest_len = guest_len.max(1);
        self.check_range(guest_start, guest_len)?;

        let _guard = self.lock();
        self.register_locked(guest_start, guest_len);

        let last = guest_start + (guest_len - 1);
        let stamps: Box<[PageStamp]> = (guest_start >> self.page_shift..=last >> self.page_shift)
            .map(|page| {
                let page = page << self.page_shift;
                let version = self
                    .lookup(page)
                    .and_then(|list| list.page_version(page))
                    .unwrap_or(0);
                PageStamp::new(page, version)
            })
            .collect();

        let block = Arc::new(BlockDescriptor::new(
            guest_start,
            guest_len,
            code,
            checksum,
            stamps,
        ));
        if let Some(home) = self.lookup(guest_start) {
            home.insert(Arc::clone(&block));
        }
        self.largest_block.fetch_max(guest_len, Ordering::AcqRel);
        Ok(block)
    }

    /// Files a block in the unscoped global list.
    pub fn commit_global(
        &self,
        guest_start: u64,
        guest_len: u64,
        code: ExecBlock,
        checksum: u64,
    ) -> Arc<BlockDescriptor> {
        let block = Arc::new(BlockDescriptor::new(
            guest_start,
            guest_len,
            code,
            checksum,
            Box::new([]),
        ));
        let _guard = self.lock();
        self.global.insert(Arc::clone(&block));
        block
    }

    /// Whether `block` was neither freed nor marked since it was committed or last revalidated.
    ///
    /// Lock-free.
    pub fn is_valid(&self, block: &BlockDescriptor) -> bool {
        !block.is_freed()
            && block.stamps().iter().all(|stamp| {
                self.lookup(stamp.page)
                    .and_then(|list| list.page_version(stamp.page))
                    == Some(stamp.version())
            })
    }

    /// Re-arms a marked block when the translator confirms the guest bytes are unchanged, i.e.
    /// `checksum` matches the one recorded at commit. Returns whether the block is valid again.
    pub fn revalidate(&self, block: &BlockDescriptor, checksum: u64) -> bool {
        if block.is_freed() || block.checksum() != checksum {
            return false;
        }
        let current: Option<Vec<u64>> = block
            .stamps()
            .iter()
            .map(|stamp| self.lookup(stamp.page).and_then(|l| l.page_version(stamp.page)))
            .collect();
        let Some(current) = current else {
            return false;
        };
        for (stamp, version) in block.stamps().iter().zip(current) {
            stamp.set_version(version);
        }
        true
    }

    /// Removes one block from its list; its memory is released once the last reference drops.
    pub fn discard(&self, block: &Arc<BlockDescriptor>) -> bool {
        let _guard = self.lock();
        if block.stamps().is_empty() {
            return self.global.remove(block);
        }
        self.lookup(block.guest_start())
            .is_some_and(|home| home.remove(block))
    }

    /// Drops every list and every block, including the global list. Returns the number of blocks
    /// removed.
    pub fn clear(&self) -> usize {
        let mut retired = self.lock();
        let mut freed = self.global.free_all();
        let mut indices = Vec::new();
        self.table.for_each_present(|index, _| indices.push(index));
        for index in &indices {
            freed += self.retire(&mut retired, *index);
        }
        self.largest_block.store(0, Ordering::Release);
        debug!(lists = indices.len(), freed, "cleared block map");
        freed
    }

    /// Frees lists detached by earlier invalidation. Returns how many were freed.
    pub fn reclaim(&mut self) -> usize {
        let retired = self
            .retired
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let count = retired.len();
        retired.clear();
        count
    }

    /// Number of lists currently published in the table.
    pub fn list_count(&self) -> usize {
        let mut count = 0;
        self.table.for_each_present(|_, _| count += 1);
        count
    }

    pub fn retired_count(&self) -> usize {
        self.lock().len()
    }

    /// Largest guest length committed so far.
    pub fn largest_block_len(&self) -> u64 {
        self.largest_block.load(Ordering::Acquire)
    }

    /// Soft-invalidates pages of `[addr, addr + size)` without locks, allocation or logging.
    pub(crate) fn mark_range_lock_free(&self, addr: u64, size: u64) {
        let Some(end) = self.clip_end(addr, size) else {
            return;
        };
        let slice = self.config.slice_size();
        self.for_each_list(addr, end, |index, list| {
            let start = index << self.config.slice_shift;
            if addr <= start && end >= start + slice {
                list.mark_all();
            } else {
                list.mark_range(addr, end - addr);
            }
        });
    }

    /// Calls `f` with every published list whose slice overlaps `[addr, end)`. Lock-free and
    /// allocation-free.
    pub(crate) fn for_each_list(&self, addr: u64, end: u64, mut f: impl FnMut(u64, &RegionBlockList)) {
        if end <= addr {
            return;
        }
        let first = addr >> self.config.slice_shift;
        let last = (end - 1) >> self.config.slice_shift;
        if last - first < DIRECT_WALK_LIMIT {
            for index in first..=last {
                // SAFETY: see `lookup`.
                if let Some(list) = unsafe { self.table.get(index).as_ref() } {
                    f(index, list);
                }
            }
        } else {
            self.table.for_each_present(|index, list| {
                if (first..=last).contains(&index) {
                    // SAFETY: see `lookup`.
                    if let Some(list) = unsafe { list.as_ref() } {
                        f(index, list);
                    }
                }
            });
        }
    }

    /// End of `[addr, addr + size)` clipped to the guest address space, or `None` when nothing
    /// of the range lies inside it.
    fn clip_end(&self, addr: u64, size: u64) -> Option<u64> {
        let limit = self.config.address_limit();
        if size == 0 || addr >= limit {
            return None;
        }
        Some(addr.saturating_add(size).min(limit))
    }

    fn check_range(&self, addr: u64, size: u64) -> Result<()> {
        let in_range = addr
            .checked_add(size)
            .is_some_and(|end| end <= self.config.address_limit());
        if in_range {
            Ok(())
        } else {
            Err(BlockMapError::AddressOutOfRange {
                addr,
                len: size,
                limit_bits: self.config.guest_address_bits,
            })
        }
    }

    /// Structural lock held. Returns the number of lists created.
    fn register_locked(&self, addr: u64, size: u64) -> usize {
        if size == 0 {
            return 0;
        }
        let shift = self.config.slice_shift;
        let slice = self.config.slice_size();
        let end = addr + size;
        let mut created = 0;
        for index in addr >> shift..=(end - 1) >> shift {
            let start = index << shift;
            // SAFETY: see `lookup`.
            match unsafe { self.table.get(index).as_ref() } {
                None => {
                    let list = Box::new(RegionBlockList::new(
                        start,
                        slice,
                        self.page_shift,
                        Arc::clone(&self.epoch),
                    ));
                    self.table.publish(index, Box::into_raw(list));
                    created += 1;
                }
                Some(list) => {
                    let lo = addr.max(start);
                    let hi = end.min(start + slice);
                    list.take_writable_runs(lo, hi - lo, |run, len| {
                        if let (Ok(run), Ok(len)) = (usize::try_from(run), usize::try_from(len)) {
                            self.protector.make_executable(run, len);
                        }
                    });
                }
            }
        }
        created
    }

    /// Structural lock held (passed in as `retired`). Returns `(blocks freed, lists dropped)`.
    fn destroy_locked(
        &self,
        mut retired: MutexGuard<'_, Vec<Box<RegionBlockList>>>,
        addr: u64,
        end: u64,
    ) -> (usize, usize) {
        let shift = self.config.slice_shift;
        let slice = self.config.slice_size();
        // Blocks are filed under their start slice; look back far enough to reach any block that
        // starts before `addr` and extends into the range.
        let scan_from = addr.saturating_sub(self.largest_block.load(Ordering::Acquire));

        let mut whole = Vec::new();
        let mut freed = 0;
        self.for_each_list(scan_from, end, |index, list| {
            let start = index << shift;
            if addr <= start && end >= start + slice {
                whole.push(index);
            } else {
                freed += list.free_range(addr, end - addr);
            }
        });
        for index in &whole {
            freed += self.retire(&mut retired, *index);
        }
        (freed, whole.len())
    }

    /// Detaches the list at `index`, frees its blocks and parks it. Structural lock held.
    fn retire(&self, retired: &mut Vec<Box<RegionBlockList>>, index: u64) -> usize {
        let list = self.table.take(index);
        if list.is_null() {
            return 0;
        }
        // SAFETY: lists are created with `Box::into_raw`; `take` detached this one so no other
        // owner can reconstruct the box.
        let list = unsafe { Box::from_raw(list) };
        let freed = list.free_all();
        retired.push(list);
        freed
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Box<RegionBlockList>>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BlockMap {
    fn drop(&mut self) {
        self.table.for_each_present(|index, _| {
            let list = self.table.take(index);
            // SAFETY: as in `retire`; `&mut self` rules out outstanding `lookup` borrows.
            drop(unsafe { Box::from_raw(list) });
        });
    }
}

impl fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMap")
            .field("config", &self.config)
            .field("lists", &self.list_count())
            .field("largest_block", &self.largest_block_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use xlat_exec_mem::{ExecAllocator, ExecMemConfig, PageFlags, PageProtect};

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<(usize, usize, PageFlags)>>);

    impl PageProtect for Recorder {
        fn set(&self, addr: usize, len: usize, flags: PageFlags) -> bool {
            self.0.lock().unwrap().push((addr, len, flags));
            true
        }
    }

    fn setup() -> (BlockMap, Arc<Recorder>, Arc<ExecAllocator>) {
        let recorder = Arc::new(Recorder::default());
        let protector = Protector::with_page_size(recorder.clone(), 4096);
        let map = BlockMap::new(BlockMapConfig::default(), protector).unwrap();
        let alloc = Arc::new(ExecAllocator::new(ExecMemConfig::default()).unwrap());
        (map, recorder, alloc)
    }

    fn commit(map: &BlockMap, alloc: &Arc<ExecAllocator>, start: u64, len: u64) -> Arc<BlockDescriptor> {
        map.commit_block(start, len, alloc.allocate_block(64).unwrap(), start ^ len)
            .unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(BlockMapConfig::default().validate().is_ok());
        let bad = [
            BlockMapConfig { slice_shift: 11, guest_address_bits: 32 },
            BlockMapConfig { slice_shift: 32, guest_address_bits: 32 },
            BlockMapConfig { slice_shift: 16, guest_address_bits: 64 },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(BlockMapError::InvalidConfig(_))), "{config:?}");
        }
        assert!(BlockMapConfig { slice_shift: 20, guest_address_bits: 48 }.validate().is_ok());
    }

    #[test]
    fn register_then_lookup() {
        let (map, _, _) = setup();
        assert!(map.lookup(0x1000).is_none());
        map.register_range(0x1000, 0x2000).unwrap();
        let list = map.lookup(0x1000).unwrap();
        assert!(list.span().contains(&0x1000));
        assert_eq!(map.list_count(), 1);

        map.register_range(0xfff0, 0x20).unwrap();
        assert_eq!(map.list_count(), 2);
        assert!(map.lookup(0x1_0000).is_some());
    }

    #[test]
    fn out_of_range_addresses() {
        let (map, _, alloc) = setup();
        assert!(matches!(
            map.register_range(0xffff_f000, 0x2000),
            Err(BlockMapError::AddressOutOfRange { limit_bits: 32, .. })
        ));
        assert!(map
            .commit_block(1 << 32, 1, alloc.allocate_block(1).unwrap(), 0)
            .is_err());
        assert!(map.lookup(1 << 32).is_none());
        assert!(map.lookup(u64::MAX).is_none());
        map.invalidate_range(u64::MAX - 1, 10, true);
        map.unprotect(u64::MAX - 1, 10);
    }

    #[test]
    fn partial_destroy_keeps_list() {
        let (map, _, alloc) = setup();
        map.register_range(0x1000, 0x2000).unwrap();
        let low = commit(&map, &alloc, 0x1000, 0x800);
        let high = commit(&map, &alloc, 0x1800, 0x800);

        map.invalidate_range(0x1800, 0x800, true);
        let list = map.lookup(0x1000).unwrap();
        assert_eq!(list.len(), 1);
        assert!(high.is_freed());
        assert!(map.is_valid(&low));
        assert!(!map.is_valid(&high));
        assert_eq!(map.retired_count(), 0);
    }

    #[test]
    fn whole_slice_destroy_retires_list() {
        let (mut map, _, alloc) = setup();
        let block = commit(&map, &alloc, 0x2_0010, 0x40);
        map.invalidate_range(0x2_0000, 0x1_0000, true);
        assert!(map.lookup(0x2_0010).is_none());
        assert!(block.is_freed());
        assert_eq!(map.retired_count(), 1);

        // Untouched slices are silently skipped.
        map.invalidate_range(0x50_0000, 0x10_0000, true);
        assert_eq!(map.reclaim(), 1);
        assert_eq!(map.retired_count(), 0);
    }

    #[test]
    fn destroy_reaches_blocks_starting_in_earlier_slice() {
        let (map, _, alloc) = setup();
        let spanning = commit(&map, &alloc, 0xff00, 0x200);
        assert_eq!(map.list_count(), 2);
        assert_eq!(map.find_block(0x1_0010).unwrap().guest_start(), 0xff00);

        map.invalidate_range(0x1_0080, 0x10, true);
        assert!(spanning.is_freed());
        assert!(map.lookup(0xff00).unwrap().is_empty());
    }

    #[test]
    fn soft_invalidate_marks_and_revalidates() {
        let (map, _, alloc) = setup();
        let a = commit(&map, &alloc, 0x1000, 0x100);
        let b = commit(&map, &alloc, 0x5000, 0x100);

        map.invalidate_range(0x1080, 0x4, false);
        let list = map.lookup(0x1000).unwrap();
        assert_eq!(list.len(), 2);
        assert!(!map.is_valid(&a));
        assert!(map.is_valid(&b));

        assert!(!map.revalidate(&a, 0));
        assert!(!map.is_valid(&a));
        assert!(map.revalidate(&a, a.checksum()));
        assert!(map.is_valid(&a));

        map.invalidate_range(0, 0x1_0000, false);
        assert!(!map.is_valid(&a));
        assert!(!map.is_valid(&b));
        assert_eq!(map.list_count(), 1);
    }

    #[test]
    fn recreated_slice_does_not_revive_old_stamps() {
        let (map, _, alloc) = setup();
        let old = commit(&map, &alloc, 0x3000, 0x10);
        map.invalidate_range(0, 0x1_0000, true);
        map.register_range(0x3000, 0x10).unwrap();
        assert!(!map.is_valid(&old));
        assert!(!map.revalidate(&old, old.checksum()));
    }

    #[test]
    fn register_reprotects_unprotected_slice() {
        let (map, recorder, _) = setup();
        map.register_range(0x4000, 0x1000).unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());

        map.protect(0x4000, 0x1000);
        map.unprotect(0x4010, 4);
        recorder.0.lock().unwrap().clear();

        map.register_range(0x4000, 0x1000).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![(0x4000, 0x1000, PageFlags::RX)]);
        assert!(!map.lookup(0x4000).unwrap().is_writable());

        // Already protected: nothing to do.
        map.register_range(0x4000, 0x1000).unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn register_reprotects_each_unprotected_page_of_a_slice() {
        let (map, recorder, _) = setup();
        map.register_range(0x4000, 0x2000).unwrap();
        map.protect(0x4000, 0x2000);
        map.unprotect(0x4000, 1);
        map.unprotect(0x5000, 1);
        recorder.0.lock().unwrap().clear();

        map.register_range(0x4000, 0x1000).unwrap();
        let list = map.lookup(0x4000).unwrap();
        assert!(!list.is_page_writable(0x4000));
        assert!(list.is_page_writable(0x5000));

        map.register_range(0x5000, 0x1000).unwrap();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(0x4000, 0x1000, PageFlags::RX), (0x5000, 0x1000, PageFlags::RX)]
        );
        assert!(!list.is_writable());
    }

    #[test]
    fn protecting_one_page_keeps_its_neighbour_flagged() {
        let (map, recorder, _) = setup();
        map.register_range(0x6000, 0x2000).unwrap();
        map.unprotect(0x6000, 0x2000);
        map.protect(0x6000, 0x1000);
        recorder.0.lock().unwrap().clear();

        map.register_range(0x6000, 0x2000).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![(0x7000, 0x1000, PageFlags::RX)]);
    }

    #[test]
    fn clear_drops_everything_and_releases_code() {
        let (map, _, alloc) = setup();
        let a = commit(&map, &alloc, 0x1000, 0x10);
        let g = map.commit_global(0, 0, alloc.allocate_block(16).unwrap(), 0);
        assert_eq!(map.global().len(), 1);
        assert!(map.is_valid(&g));

        assert_eq!(map.clear(), 2);
        assert_eq!(map.list_count(), 0);
        assert!(map.global().is_empty());
        assert!(a.is_freed() && g.is_freed());
        drop((a, g));
        assert_eq!(alloc.stats().used_bytes, 0);
    }

    #[test]
    fn discard_removes_single_block() {
        let (map, _, alloc) = setup();
        let a = commit(&map, &alloc, 0x1000, 0x10);
        let b = commit(&map, &alloc, 0x1000, 0x20);
        assert!(Arc::ptr_eq(&map.find_block(0x1018).unwrap(), &b));
        assert!(map.discard(&b));
        assert!(!map.discard(&b));
        assert!(Arc::ptr_eq(&map.find_block(0x1008).unwrap(), &a));
        assert!(map.find_block(0x1018).is_none());
    }

    #[test]
    fn wide_guest_uses_sparse_table() {
        let recorder = Arc::new(Recorder::default());
        let protector = Protector::with_page_size(recorder, 4096);
        let config = BlockMapConfig { slice_shift: 16, guest_address_bits: 48 };
        let map = BlockMap::new(config, protector).unwrap();
        map.register_range(0x7fff_0000_0000, 0x3_0000).unwrap();
        assert_eq!(map.list_count(), 3);
        assert!(map.lookup(0x7fff_0002_ffff).is_some());
        assert!(map.lookup(0x7fff_0003_0000).is_none());

        map.invalidate_range(0, 1 << 48, true);
        assert_eq!(map.list_count(), 0);
        assert_eq!(map.retired_count(), 3);
    }
}
