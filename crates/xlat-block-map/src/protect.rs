//! Page-permission toggling for translated guest ranges.
//!
//! Both entry points may run inside a fault handler: they take no lock, never allocate and never
//! log.

use crate::map::BlockMap;

impl BlockMap {
    /// Makes the pages covering `[addr, addr + size)` read+execute only.
    pub fn protect(&self, addr: u64, size: u64) {
        let Some((addr, size)) = host_range(addr, size) else {
            return;
        };
        // Flags drop before the pages do, so a later fault can only set them again.
        let (start, len) = self.protector().page_range(addr, size);
        let (lo, hi) = (start as u64, (start as u64).saturating_add(len as u64));
        self.for_each_list(lo, hi, |_, list| list.set_writable(lo, hi - lo, false));
        self.protector().make_executable(start, len);
    }

    /// Makes the pages covering `[addr, addr + size)` writable again and soft-invalidates the
    /// translations on them.
    pub fn unprotect(&self, addr: u64, size: u64) {
        let Some((addr, size)) = host_range(addr, size) else {
            return;
        };
        let (start, len) = self.protector().make_writable(addr, size);
        self.after_unprotect(start as u64, len as u64);
    }

    /// Fault-handler entry point for a write to `addr`.
    ///
    /// Returns `true` when `addr` lies in a tracked slice and its page was made writable (the
    /// faulting access can be retried), `false` when the fault is not ours to handle.
    pub fn handle_write_fault(&self, addr: u64) -> bool {
        if !self.is_tracked(addr) {
            return false;
        }
        let Ok(host) = usize::try_from(addr) else {
            return false;
        };
        match self.protector().try_make_writable(host, 1) {
            Some((start, len)) => {
                self.after_unprotect(start as u64, len as u64);
                true
            }
            None => false,
        }
    }

    /// Whether `addr` lies in a slice tracked by this map. Lock-free.
    pub fn is_tracked(&self, addr: u64) -> bool {
        self.lookup(addr).is_some()
    }

    fn after_unprotect(&self, start: u64, len: u64) {
        self.mark_range_lock_free(start, len);
        let end = start.saturating_add(len);
        self.for_each_list(start, end, |_, list| list.set_writable(start, end - start, true));
    }
}

/// Guest ranges are host addresses here; ranges the host cannot address are ignored.
fn host_range(addr: u64, size: u64) -> Option<(usize, usize)> {
    if size == 0 {
        return None;
    }
    Some((usize::try_from(addr).ok()?, usize::try_from(size).ok()?))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use xlat_exec_mem::{ExecAllocator, ExecMemConfig, PageFlags, PageProtect, Protector};

    use crate::{BlockMap, BlockMapConfig};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, usize, PageFlags)>>);

    impl PageProtect for Recorder {
        fn set(&self, addr: usize, len: usize, flags: PageFlags) -> bool {
            self.0.lock().unwrap().push((addr, len, flags));
            true
        }
    }

    fn map_with_recorder() -> (BlockMap, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let protector = Protector::with_page_size(recorder.clone(), 4096);
        (BlockMap::new(BlockMapConfig::default(), protector).unwrap(), recorder)
    }

    #[test]
    fn protect_rounds_to_pages() {
        let (map, recorder) = map_with_recorder();
        map.protect(0x1234, 0x10);
        map.protect(0x1ff0, 0x20);
        map.protect(0x5000, 0);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(0x1000, 0x1000, PageFlags::RX), (0x1000, 0x2000, PageFlags::RX)]
        );
    }

    #[test]
    fn unprotect_restores_write_and_marks_rounded_range() {
        let (map, recorder) = map_with_recorder();
        let alloc = Arc::new(ExecAllocator::new(ExecMemConfig::default()).unwrap());
        let inside = map
            .commit_block(0x2f00, 0x80, alloc.allocate_block(8).unwrap(), 1)
            .unwrap();
        let neighbour = map
            .commit_block(0x3000, 0x80, alloc.allocate_block(8).unwrap(), 2)
            .unwrap();
        map.protect(0x2000, 0x2000);
        assert!(!map.lookup(0x2000).unwrap().is_writable());

        // A one-byte write fault anywhere in the page invalidates everything on it.
        map.unprotect(0x2001, 1);
        assert_eq!(
            recorder.0.lock().unwrap().last(),
            Some(&(0x2000, 0x1000, PageFlags::RWX))
        );
        assert!(!map.is_valid(&inside));
        assert!(map.is_valid(&neighbour));
        assert_eq!(map.lookup(0x2000).unwrap().len(), 2);
        assert!(map.lookup(0x2000).unwrap().is_writable());
    }

    #[test]
    fn untracked_pages() {
        let (map, _) = map_with_recorder();
        assert!(!map.is_tracked(0x8000));
        map.register_range(0x8000, 1).unwrap();
        assert!(map.is_tracked(0x8fff));
        assert!(map.is_tracked(0xffff));
        assert!(!map.is_tracked(0x1_0000));
        map.unprotect(0x40_0000, 0x1000);
    }

    #[test]
    fn write_fault_outside_tracked_slices_is_declined() {
        let (map, recorder) = map_with_recorder();
        let alloc = Arc::new(ExecAllocator::new(ExecMemConfig::default()).unwrap());
        let block = map
            .commit_block(0x9100, 0x20, alloc.allocate_block(8).unwrap(), 0)
            .unwrap();

        assert!(!map.handle_write_fault(0x2_0000));
        assert!(recorder.0.lock().unwrap().is_empty());

        assert!(map.handle_write_fault(0x9104));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(0x9000, 0x1000, PageFlags::RWX)]
        );
        assert!(!map.is_valid(&block));
    }
}
