use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use xlat_block_map::{BlockMap, BlockMapConfig};
use xlat_exec_mem::{page_size, ExecAllocator, ExecMemConfig, PageFlags, PageProtect, Protector};

fn host_map() -> BlockMap {
    let config = BlockMapConfig {
        slice_shift: 16,
        guest_address_bits: 48,
    };
    BlockMap::new(config, Protector::host()).unwrap()
}

/// Accepts every permission change without touching host memory.
struct NoProtect;

impl PageProtect for NoProtect {
    fn set(&self, _addr: usize, _len: usize, _flags: PageFlags) -> bool {
        true
    }
}

fn allocator() -> Arc<ExecAllocator> {
    Arc::new(ExecAllocator::new(ExecMemConfig::default()).unwrap())
}

/// Anonymous read/write mapping standing in for guest memory.
struct GuestPages {
    ptr: *mut u8,
    len: usize,
}

impl GuestPages {
    fn new(pages: usize) -> Self {
        let len = pages * page_size();
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        Self {
            ptr: ptr.cast(),
            len,
        }
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }
}

impl Drop for GuestPages {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with this length.
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}

/// Permission string (`rwxp`-style, first three chars) of the mapping containing `addr`.
fn perms_at(addr: u64) -> String {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next().unwrap();
        let perms = fields.next().unwrap();
        let (lo, hi) = range.split_once('-').unwrap();
        let lo = u64::from_str_radix(lo, 16).unwrap();
        let hi = u64::from_str_radix(hi, 16).unwrap();
        if (lo..hi).contains(&addr) {
            return perms[..3].to_string();
        }
    }
    panic!("{addr:#x} is not mapped");
}

#[test]
fn register_then_partial_destroy() {
    let map = BlockMap::new(BlockMapConfig::default(), Protector::host()).unwrap();
    let alloc = allocator();
    map.register_range(0x1000, 0x2000).unwrap();
    let list = map.lookup(0x1000).unwrap();
    assert!(list.span().contains(&0x1000));
    assert!(list.span().contains(&0x2fff));

    let low = map
        .commit_block(0x1000, 0x800, alloc.allocate_block(100).unwrap(), 0)
        .unwrap();
    let high = map
        .commit_block(0x1800, 0x800, alloc.allocate_block(100).unwrap(), 0)
        .unwrap();
    assert_eq!(list.blocks_span(), Some(0x1000..0x2000));

    map.invalidate_range(0x1800, 0x800, true);
    let list = map.lookup(0x1000).expect("list survives a partial destroy");
    assert_eq!(list.len(), 1);
    assert_eq!(list.blocks_span(), Some(0x1000..0x1800));
    assert!(map.is_valid(&low));
    assert!(!map.is_valid(&high));

    // The freed block's code memory goes back once the last handle drops.
    let used = alloc.stats().used_bytes;
    drop(high);
    assert_eq!(alloc.stats().used_bytes, used - 256);
}

#[test]
fn full_slice_destroy_makes_every_address_absent() {
    let map = BlockMap::new(BlockMapConfig::default(), Protector::host()).unwrap();
    map.register_range(0x30_0000, 0x1_0000).unwrap();
    map.invalidate_range(0x30_0000, 0x1_0000, true);
    for addr in (0x30_0000..0x31_0000).step_by(0x777) {
        assert!(map.lookup(addr).is_none(), "{addr:#x}");
    }
    assert!(map.lookup(0x30_ffff).is_none());
}

#[test]
fn soft_invalidation_keeps_blocks_listed() {
    let map = BlockMap::new(BlockMapConfig::default(), Protector::host()).unwrap();
    let alloc = allocator();
    let blocks: Vec<_> = (0..8u64)
        .map(|i| {
            map.commit_block(0x40_0000 + i * 0x1000, 0x40, alloc.allocate_block(64).unwrap(), i)
                .unwrap()
        })
        .collect();

    map.invalidate_range(0x40_2000, 0x2000, false);
    let list = map.lookup(0x40_0000).unwrap();
    assert_eq!(list.len(), 8);
    let valid: Vec<bool> = blocks.iter().map(|b| map.is_valid(b)).collect();
    assert_eq!(valid, [true, true, false, false, true, true, true, true]);
    assert!(blocks.iter().all(|b| !b.is_freed()));
}

#[test]
fn unprotect_changes_real_page_permissions() {
    let map = host_map();
    let alloc = allocator();
    let guest = GuestPages::new(2);
    let page = page_size() as u64;

    let block = map
        .commit_block(guest.addr(), 16, alloc.allocate_block(16).unwrap(), 7)
        .unwrap();
    map.protect(guest.addr(), 2 * page);
    assert_eq!(perms_at(guest.addr()), "r-x");
    assert_eq!(perms_at(guest.addr() + page), "r-x");

    map.unprotect(guest.addr() + 3, 1);
    assert_eq!(perms_at(guest.addr()), "rwx");
    assert_eq!(perms_at(guest.addr() + page), "r-x");
    assert!(!map.is_valid(&block));

    // Writable now.
    // SAFETY: the page is mapped and writable.
    unsafe { guest.ptr.write_volatile(0x90) };
    assert!(map.revalidate(&block, 7));
}

#[test]
fn lookups_race_with_registration_and_destruction() {
    let map = Arc::new(BlockMap::new(BlockMapConfig::default(), Protector::host()).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut hits = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    for slice in 0..64u64 {
                        if let Some(list) = map.lookup(slice << 16) {
                            assert!(list.contains(slice << 16));
                            hits += 1;
                        }
                    }
                }
                hits
            })
        })
        .collect();

    for round in 0..200u64 {
        let slice = round % 64;
        map.register_range(slice << 16, 0x100).unwrap();
        if round % 3 == 0 {
            map.invalidate_range(slice << 16, 1 << 16, true);
        }
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().expect("reader panicked");
    }
}

#[test]
fn fault_path_races_commits_and_destruction() {
    let protector = Protector::with_page_size(Arc::new(NoProtect), 4096);
    let mut map = BlockMap::new(BlockMapConfig::default(), protector).unwrap();
    let alloc = allocator();
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let (map, stop) = (&map, &stop);
        for _ in 0..4 {
            scope.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for slice in 0..16u64 {
                        let addr = (slice << 16) + 0x80;
                        if let Some(list) = map.lookup(addr) {
                            assert!(list.contains(addr));
                        }
                        if let Some(block) = map.find_block(addr) {
                            assert!(block.contains(addr));
                            map.is_valid(&block);
                        }
                        map.unprotect(addr, 1);
                        map.handle_write_fault(addr + 0x1000);
                    }
                }
            });
        }

        for round in 0..800u64 {
            let start = (round % 16) << 16;
            let block = map
                .commit_block(start + 0x40, 0x100, alloc.allocate_block(64).unwrap(), round)
                .unwrap();
            map.register_range(start, 0x2000).unwrap();
            match round % 4 {
                0 => map.invalidate_range(start, 1 << 16, true),
                1 => map.invalidate_range(start + 0x40, 0x10, true),
                2 => assert!(!map.revalidate(&block, !round)),
                _ => {
                    map.discard(&block);
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
    });

    // Every whole-slice destroy retired one list.
    assert_eq!(map.retired_count(), 200);
    assert_eq!(map.reclaim(), 200);
    assert_eq!(map.retired_count(), 0);

    // Slices whose last round did not destroy them are still listed.
    assert_eq!(map.list_count(), 12);
    map.clear();
    assert_eq!(map.reclaim(), 12);
    assert_eq!(alloc.stats().used_bytes, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn registered_addresses_are_found(
        ranges in prop::collection::vec((0u64..0xff00_0000, 1u64..0x4_0000), 1..16),
    ) {
        let map = BlockMap::new(BlockMapConfig::default(), Protector::host()).unwrap();
        for &(addr, size) in &ranges {
            map.register_range(addr, size).unwrap();
        }
        for &(addr, size) in &ranges {
            for point in [addr, addr + size / 2, addr + size - 1] {
                let list = map.lookup(point);
                prop_assert!(list.is_some_and(|l| l.contains(point)), "{point:#x}");
            }
        }
    }
}
