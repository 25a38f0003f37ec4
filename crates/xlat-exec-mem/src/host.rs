use std::io;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

bitflags! {
    /// Host page permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl PageFlags {
    /// Executable, not writable: the state of a page backing live translations.
    pub const RX: Self = Self::READ.union(Self::EXEC);
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);

    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Host page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: `sysconf` has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two), saturating at the highest aligned
/// address instead of wrapping.
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => align_down(usize::MAX, align),
    }
}

/// Source of the OS mappings backing arenas and oversized allocations.
pub trait MemoryProvider: Send + Sync {
    /// Maps `len` bytes of page-aligned, zeroed memory with read/write/execute permission.
    fn map(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Releases a mapping.
    ///
    /// # Safety
    /// `ptr`/`len` must describe a mapping returned by [`MemoryProvider::map`] on this provider
    /// that has not been released yet, and nothing may access it afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize);
}

/// Anonymous private `mmap` mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMemory;

impl MemoryProvider for HostMemory {
    fn map(&self, len: usize) -> io::Result<NonNull<u8>> {
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        // SAFETY: anonymous mapping with a null hint; no existing memory is affected.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PageFlags::RWX.to_prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) {
        libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len);
    }
}

/// Changes host page permissions.
///
/// Implementations are called from the write-fault handler, so they must be async-signal-safe:
/// no allocation, no locks, no logging.
pub trait PageProtect: Send + Sync {
    /// Applies `flags` to the page-aligned range `[addr, addr + len)`. Returns `false` if the
    /// host rejected the change (e.g. part of the range is not mapped).
    fn set(&self, addr: usize, len: usize, flags: PageFlags) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostPageProtect;

impl PageProtect for HostPageProtect {
    fn set(&self, addr: usize, len: usize, flags: PageFlags) -> bool {
        // SAFETY: `mprotect` validates the range itself and reports unmapped pages via ENOMEM.
        // Callers own the guest pages whose permissions they change.
        unsafe { libc::mprotect(addr as *mut libc::c_void, len, flags.to_prot()) == 0 }
    }
}

/// Page-granular permission changes.
///
/// The page size is captured at construction so the fault path never has to query it.
#[derive(Clone)]
pub struct Protector {
    page_size: usize,
    backend: Arc<dyn PageProtect>,
}

impl Protector {
    pub fn host() -> Self {
        Self::new(Arc::new(HostPageProtect))
    }

    pub fn new(backend: Arc<dyn PageProtect>) -> Self {
        Self::with_page_size(backend, page_size())
    }

    /// Uses an explicit page size (must be a power of two); mainly for fake backends.
    pub fn with_page_size(backend: Arc<dyn PageProtect>, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self { page_size, backend }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Rounds `[addr, addr + len)` out to whole pages. Returns `(start, len)`; an empty range
    /// stays empty.
    pub fn page_range(&self, addr: usize, len: usize) -> (usize, usize) {
        let start = align_down(addr, self.page_size);
        if len == 0 {
            return (start, 0);
        }
        let end = align_up(addr.saturating_add(len), self.page_size);
        (start, end.saturating_sub(start))
    }

    /// Removes write permission from the pages covering the range. Returns the rounded range.
    pub fn make_executable(&self, addr: usize, len: usize) -> (usize, usize) {
        self.apply(addr, len, PageFlags::RX)
    }

    /// Restores write permission on the pages covering the range. Returns the rounded range.
    pub fn make_writable(&self, addr: usize, len: usize) -> (usize, usize) {
        self.apply(addr, len, PageFlags::RWX)
    }

    /// Like [`Protector::make_writable`], but `None` when the host refused the change (or the
    /// range is empty).
    pub fn try_make_writable(&self, addr: usize, len: usize) -> Option<(usize, usize)> {
        let (start, len) = self.page_range(addr, len);
        (len != 0 && self.backend.set(start, len, PageFlags::RWX)).then_some((start, len))
    }

    fn apply(&self, addr: usize, len: usize, flags: PageFlags) -> (usize, usize) {
        let (start, len) = self.page_range(addr, len);
        if len != 0 {
            // Failures (unmapped guest pages) are ignored: the fault path has nobody to report to.
            let _ = self.backend.set(start, len, flags);
        }
        (start, len)
    }
}

impl std::fmt::Debug for Protector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protector")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}
