//! `SIGSEGV` handling for writes to protected guest code.
//!
//! The handler only performs lock-free, allocation-free work: it asks the context's block map to
//! make the faulting page writable (which soft-invalidates the translations on it) and returns so
//! the faulting instruction is retried. Faults outside tracked slices are passed to whatever
//! disposition was installed before.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;
use xlat_block_map::BlockMap;

use crate::context::{Context, ContextHandle};
use crate::error::{ContextError, Result};

/// `si_code` of a fault on a mapped page whose permissions forbid the access. The `libc` crate
/// only exports it for a few targets; the value is fixed by the kernel ABI.
const SEGV_ACCERR: libc::c_int = 2;

struct Installed {
    map: *const BlockMap,
    previous: libc::sigaction,
}

/// The one active handler's state; null when none is installed.
static ACTIVE: AtomicPtr<Installed> = AtomicPtr::new(ptr::null_mut());

/// Handler invocations that may still hold a pointer loaded from `ACTIVE`.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Guard for an installed fault handler. Dropping it restores the previous disposition.
pub struct FaultHandler {
    installed: *mut Installed,
    // Keeps the block map behind `installed.map` alive.
    _context: Arc<Context>,
}

// SAFETY: `installed` is only dereferenced by the signal handler and by `drop`.
unsafe impl Send for FaultHandler {}

impl FaultHandler {
    /// Installs the process-wide `SIGSEGV` handler for `context`'s block map.
    pub fn install(context: &ContextHandle) -> Result<FaultHandler> {
        let map = context
            .code_cache()?
            .blocks() as *const BlockMap;

        // SAFETY: `sigaction` is plain old data; all-zero is a valid empty value.
        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        // SAFETY: querying the current disposition only writes `previous`.
        if unsafe { libc::sigaction(libc::SIGSEGV, ptr::null(), &mut previous) } != 0 {
            return Err(ContextError::SignalInstall(io::Error::last_os_error()));
        }

        let installed = Box::into_raw(Box::new(Installed { map, previous }));
        if ACTIVE
            .compare_exchange(ptr::null_mut(), installed, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: never published.
            drop(unsafe { Box::from_raw(installed) });
            return Err(ContextError::FaultHandlerBusy);
        }

        // SAFETY: as above.
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_fault as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        // SAFETY: `action.sa_mask` is a valid signal set to initialize.
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        // SAFETY: `on_fault` has the `SA_SIGINFO` signature and only touches `ACTIVE`.
        if unsafe { libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) } != 0 {
            let err = io::Error::last_os_error();
            ACTIVE.store(ptr::null_mut(), Ordering::Release);
            // SAFETY: the handler never ran, so nothing else holds the pointer.
            drop(unsafe { Box::from_raw(installed) });
            return Err(ContextError::SignalInstall(err));
        }

        debug!("installed guest write-fault handler");
        Ok(FaultHandler {
            installed,
            _context: Arc::clone(context.context_arc()),
        })
    }

    /// Whether a handler is currently installed in this process.
    pub fn is_active() -> bool {
        !ACTIVE.load(Ordering::Acquire).is_null()
    }
}

impl Drop for FaultHandler {
    fn drop(&mut self) {
        // SAFETY: `installed` stays valid until the end of this function.
        let previous = unsafe { &(*self.installed).previous };
        // SAFETY: restores a disposition previously returned by the kernel.
        unsafe { libc::sigaction(libc::SIGSEGV, previous, ptr::null_mut()) };
        ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
        // Handlers entered before the store may still be reading the state (and the block map
        // it points to, which `_context` keeps alive until after this returns).
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
        // SAFETY: created by `Box::into_raw` in `install`. `ACTIVE` is cleared and no handler
        // that loaded it is still running.
        drop(unsafe { Box::from_raw(self.installed) });
        debug!("removed guest write-fault handler");
    }
}

impl std::fmt::Debug for FaultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHandler").finish_non_exhaustive()
    }
}

extern "C" fn on_fault(signum: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let installed = ACTIVE.load(Ordering::SeqCst);
    if installed.is_null() {
        // The guard already restored the previous disposition; retrying the access delivers
        // the fault there.
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        return;
    }
    // SAFETY: the guard does not free `installed` (or release the block map it points to)
    // while `IN_FLIGHT` counts this invocation.
    let installed = unsafe { &*installed };
    // SAFETY: the kernel passes a valid `siginfo_t` for `SA_SIGINFO` handlers.
    let (addr, code) = unsafe { ((*info).si_addr() as u64, (*info).si_code) };

    // SAFETY: as above.
    let map = unsafe { &*installed.map };
    let handled = code == SEGV_ACCERR && map.handle_write_fault(addr);
    let previous = installed.previous;
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    if handled {
        return;
    }

    // SAFETY: forwards the kernel-provided arguments unchanged.
    unsafe { chain(&previous, signum, info, ucontext) };
}

fn reset_to_default(signum: libc::c_int) {
    // SAFETY: async-signal-safe; returning re-raises the fault under the default action.
    unsafe { libc::signal(signum, libc::SIG_DFL) };
}

/// Forwards a fault we do not own to the disposition that was installed before ours.
unsafe fn chain(
    previous: &libc::sigaction,
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    match previous.sa_sigaction {
        libc::SIG_IGN => {}
        libc::SIG_DFL => reset_to_default(signum),
        handler if previous.sa_flags & libc::SA_SIGINFO != 0 => {
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                mem::transmute(handler);
            handler(signum, info, ucontext);
        }
        handler => {
            let handler: extern "C" fn(libc::c_int) = mem::transmute(handler);
            handler(signum);
        }
    }
}
