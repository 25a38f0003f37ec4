use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;
use xlat_block_map::{BlockDescriptor, BlockMap};
use xlat_exec_mem::{ExecAllocator, HostMemory, MemoryProvider, Protector};

use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::module::{ModuleDescriptor, NeededLibrary, SearchPathKind, SearchPaths};
use crate::teardown::{Subsystem, TeardownReport, TeardownStage};
use crate::tls::{ThreadTls, TlsStore};

/// Executable memory plus the guest-address map of the blocks living in it.
pub struct CodeCache {
    allocator: Arc<ExecAllocator>,
    blocks: BlockMap,
}

impl CodeCache {
    pub fn allocator(&self) -> &Arc<ExecAllocator> {
        &self.allocator
    }

    pub fn blocks(&self) -> &BlockMap {
        &self.blocks
    }

    /// Copies emitted machine code into fresh executable memory and files it as the translation
    /// of `[guest_start, guest_start + guest_len)`.
    pub fn install(
        &self,
        guest_start: u64,
        guest_len: u64,
        code: &[u8],
        checksum: u64,
    ) -> Result<Arc<BlockDescriptor>> {
        let mut block = self.allocator.allocate_block(code.len())?;
        // SAFETY: the allocator is live and the block is not shared with anyone yet.
        unsafe { block.as_mut_slice() }.copy_from_slice(code);
        Ok(self
            .blocks
            .commit_block(guest_start, guest_len, block, checksum)?)
    }

    fn teardown(&self) -> usize {
        let blocks = self.blocks.clear();
        let stats = self.allocator.release_all();
        blocks + stats.arenas + stats.oversized
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("allocator", &self.allocator)
            .field("blocks", &self.blocks)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Arguments {
    argc: usize,
    argv: Vec<String>,
    env: Vec<String>,
}

/// State of one emulated process image.
///
/// Reached through [`ContextHandle`]s; teardown runs once the last logical sharer and the last
/// forked copy have released their handles.
pub struct Context {
    refs: AtomicUsize,
    forks: AtomicUsize,
    torn_down: AtomicBool,
    code: Option<CodeCache>,
    modules: Mutex<Vec<ModuleDescriptor>>,
    search_paths: Mutex<SearchPaths>,
    needed: Mutex<Vec<NeededLibrary>>,
    arguments: Mutex<Arguments>,
    tls: TlsStore,
    signals: Mutex<Vec<i32>>,
    subsystems: Mutex<Vec<(TeardownStage, Box<dyn Subsystem>)>>,
}

impl Context {
    /// Creates a context on host memory and host page protection.
    pub fn create(config: ContextConfig, argc: usize) -> Result<ContextHandle> {
        Self::create_with(config, argc, Arc::new(HostMemory), Protector::host())
    }

    /// Creates a context with explicit memory and protection backends.
    pub fn create_with(
        config: ContextConfig,
        argc: usize,
        memory: Arc<dyn MemoryProvider>,
        protector: Protector,
    ) -> Result<ContextHandle> {
        config.validate()?;
        let code = if config.code_cache {
            Some(CodeCache {
                allocator: Arc::new(ExecAllocator::with_provider(config.exec.clone(), memory)?),
                blocks: BlockMap::new(config.blocks, protector)?,
            })
        } else {
            None
        };

        let context = Context {
            refs: AtomicUsize::new(1),
            forks: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
            code,
            modules: Mutex::new(Vec::new()),
            search_paths: Mutex::new(SearchPaths::default()),
            needed: Mutex::new(Vec::new()),
            arguments: Mutex::new(Arguments {
                argc,
                argv: Vec::with_capacity(argc),
                env: Vec::new(),
            }),
            tls: TlsStore::default(),
            signals: Mutex::new(Vec::new()),
            subsystems: Mutex::new(Vec::new()),
        };
        debug!(argc, code_cache = config.code_cache, "created context");
        Ok(ContextHandle {
            context: Arc::new(context),
            kind: HandleKind::Shared,
        })
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Number of live logical sharers.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Number of live forked copies.
    pub fn fork_depth(&self) -> usize {
        self.forks.load(Ordering::Acquire)
    }

    pub fn code_cache(&self) -> Result<&CodeCache> {
        self.ensure_live()?;
        self.code.as_ref().ok_or(ContextError::CodeCacheDisabled)
    }

    /// Hands a collaborator to the context; it is shut down during `stage` of teardown.
    pub fn attach(&self, stage: TeardownStage, subsystem: Box<dyn Subsystem>) -> Result<()> {
        let mut subsystems = lock(&self.subsystems);
        // Checked under the lock so teardown cannot miss a late attachment.
        self.ensure_live()?;
        debug!(%stage, name = subsystem.name(), "attached subsystem");
        subsystems.push((stage, subsystem));
        Ok(())
    }

    /// Appends a loaded module and registers its code range. Returns the module's index.
    pub fn add_module(&self, module: ModuleDescriptor) -> Result<usize> {
        self.ensure_live()?;
        if let Some(code) = &self.code {
            if !module.code.is_empty() {
                code.blocks
                    .register_range(module.code.start, module.code.end - module.code.start)?;
            }
        }
        let mut modules = lock(&self.modules);
        debug!(
            name = %module.name,
            base = format_args!("{:#x}", module.base),
            index = modules.len(),
            "added module"
        );
        modules.push(module);
        Ok(modules.len() - 1)
    }

    pub fn module(&self, index: usize) -> Option<ModuleDescriptor> {
        lock(&self.modules).get(index).cloned()
    }

    pub fn modules(&self) -> Vec<ModuleDescriptor> {
        lock(&self.modules).clone()
    }

    pub fn module_count(&self) -> usize {
        lock(&self.modules).len()
    }

    /// Reserves `size` bytes of TLS and returns their offset from the end of the TLS image.
    /// Offsets strictly decrease across calls with non-zero sizes.
    pub fn add_tls_partition(&self, size: usize) -> isize {
        let offset = self.tls.add_partition(size);
        debug!(size, offset, "added TLS partition");
        offset
    }

    /// Writes initial bytes of a TLS section into the image.
    pub fn write_tls_image(&self, offset: isize, bytes: &[u8]) -> bool {
        self.tls.write_image(offset, bytes)
    }

    pub fn tls_image(&self) -> Vec<u8> {
        self.tls.image()
    }

    pub fn tls_size(&self) -> usize {
        self.tls.size()
    }

    /// The calling thread's TLS copy, brought up to date with the image.
    pub fn thread_tls(&self) -> ThreadTls {
        self.tls.thread_copy()
    }

    /// Live threads holding a TLS copy. A thread's copy is released when it exits.
    pub fn tls_thread_count(&self) -> usize {
        self.tls.thread_count()
    }

    pub fn add_needed_library(&self, library: NeededLibrary) -> usize {
        let mut needed = lock(&self.needed);
        needed.push(library);
        needed.len() - 1
    }

    pub fn needed_libraries(&self) -> Vec<NeededLibrary> {
        lock(&self.needed).clone()
    }

    /// Adds a search path; duplicates are ignored.
    pub fn add_search_path(&self, kind: SearchPathKind, path: impl Into<PathBuf>) {
        lock(&self.search_paths).push(kind, path.into());
    }

    pub fn search_paths(&self, kind: SearchPathKind) -> Vec<PathBuf> {
        let paths = lock(&self.search_paths);
        match kind {
            SearchPathKind::Library => paths.library.clone(),
            SearchPathKind::Binary => paths.binary.clone(),
        }
    }

    pub fn argc(&self) -> usize {
        lock(&self.arguments).argc
    }

    /// Replaces the guest argument vector (and `argc` with it).
    pub fn set_args(&self, args: Vec<String>) {
        let mut arguments = lock(&self.arguments);
        arguments.argc = args.len();
        arguments.argv = args;
    }

    pub fn args(&self) -> Vec<String> {
        lock(&self.arguments).argv.clone()
    }

    pub fn push_env(&self, var: impl Into<String>) {
        lock(&self.arguments).env.push(var.into());
    }

    pub fn env(&self) -> Vec<String> {
        lock(&self.arguments).env.clone()
    }

    /// Records a signal the emulator intercepted; its default disposition is restored on
    /// teardown.
    pub fn note_signal(&self, signum: i32) {
        let mut signals = lock(&self.signals);
        if !signals.contains(&signum) {
            signals.push(signum);
        }
    }

    pub fn noted_signals(&self) -> Vec<i32> {
        lock(&self.signals).clone()
    }

    pub(crate) fn code(&self) -> Option<&CodeCache> {
        self.code.as_ref()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_torn_down() {
            Err(ContextError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn release(&self, kind: HandleKind) -> Option<TeardownReport> {
        let counter = match kind {
            HandleKind::Shared => &self.refs,
            HandleKind::Forked => &self.forks,
        };
        counter.fetch_sub(1, Ordering::AcqRel);
        if self.refs.load(Ordering::Acquire) != 0 || self.forks.load(Ordering::Acquire) != 0 {
            return None;
        }
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.teardown())
    }

    fn teardown(&self) -> TeardownReport {
        // Later attachments are refused once `torn_down` is set; this waits out one in flight.
        let mut subsystems = std::mem::take(&mut *lock(&self.subsystems));
        let mut report = TeardownReport::default();

        for stage in TeardownStage::ALL {
            let mut released = 0;
            for (_, subsystem) in subsystems.iter_mut().filter(|(s, _)| *s == stage) {
                debug!(%stage, name = subsystem.name(), "shutting down subsystem");
                subsystem.shutdown();
                released += 1;
            }
            released += match stage {
                TeardownStage::Modules => std::mem::take(&mut *lock(&self.modules)).len(),
                TeardownStage::Libraries => lock(&self.search_paths).clear(),
                TeardownStage::Arguments => {
                    let mut arguments = lock(&self.arguments);
                    let released = arguments.argv.len() + arguments.env.len();
                    *arguments = Arguments::default();
                    released
                }
                TeardownStage::CodeCache => self.code.as_ref().map_or(0, CodeCache::teardown),
                TeardownStage::ThreadLocalStorage => self.tls.clear(),
                TeardownStage::NeededLibraries => std::mem::take(&mut *lock(&self.needed)).len(),
                TeardownStage::Signals => {
                    let signals = std::mem::take(&mut *lock(&self.signals));
                    for &signum in &signals {
                        // SAFETY: resetting a disposition to the default has no memory effects.
                        unsafe { libc::signal(signum, libc::SIG_DFL) };
                    }
                    signals.len()
                }
                TeardownStage::Trace
                | TeardownStage::OsResources
                | TeardownStage::Bridge
                | TeardownStage::Callbacks => 0,
            };
            debug!(%stage, released, "context teardown stage");
            report.record(stage, released);
        }
        subsystems.clear();
        report
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("refs", &self.ref_count())
            .field("forks", &self.fork_depth())
            .field("torn_down", &self.is_torn_down())
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A logical sharer of the context.
    Shared,
    /// A forked process copy.
    Forked,
}

/// Counted reference to a [`Context`].
///
/// Dropping a handle releases it like [`ContextHandle::destroy`] but discards the report.
pub struct ContextHandle {
    context: Arc<Context>,
    kind: HandleKind,
}

impl ContextHandle {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Another logical sharer of the same context.
    pub fn share(&self) -> ContextHandle {
        self.context.refs.fetch_add(1, Ordering::AcqRel);
        ContextHandle {
            context: Arc::clone(&self.context),
            kind: HandleKind::Shared,
        }
    }

    /// A handle for a forked process copy; teardown waits for it too.
    pub fn fork(&self) -> ContextHandle {
        self.context.forks.fetch_add(1, Ordering::AcqRel);
        ContextHandle {
            context: Arc::clone(&self.context),
            kind: HandleKind::Forked,
        }
    }

    /// Releases this handle. Returns the teardown report when this was the last one.
    pub fn destroy(self) -> Option<TeardownReport> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never used or dropped again, so the Arc is moved out exactly once.
        let context = unsafe { ptr::read(&this.context) };
        context.release(this.kind)
    }

    /// Whether both handles refer to the same context.
    pub fn same_context(&self, other: &ContextHandle) -> bool {
        Arc::ptr_eq(&self.context, &other.context)
    }

    pub(crate) fn context_arc(&self) -> &Arc<Context> {
        &self.context
    }
}

impl Deref for ContextHandle {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        let _ = self.context.release(self.kind);
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .finish()
    }
}

/// Process-wide context slot for builds where every `create` shares one live context.
#[derive(Debug, Default)]
pub struct ContextSlot {
    live: Mutex<Option<Weak<Context>>>,
}

impl ContextSlot {
    pub const fn new() -> Self {
        Self {
            live: Mutex::new(None),
        }
    }

    /// Returns a new sharer of the live context, or creates one when there is none.
    pub fn create(&self, config: ContextConfig, argc: usize) -> Result<ContextHandle> {
        let mut live = lock(&self.live);
        if let Some(context) = live.as_ref().and_then(Weak::upgrade) {
            if !context.is_torn_down() {
                context.refs.fetch_add(1, Ordering::AcqRel);
                return Ok(ContextHandle {
                    context,
                    kind: HandleKind::Shared,
                });
            }
        }
        let handle = Context::create(config, argc)?;
        *live = Some(Arc::downgrade(&handle.context));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counted {
        name: &'static str,
        shutdowns: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Subsystem for Counted {
        fn name(&self) -> &str {
            self.name
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn interpreter_config() -> ContextConfig {
        ContextConfig {
            code_cache: false,
            ..ContextConfig::default()
        }
    }

    #[test]
    fn shared_handles_defer_teardown() {
        let first = Context::create(interpreter_config(), 2).unwrap();
        let second = first.share();
        assert!(first.same_context(&second));
        assert_eq!(first.ref_count(), 2);

        assert!(first.destroy().is_none());
        assert!(!second.is_torn_down());
        let report = second.destroy().unwrap();
        assert_eq!(report.stages().len(), TeardownStage::ALL.len());
    }

    #[test]
    fn forked_handle_keeps_context_alive() {
        let parent = Context::create(interpreter_config(), 0).unwrap();
        let child = parent.fork();
        assert_eq!(child.kind(), HandleKind::Forked);
        assert_eq!(parent.fork_depth(), 1);

        let observer = child.share();
        assert!(parent.destroy().is_none());
        assert!(observer.destroy().is_none());
        assert!(!child.is_torn_down());
        assert!(child.destroy().is_some());
    }

    #[test]
    fn dropping_last_handle_tears_down() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = Context::create(interpreter_config(), 0).unwrap();
        handle
            .attach(
                TeardownStage::Bridge,
                Box::new(Counted {
                    name: "bridge",
                    shutdowns: Arc::clone(&shutdowns),
                    log,
                }),
            )
            .unwrap();
        drop(handle);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_runs_stages_in_order() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = Context::create(interpreter_config(), 0).unwrap();
        for (stage, name) in [
            (TeardownStage::Callbacks, "callbacks"),
            (TeardownStage::Trace, "tracer"),
            (TeardownStage::OsResources, "stack"),
            (TeardownStage::Bridge, "bridge"),
            (TeardownStage::Libraries, "librarian"),
        ] {
            let subsystem = Counted {
                name,
                shutdowns: Arc::clone(&shutdowns),
                log: Arc::clone(&log),
            };
            handle.attach(stage, Box::new(subsystem)).unwrap();
        }

        let report = handle.destroy().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["librarian", "tracer", "stack", "bridge", "callbacks"]
        );
        assert_eq!(shutdowns.load(Ordering::SeqCst), 5);
        let order: Vec<TeardownStage> = report.stages().iter().map(|(s, _)| *s).collect();
        assert_eq!(order, TeardownStage::ALL);
    }

    #[test]
    fn registries_are_released_by_their_stage() {
        let handle = Context::create(interpreter_config(), 1).unwrap();
        handle.set_args(vec!["guest".into(), "-v".into()]);
        handle.push_env("HOME=/root");
        handle.add_search_path(SearchPathKind::Library, "/lib");
        handle.add_search_path(SearchPathKind::Library, "/lib");
        handle.add_search_path(SearchPathKind::Binary, "/bin");
        handle.add_needed_library(NeededLibrary::new("libc.so.6"));
        handle.add_tls_partition(8);
        handle.thread_tls();
        assert_eq!(handle.add_module(ModuleDescriptor::new("guest", 0x8048000, 0x1000)).unwrap(), 0);
        assert_eq!(handle.argc(), 2);

        let report = handle.destroy().unwrap();
        assert_eq!(report.released(TeardownStage::Modules), 1);
        assert_eq!(report.released(TeardownStage::Libraries), 2);
        assert_eq!(report.released(TeardownStage::Arguments), 3);
        assert_eq!(report.released(TeardownStage::CodeCache), 0);
        assert_eq!(report.released(TeardownStage::ThreadLocalStorage), 2);
        assert_eq!(report.released(TeardownStage::NeededLibraries), 1);
    }

    #[test]
    fn torn_down_context_refuses_work() {
        let handle = Context::create(interpreter_config(), 0).unwrap();
        let keep = Arc::clone(handle.context_arc());
        handle.destroy();
        assert!(keep.is_torn_down());
        assert!(matches!(keep.code_cache(), Err(ContextError::Destroyed)));
        assert!(matches!(
            keep.add_module(ModuleDescriptor::new("late", 0, 0)),
            Err(ContextError::Destroyed)
        ));

        let late = Counted {
            name: "late",
            shutdowns: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        };
        assert!(matches!(
            keep.attach(TeardownStage::Trace, Box::new(late)),
            Err(ContextError::Destroyed)
        ));
    }

    #[test]
    fn code_cache_disabled() {
        let handle = Context::create(interpreter_config(), 0).unwrap();
        assert!(matches!(handle.code_cache(), Err(ContextError::CodeCacheDisabled)));
    }

    #[test]
    fn slot_shares_live_context() {
        let slot = ContextSlot::new();
        let a = slot.create(interpreter_config(), 1).unwrap();
        let b = slot.create(interpreter_config(), 1).unwrap();
        assert!(a.same_context(&b));
        assert_eq!(a.ref_count(), 2);

        drop(a);
        assert!(b.destroy().is_some());
        let c = slot.create(interpreter_config(), 1).unwrap();
        assert!(!c.is_torn_down());
        assert_eq!(c.ref_count(), 1);
    }
}
