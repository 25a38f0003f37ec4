use std::fmt;

/// Teardown stages, in the order they run.
///
/// Later stages release the primitives that earlier-released structures depend on, so the code
/// cache goes before the OS resources, bridge and callbacks that in-flight work may still touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TeardownStage {
    /// Loaded-module records.
    Modules,
    /// Library search paths and library collaborators.
    Libraries,
    /// Translator and tracer state.
    Trace,
    /// Argument and environment vectors.
    Arguments,
    /// Global block list, block map, arenas and oversized mappings.
    CodeCache,
    /// Library handles, guest stacks and other OS-level resources.
    OsResources,
    /// Syscall bridge.
    Bridge,
    /// Callback registry.
    Callbacks,
    /// TLS image and per-thread copies.
    ThreadLocalStorage,
    NeededLibraries,
    /// Restores default dispositions for intercepted signals.
    Signals,
}

impl TeardownStage {
    pub const ALL: [TeardownStage; 11] = [
        TeardownStage::Modules,
        TeardownStage::Libraries,
        TeardownStage::Trace,
        TeardownStage::Arguments,
        TeardownStage::CodeCache,
        TeardownStage::OsResources,
        TeardownStage::Bridge,
        TeardownStage::Callbacks,
        TeardownStage::ThreadLocalStorage,
        TeardownStage::NeededLibraries,
        TeardownStage::Signals,
    ];
}

impl fmt::Display for TeardownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStage::Modules => "modules",
            TeardownStage::Libraries => "libraries",
            TeardownStage::Trace => "trace",
            TeardownStage::Arguments => "arguments",
            TeardownStage::CodeCache => "code cache",
            TeardownStage::OsResources => "os resources",
            TeardownStage::Bridge => "bridge",
            TeardownStage::Callbacks => "callbacks",
            TeardownStage::ThreadLocalStorage => "thread-local storage",
            TeardownStage::NeededLibraries => "needed libraries",
            TeardownStage::Signals => "signals",
        };
        f.write_str(name)
    }
}

/// An external collaborator owned by a context and shut down during one teardown stage.
pub trait Subsystem: Send {
    fn name(&self) -> &str;

    /// Releases everything the collaborator holds. Called exactly once.
    fn shutdown(&mut self);
}

/// What a teardown released, stage by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    stages: Vec<(TeardownStage, usize)>,
}

impl TeardownReport {
    pub(crate) fn record(&mut self, stage: TeardownStage, released: usize) {
        self.stages.push((stage, released));
    }

    /// `(stage, resources released)` in execution order.
    pub fn stages(&self) -> &[(TeardownStage, usize)] {
        &self.stages
    }

    pub fn released(&self, stage: TeardownStage) -> usize {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map_or(0, |(_, n)| *n)
    }

    pub fn total(&self) -> usize {
        self.stages.iter().map(|(_, n)| n).sum()
    }
}
