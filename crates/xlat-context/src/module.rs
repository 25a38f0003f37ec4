use std::ops::Range;
use std::path::PathBuf;

/// A loaded guest image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    /// Load base and mapped size of the whole image.
    pub base: u64,
    pub size: u64,
    /// Executable guest range, registered with the block map when the code cache is enabled.
    /// Empty for images without code.
    pub code: Range<u64>,
    /// Size of the image's TLS section, 0 if it has none.
    pub tls_size: usize,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, base: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            base,
            size,
            code: base..base.saturating_add(size),
            tls_size: 0,
        }
    }

    pub fn with_code(mut self, code: Range<u64>) -> Self {
        self.code = code;
        self
    }

    pub fn with_tls(mut self, tls_size: usize) -> Self {
        self.tls_size = tls_size;
        self
    }
}

/// A library the guest program depends on, possibly not yet resolved to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededLibrary {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl NeededLibrary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }
}

/// Which search collection a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPathKind {
    /// Library search path (`LD_LIBRARY_PATH`-style).
    Library,
    /// Executable search path (`PATH`-style).
    Binary,
}

#[derive(Debug, Default)]
pub(crate) struct SearchPaths {
    pub(crate) library: Vec<PathBuf>,
    pub(crate) binary: Vec<PathBuf>,
}

impl SearchPaths {
    pub(crate) fn push(&mut self, kind: SearchPathKind, path: PathBuf) {
        let list = match kind {
            SearchPathKind::Library => &mut self.library,
            SearchPathKind::Binary => &mut self.binary,
        };
        if !list.contains(&path) {
            list.push(path);
        }
    }

    pub(crate) fn clear(&mut self) -> usize {
        let released = self.library.len() + self.binary.len();
        self.library.clear();
        self.binary.clear();
        released
    }
}
