//! Guest thread-local storage.
//!
//! All TLS sections of loaded modules live in one image. Each new section is placed in front of
//! the existing ones and addressed by a negative offset from the image's end, so growing the image
//! never moves an already-assigned section relative to the end.
//!
//! Per-thread copies are dropped from the store when their thread exits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

/// One thread's copy of the TLS image.
#[derive(Debug, Clone, Default)]
pub struct ThreadTls(Arc<Mutex<Vec<u8>>>);

impl ThreadTls {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Reads `buf.len()` bytes at the end-relative `offset`. Returns `false` when out of bounds.
    pub fn read(&self, offset: isize, buf: &mut [u8]) -> bool {
        let data = self.lock();
        match resolve(data.len(), offset, buf.len()) {
            Some(range) => {
                buf.copy_from_slice(&data[range]);
                true
            }
            None => false,
        }
    }

    /// Writes `bytes` at the end-relative `offset`. Returns `false` when out of bounds.
    pub fn write(&self, offset: isize, bytes: &[u8]) -> bool {
        let mut data = self.lock();
        match resolve(data.len(), offset, bytes.len()) {
            Some(range) => {
                data[range].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Maps an end-relative offset to a range of a `len`-byte buffer.
fn resolve(len: usize, offset: isize, count: usize) -> Option<std::ops::Range<usize>> {
    if offset > 0 {
        return None;
    }
    let start = len.checked_sub(offset.unsigned_abs())?;
    let end = start.checked_add(count)?;
    (end <= len).then_some(start..end)
}

type ThreadCopies = Mutex<HashMap<ThreadId, ThreadTls>>;

/// Removes the owning thread's copy from a store when the thread exits.
struct ExitHook {
    threads: Weak<ThreadCopies>,
    id: ThreadId,
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if let Some(threads) = self.threads.upgrade() {
            lock(&threads).remove(&self.id);
        }
    }
}

thread_local! {
    static EXIT_HOOKS: RefCell<Vec<ExitHook>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
pub(crate) struct TlsStore {
    image: Mutex<Vec<u8>>,
    threads: Arc<ThreadCopies>,
}

impl TlsStore {
    /// Grows the image by `size` zeroed bytes in front of the existing sections. Returns the new
    /// section's offset, which is minus the new image size.
    pub(crate) fn add_partition(&self, size: usize) -> isize {
        let mut image = lock(&self.image);
        image.splice(0..0, std::iter::repeat(0).take(size));
        -(image.len() as isize)
    }

    pub(crate) fn size(&self) -> usize {
        lock(&self.image).len()
    }

    pub(crate) fn image(&self) -> Vec<u8> {
        lock(&self.image).clone()
    }

    /// Initializes image bytes (e.g. a module's `.tdata`) at an end-relative offset.
    pub(crate) fn write_image(&self, offset: isize, bytes: &[u8]) -> bool {
        let mut image = lock(&self.image);
        match resolve(image.len(), offset, bytes.len()) {
            Some(range) => {
                image[range].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// The calling thread's copy, created from the image on first use. When the image has grown
    /// since, the new leading sections are filled in from the image and the thread's existing
    /// sections keep their end-relative position and contents.
    pub(crate) fn thread_copy(&self) -> ThreadTls {
        let image = lock(&self.image);
        let mut threads = lock(&self.threads);
        let id = thread::current().id();
        let copy = match threads.get(&id) {
            Some(copy) => copy.clone(),
            None => {
                let copy = ThreadTls::default();
                threads.insert(id, copy.clone());
                self.hook_thread_exit(id);
                copy
            }
        };

        let mut data = copy.lock();
        if data.len() < image.len() {
            let grown = image.len() - data.len();
            data.splice(0..0, image[..grown].iter().copied());
        }
        drop(data);
        copy
    }

    /// Number of threads currently holding a copy.
    pub(crate) fn thread_count(&self) -> usize {
        lock(&self.threads).len()
    }

    fn hook_thread_exit(&self, id: ThreadId) {
        let hook = ExitHook {
            threads: Arc::downgrade(&self.threads),
            id,
        };
        // During the thread's own TLS teardown the hook list is gone; the copy then stays until
        // `clear`.
        let _ = EXIT_HOOKS.try_with(|hooks| {
            let mut hooks = hooks.borrow_mut();
            hooks.retain(|hook| hook.threads.strong_count() != 0);
            hooks.push(hook);
        });
    }

    /// Drops the image and every per-thread copy. Returns how many buffers were released.
    pub(crate) fn clear(&self) -> usize {
        let mut image = lock(&self.image);
        let mut released = usize::from(!image.is_empty());
        *image = Vec::new();
        let mut threads = lock(&self.threads);
        released += threads.len();
        threads.clear();
        released
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
