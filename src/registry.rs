//! Handle-keyed object registries.
//!
//! Native code only ever hands back opaque addresses (the runtime instance,
//! a userdata block). These registries map such addresses to host-owned
//! values so callbacks can find their way back to host logic.
//!
//! Entries are removed only when the native side says the handle is dead
//! (the userdata finalizer, or the wrapper being closed). The host never
//! prunes entries on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// An opaque native address used purely as a lookup key.
///
/// Two handles are equal iff they denote the same native object. A handle is
/// never dereferenced by the host.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    /// Wrap a native address.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Handle(ptr as usize)
    }

    /// The raw address, for diagnostics.
    pub fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

/// A plain handle → value map.
///
/// Used for the per-instance registry, which is only touched from the thread
/// driving its runtime (including callbacks re-entered on that same thread).
#[derive(Debug)]
pub struct Registry<V> {
    entries: HashMap<Handle, V>,
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&V> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut V> {
        self.entries.get_mut(&handle)
    }

    /// Record a value, silently replacing any previous entry.
    pub fn set(&mut self, handle: Handle, value: V) {
        self.entries.insert(handle, value);
    }

    /// Forget a handle. Absent handles are ignored.
    pub fn remove(&mut self, handle: Handle) -> Option<V> {
        self.entries.remove(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry whose operations are serialized behind one mutex.
///
/// This is the variant for tables consulted from whatever native thread
/// happens to fire a callback. Values are returned by copy so the lock is
/// never held while the caller acts on the result.
#[derive(Debug)]
pub struct SyncRegistry<V> {
    inner: Mutex<Registry<V>>,
}

impl<V: Clone> SyncRegistry<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::new()),
        }
    }

    pub fn get(&self, handle: Handle) -> Option<V> {
        self.lock().get(handle).cloned()
    }

    pub fn set(&self, handle: Handle, value: V) {
        self.lock().set(handle, value);
    }

    pub fn remove(&self, handle: Handle) -> Option<V> {
        self.lock().remove(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().contains(handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<V>> {
        // Single map operations leave no torn state; poisoning is ignored.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V: Clone> Default for SyncRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}
