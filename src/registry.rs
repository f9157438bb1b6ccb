//! Content-keyed, first-reference-registered entity registries.
//!
//! Grounded in `hpcprof::util::OnceFlag`/`call_once`
//! (`original_source/src/hpcprof/util/once.hpp`): an entity referenced by
//! many contexts must still only be processed once. Each key gets its own
//! `OnceLock`, so concurrent first-references to *different* keys don't
//! contend, and concurrent first-references to the *same* key block on one
//! winner doing the work.
//!
//! Insertion order is preserved (`indexmap::IndexMap`, not `HashMap`) the
//! same way `symbolic-symcache`'s converter keeps first-seen order for
//! files and functions with `indexmap::IndexSet` — the meta.db Files,
//! Modules and Functions sections are emitted in first-reference order.

use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::Mutex;

/// A one-shot-per-key registry of entities discovered while walking a
/// context tree.
pub struct Registry<K, V> {
    entries: Mutex<IndexMap<K, Arc<OnceLock<V>>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Returns the value registered for `key`, computing it with `init` on
    /// the first reference and reusing that result on every subsequent
    /// one, regardless of how many callers race to register the same key.
    pub fn get_or_init(&self, key: K, init: impl FnOnce() -> V) -> V {
        let cell = {
            let mut entries = self.entries.lock();
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };
        cell.get_or_init(init).clone()
    }

    /// Consumes the registry, returning its entries in first-reference
    /// order.
    pub fn into_entries(self) -> Vec<(K, V)> {
        self.entries
            .into_inner()
            .into_iter()
            .map(|(k, cell)| {
                let v = cell
                    .get()
                    .cloned()
                    .expect("registry entry was never initialized");
                (k, v)
            })
            .collect()
    }

    /// Takes the registry's entries out (leaving it empty), in
    /// first-reference order.
    ///
    /// Used instead of [`into_entries`](Self::into_entries) by
    /// [`crate::Writer::write`], which only ever holds `&self` — the
    /// [`Registry`] lives inside the long-lived `Writer`, not a value moved
    /// out at write time.
    pub fn drain(&self) -> Vec<(K, V)> {
        let taken = std::mem::take(&mut *self.entries.lock());
        taken
            .into_iter()
            .map(|(k, cell)| {
                let v = cell
                    .get()
                    .cloned()
                    .expect("registry entry was never initialized");
                (k, v)
            })
            .collect()
    }

    /// The number of distinct keys registered so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no key has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn repeated_references_only_initialize_once() {
        let registry: Registry<u32, u32> = Registry::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let value = registry.get_or_init(1, || {
                calls.fetch_add(1, Ordering::SeqCst);
                42
            });
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn preserves_first_reference_order() {
        let registry: Registry<&'static str, u32> = Registry::new();
        registry.get_or_init("b", || 2);
        registry.get_or_init("a", || 1);
        registry.get_or_init("b", || 2);
        let entries = registry.into_entries();
        assert_eq!(entries, vec![("b", 2), ("a", 1)]);
    }
}
