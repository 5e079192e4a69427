//! Keyed arena of serialized scopes.
//!
//! Every component that mutates ratchet state owns one arena keyed by its
//! scope: room id for group sessions, transaction id for verification, peer
//! device for pairwise sessions. Each key maps to its own async mutex, so two
//! operations on the same scope run one at a time while operations on
//! different scopes run in parallel.
//!
//! The arena's own map lock is a short synchronous critical section (lookup or
//! insert of a handle). It is never held across an await.

#![allow(clippy::disallowed_types, reason = "Map lock is never held across an await")]

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

/// Handle to one serialized scope.
pub(crate) type ScopeHandle<V> = Arc<tokio::sync::Mutex<V>>;

/// Arena of per-key async mutexes.
pub(crate) struct ScopeArena<K, V> {
    scopes: Mutex<HashMap<K, ScopeHandle<V>>>,
}

impl<K, V> ScopeArena<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self { scopes: Mutex::new(HashMap::new()) }
    }

    /// Handle for `key`, creating the scope with `init` if absent.
    pub(crate) fn get_or_insert_with(&self, key: &K, init: impl FnOnce() -> V) -> ScopeHandle<V> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            scopes.entry(key.clone()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(init()))),
        )
    }

    /// Handle for `key` if the scope exists.
    pub(crate) fn get(&self, key: &K) -> Option<ScopeHandle<V>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).get(key).map(Arc::clone)
    }

    /// Insert a scope, replacing any previous handle for the key.
    pub(crate) fn insert(&self, key: K, value: V) -> ScopeHandle<V> {
        let handle = Arc::new(tokio::sync::Mutex::new(value));
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).insert(key, Arc::clone(&handle));
        handle
    }

    /// Snapshot of all scope handles.
    pub(crate) fn handles(&self) -> Vec<(K, ScopeHandle<V>)> {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Drop the scope for `key`. Holders of its handle keep the value alive
    /// until they release it.
    pub(crate) fn remove(&self, key: &K) -> Option<ScopeHandle<V>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<K, V> Default for ScopeArena<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_returns_same_scope() {
        let arena: ScopeArena<u32, u32> = ScopeArena::new();
        let a = arena.get_or_insert_with(&1, || 10);
        let b = arena.get_or_insert_with(&1, || 20);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b.lock().await, 10, "second init must not run");
        assert_eq!(arena.len(), 1);
    }

    #[tokio::test]
    async fn removed_scope_is_recreated_fresh() {
        let arena: ScopeArena<u32, u32> = ScopeArena::new();
        let old = arena.get_or_insert_with(&1, || 10);
        arena.get_or_insert_with(&2, || 20);

        assert!(arena.remove(&1).is_some());
        assert!(arena.remove(&1).is_none());
        assert_eq!(arena.len(), 1);
        assert!(arena.get(&1).is_none());

        // The detached handle still works for whoever held it.
        *old.lock().await += 1;
        let fresh = arena.get_or_insert_with(&1, || 0);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(*fresh.lock().await, 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let arena: ScopeArena<u32, u32> = ScopeArena::new();
        let a = arena.get_or_insert_with(&1, || 0);
        let b = arena.get_or_insert_with(&2, || 0);

        let _held = a.lock().await;
        let other = tokio::time::timeout(Duration::from_millis(50), b.lock()).await;
        assert!(other.is_ok(), "scope 2 must be lockable while scope 1 is held");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_scope_serializes_mutations() {
        let arena: Arc<ScopeArena<&'static str, Vec<u32>>> = Arc::new(ScopeArena::new());

        let mut tasks = Vec::new();
        for i in 0..32 {
            let arena = Arc::clone(&arena);
            tasks.push(tokio::spawn(async move {
                let handle = arena.get_or_insert_with(&"room", Vec::new);
                let mut guard = handle.lock().await;
                let len = guard.len();
                tokio::task::yield_now().await;
                guard.push(i);
                assert_eq!(guard.len(), len + 1);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let handle = arena.get(&"room").unwrap();
        assert_eq!(handle.lock().await.len(), 32);
    }
}
