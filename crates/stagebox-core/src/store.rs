//! In-memory staged state, sharded by (account, region).
//!
//! Every scope's [`State`] is held serialized inside a [`SecureBuffer`].
//! Writes destroy the previous buffer before it is released, and storing an
//! empty state removes the scope altogether, so "is anything staged
//! anywhere" is just "is the map empty".
//!
//! All access goes through one reader/writer lock. Reads share it, writes
//! are exclusive; `update` holds the write lock across read-modify-write so
//! concurrent mutations of one scope never lose updates.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::protocol::{State, StateKey};
use crate::secrets::SecureBuffer;

/// Errors from the state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store lock poisoned")]
    Poisoned,

    #[error("failed to encode staged state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode staged state for {key}: {source}")]
    Decode {
        key: StateKey,
        source: serde_json::Error,
    },
}

/// Process-wide staged state, one secure buffer per scope.
#[derive(Debug, Default)]
pub struct SecureStateStore {
    scopes: RwLock<HashMap<StateKey, SecureBuffer>>,
}

impl SecureStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a scope's state. Unknown scopes yield an empty state.
    pub fn get(&self, key: &StateKey) -> Result<State, StoreError> {
        let scopes = self.scopes.read().map_err(|_| StoreError::Poisoned)?;
        decode(key, scopes.get(key))
    }

    /// Replace a scope's state. An empty state removes the scope.
    pub fn set(&self, key: &StateKey, state: &State) -> Result<(), StoreError> {
        let buffer = encode(state)?;
        let mut scopes = self.scopes.write().map_err(|_| StoreError::Poisoned)?;
        replace(&mut scopes, key, buffer);
        Ok(())
    }

    /// Read-modify-write one scope under the write lock.
    ///
    /// `f` sees the current state (empty for unknown scopes) and may mutate
    /// it. When `f` returns `Ok`, the mutated state is written back; when it
    /// returns `Err`, the scope is left untouched and the error is passed
    /// through.
    pub fn update<T, E>(
        &self,
        key: &StateKey,
        f: impl FnOnce(&mut State) -> Result<T, E>,
    ) -> Result<Result<T, E>, StoreError> {
        let mut scopes = self.scopes.write().map_err(|_| StoreError::Poisoned)?;
        let mut state = decode(key, scopes.get(key))?;
        let out = match f(&mut state) {
            Ok(out) => out,
            Err(e) => return Ok(Err(e)),
        };
        let buffer = encode(&state)?;
        replace(&mut scopes, key, buffer);
        Ok(Ok(out))
    }

    /// True iff no scope holds any staged entry or tag change.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        let scopes = self.scopes.read().map_err(|_| StoreError::Poisoned)?;
        Ok(scopes.is_empty())
    }

    /// Number of scopes currently holding staged state.
    pub fn scope_count(&self) -> Result<usize, StoreError> {
        let scopes = self.scopes.read().map_err(|_| StoreError::Poisoned)?;
        Ok(scopes.len())
    }

    /// Wipe and drop every scope.
    ///
    /// Recovers from a poisoned lock: wiping must happen regardless.
    pub fn destroy(&self) {
        let mut scopes = match self.scopes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = scopes.len();
        for buffer in scopes.values_mut() {
            buffer.destroy();
        }
        scopes.clear();
        debug!(scopes = count, "state store destroyed");
    }
}

fn decode(key: &StateKey, buffer: Option<&SecureBuffer>) -> Result<State, StoreError> {
    match buffer {
        Some(buffer) => buffer.to_json().map_err(|source| StoreError::Decode {
            key: key.clone(),
            source,
        }),
        None => Ok(State::new()),
    }
}

/// `None` for empty states, which are never stored.
fn encode(state: &State) -> Result<Option<SecureBuffer>, StoreError> {
    if state.is_empty() {
        return Ok(None);
    }
    SecureBuffer::from_json(state)
        .map(Some)
        .map_err(StoreError::Encode)
}

fn replace(
    scopes: &mut HashMap<StateKey, SecureBuffer>,
    key: &StateKey,
    buffer: Option<SecureBuffer>,
) {
    let previous = match buffer {
        Some(buffer) => scopes.insert(key.clone(), buffer),
        None => scopes.remove(key),
    };
    if let Some(mut previous) = previous {
        previous.destroy();
    }
    trace!(scope = %key, scopes = scopes.len(), "scope state replaced");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Entry, Service, TagEntry};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn key(account: &str) -> StateKey {
        StateKey::new(account, "us-east-1")
    }

    fn state_with(name: &str, value: &str) -> State {
        let mut state = State::new();
        state
            .entries_mut(Service::Param)
            .insert(name.to_string(), Entry::update(value));
        state
    }

    #[test]
    fn test_unknown_scope_is_empty_state() {
        let store = SecureStateStore::new();
        let state = store.get(&key("1")).unwrap();
        assert!(state.is_empty());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_set_then_get() {
        let store = SecureStateStore::new();
        let state = state_with("/app/url", "https://example.com");
        store.set(&key("1"), &state).unwrap();

        assert_eq!(store.get(&key("1")).unwrap(), state);
        assert!(!store.is_empty().unwrap());
        assert_eq!(store.scope_count().unwrap(), 1);
    }

    #[test]
    fn test_set_empty_removes_scope() {
        let store = SecureStateStore::new();
        store.set(&key("1"), &state_with("/a", "1")).unwrap();
        store.set(&key("1"), &State::new()).unwrap();

        assert!(store.is_empty().unwrap());
        assert_eq!(store.scope_count().unwrap(), 0);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let store = SecureStateStore::new();
        store.set(&key("1"), &state_with("/a", "1")).unwrap();

        assert!(store.get(&key("2")).unwrap().is_empty());
        assert!(
            store
                .get(&StateKey::new("1", "eu-west-1"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_tag_only_state_is_kept() {
        let store = SecureStateStore::new();
        let mut state = State::new();
        state
            .tags_mut(Service::Secret)
            .insert("db".into(), TagEntry::new().add("owner", "ops"));
        store.set(&key("1"), &state).unwrap();
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_update_error_leaves_state_untouched() {
        let store = SecureStateStore::new();
        store.set(&key("1"), &state_with("/a", "1")).unwrap();

        let result: Result<(), &str> = store
            .update(&key("1"), |state| {
                state.clear(None);
                Err("nope")
            })
            .unwrap();
        assert_eq!(result, Err("nope"));
        assert_eq!(store.get(&key("1")).unwrap().entry_count(), 1);
    }

    #[test]
    fn test_destroy_clears_everything() {
        let store = SecureStateStore::new();
        store.set(&key("1"), &state_with("/a", "1")).unwrap();
        store.set(&key("2"), &state_with("/b", "2")).unwrap();

        store.destroy();
        assert!(store.is_empty().unwrap());
        assert!(store.get(&key("1")).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(SecureStateStore::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update(&key("1"), |state| {
                            state
                                .entries_mut(Service::Param)
                                .insert(format!("/p/{i}"), Entry::create(i.to_string()));
                            Ok::<_, ()>(())
                        })
                        .unwrap()
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(&key("1")).unwrap().entry_count(), 16);
    }
}
