//! Per-scope variable storage.
//!
//! Each store sits behind its own reader/writer lock, so lookups arriving
//! from many descendant branches proceed in parallel while writers get
//! exclusive access. There is no table shared between scopes.

use crate::error::{ScopeError, ScopeResult};
use crate::value::TypedValue;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreStatus {
    Open,
    /// Read-only: the owning branch ended and waits to be joined.
    Frozen,
    /// Contents dropped with the owning node.
    Discarded,
}

#[derive(Debug)]
struct StoreState {
    bindings: HashMap<String, TypedValue>,
    status: StoreStatus,
}

/// Mapping from variable name to value, owned by exactly one scope node.
#[derive(Debug)]
pub struct VariableStore {
    owner: String,
    state: RwLock<StoreState>,
}

impl VariableStore {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: RwLock::new(StoreState {
                bindings: HashMap::new(),
                status: StoreStatus::Open,
            }),
        }
    }

    /// Id of the node that owns this store.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn readable(&self, state: &StoreState) -> ScopeResult<()> {
        if state.status == StoreStatus::Discarded {
            return Err(ScopeError::invariant(format!(
                "store of {} was discarded",
                self.owner
            )));
        }
        Ok(())
    }

    fn writable(&self, state: &StoreState) -> ScopeResult<()> {
        match state.status {
            StoreStatus::Open => Ok(()),
            StoreStatus::Frozen => Err(ScopeError::invariant(format!(
                "write reached frozen store of ended node {}",
                self.owner
            ))),
            StoreStatus::Discarded => self.readable(state),
        }
    }

    /// Absence is `Ok(None)`.
    pub fn read(&self, name: &str) -> ScopeResult<Option<TypedValue>> {
        let state = self.state.read();
        self.readable(&state)?;
        Ok(state.bindings.get(name).cloned())
    }

    pub fn contains(&self, name: &str) -> ScopeResult<bool> {
        let state = self.state.read();
        self.readable(&state)?;
        Ok(state.bindings.contains_key(name))
    }

    /// Insert or replace a binding. A replacement is stamped with the previous
    /// version plus one; the stamped value is returned.
    pub fn write(&self, name: &str, value: TypedValue) -> ScopeResult<TypedValue> {
        let mut state = self.state.write();
        self.writable(&state)?;
        Ok(Self::insert(&mut state, name, value))
    }

    /// Like [`write`](Self::write) but refuses to change the type of an
    /// existing binding. The check and the write happen under one lock.
    pub fn write_same_type(&self, name: &str, value: TypedValue) -> ScopeResult<TypedValue> {
        let mut state = self.state.write();
        self.writable(&state)?;
        Self::check_same_type(&state, name, &value)?;
        Ok(Self::insert(&mut state, name, value))
    }

    fn check_same_type(state: &StoreState, name: &str, value: &TypedValue) -> ScopeResult<()> {
        match state.bindings.get(name) {
            Some(existing) if existing.type_id() != value.type_id() => {
                Err(ScopeError::type_mismatch(
                    existing.type_id(),
                    value.type_id(),
                    format!("variable '{}'", name),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Apply a batch of writes atomically with respect to readers.
    pub fn write_all<I>(&self, entries: I) -> ScopeResult<usize>
    where
        I: IntoIterator<Item = (String, TypedValue)>,
    {
        let mut state = self.state.write();
        self.writable(&state)?;
        let mut count = 0;
        for (name, value) in entries {
            Self::insert(&mut state, &name, value);
            count += 1;
        }
        Ok(count)
    }

    /// Batch form of [`write_same_type`](Self::write_same_type). Every entry
    /// is checked before any is applied, so a mismatch leaves the store as it
    /// was.
    pub fn write_all_same_type<I>(&self, entries: I) -> ScopeResult<usize>
    where
        I: IntoIterator<Item = (String, TypedValue)>,
    {
        let entries: Vec<(String, TypedValue)> = entries.into_iter().collect();
        let mut state = self.state.write();
        self.writable(&state)?;
        for (name, value) in &entries {
            Self::check_same_type(&state, name, value)?;
        }
        let count = entries.len();
        for (name, value) in entries {
            Self::insert(&mut state, &name, value);
        }
        Ok(count)
    }

    fn insert(state: &mut StoreState, name: &str, value: TypedValue) -> TypedValue {
        let stamped = match state.bindings.get(name) {
            Some(previous) => value.with_version(previous.version() + 1),
            None => value,
        };
        state.bindings.insert(name.to_string(), stamped.clone());
        stamped
    }

    pub fn remove(&self, name: &str) -> ScopeResult<Option<TypedValue>> {
        let mut state = self.state.write();
        self.writable(&state)?;
        Ok(state.bindings.remove(name))
    }

    /// Point-in-time copy of every binding.
    pub fn snapshot(&self) -> ScopeResult<HashMap<String, TypedValue>> {
        let state = self.state.read();
        self.readable(&state)?;
        Ok(state.bindings.clone())
    }

    pub fn names(&self) -> ScopeResult<Vec<String>> {
        let state = self.state.read();
        self.readable(&state)?;
        let mut names: Vec<String> = state.bindings.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> usize {
        self.state.read().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the store read-only. Freezing a discarded store is a no-op.
    pub fn freeze(&self) {
        let mut state = self.state.write();
        if state.status == StoreStatus::Open {
            state.status = StoreStatus::Frozen;
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().status == StoreStatus::Frozen
    }

    /// Drop every binding; later access fails.
    pub fn discard(&self) {
        let mut state = self.state.write();
        state.bindings.clear();
        state.status = StoreStatus::Discarded;
    }

    pub fn is_discarded(&self) -> bool {
        self.state.read().status == StoreStatus::Discarded
    }
}
