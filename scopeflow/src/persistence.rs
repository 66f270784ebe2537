//! Persistence handoff.
//!
//! The engine does not persist anything by itself. At transaction boundaries
//! the scheduler takes a [`TreeSnapshot`] and hands it to a
//! [`PersistenceBackend`]; loading reverses that. Variable payloads travel in
//! the [`ValueEnvelope`] form produced by `TypedValue::serialize`.
//!
//! Each node's store is copied under its own lock, so a snapshot is only a
//! consistent image of the whole tree when branches are quiescent.

use crate::config::{EngineConfig, WritePolicy};
use crate::error::{ScopeError, ScopeResult};
use crate::node::{ChildSpec, ExecutionNode, LifecycleState, NodeId, NodeKind};
use crate::tree::ExecutionTree;
use crate::value::{TypeRegistry, ValueEnvelope};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub state: LifecycleState,
    pub write_policy: WritePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_seq: Option<u64>,
    #[serde(default)]
    pub variables: BTreeMap<String, ValueEnvelope>,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root_id: NodeId,
    pub taken_at: DateTime<Utc>,
    pub root: NodeSnapshot,
}

impl TreeSnapshot {
    pub fn to_json(&self) -> ScopeResult<String> {
        serde_json::to_string(self)
            .map_err(|e| ScopeError::Persistence(format!("Failed to serialize snapshot: {}", e)))
    }

    pub fn from_json(data: &str) -> ScopeResult<Self> {
        serde_json::from_str(data)
            .map_err(|e| ScopeError::Persistence(format!("Failed to deserialize snapshot: {}", e)))
    }
}

/// Storage collaborator for process instance state.
pub trait PersistenceBackend: Send + Sync {
    fn save(&self, snapshot: &TreeSnapshot) -> ScopeResult<()>;
    fn load(&self, root_id: &str) -> ScopeResult<Option<TreeSnapshot>>;
}

/// Keeps serialized snapshots in memory, keyed by root id.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    snapshots: RwLock<HashMap<NodeId, String>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceBackend for InMemoryPersistence {
    fn save(&self, snapshot: &TreeSnapshot) -> ScopeResult<()> {
        let data = snapshot.to_json()?;
        self.snapshots.write().insert(snapshot.root_id.clone(), data);
        Ok(())
    }

    fn load(&self, root_id: &str) -> ScopeResult<Option<TreeSnapshot>> {
        match self.snapshots.read().get(root_id) {
            Some(data) => TreeSnapshot::from_json(data).map(Some),
            None => Ok(None),
        }
    }
}

fn capture(node: &ExecutionNode) -> ScopeResult<NodeSnapshot> {
    let mut variables = BTreeMap::new();
    if let Some(store) = node.store() {
        for (name, value) in store.snapshot()? {
            variables.insert(name, value.to_envelope()?);
        }
    }
    let children = node
        .children()
        .iter()
        .map(|child| capture(child))
        .collect::<ScopeResult<Vec<_>>>()?;
    Ok(NodeSnapshot {
        id: node.id().to_string(),
        name: node.name().map(str::to_string),
        kind: node.kind(),
        state: node.lifecycle_state(),
        write_policy: node.write_policy(),
        completion_seq: node.completion_seq(),
        variables,
        children,
    })
}

fn rebuild(
    node: &Arc<ExecutionNode>,
    snapshot: &NodeSnapshot,
    registry: &TypeRegistry,
) -> ScopeResult<()> {
    if !snapshot.variables.is_empty() {
        let store = node.store().ok_or_else(|| {
            ScopeError::Persistence(format!(
                "node {} has variables but is not a scope",
                snapshot.id
            ))
        })?;
        let values = snapshot
            .variables
            .iter()
            .map(|(name, envelope)| Ok((name.clone(), registry.from_envelope(envelope)?)))
            .collect::<ScopeResult<Vec<_>>>()?;
        store.write_all(values)?;
    }

    let mut specs = Vec::with_capacity(snapshot.children.len());
    for child in &snapshot.children {
        if child.kind == NodeKind::Root {
            return Err(ScopeError::Persistence(format!(
                "root kind found below the root at node {}",
                child.id
            )));
        }
        if child.state == LifecycleState::Cancelled
            || (child.state == LifecycleState::Ended && child.kind != NodeKind::Branch)
        {
            return Err(ScopeError::Persistence(format!(
                "node {} is {} and cannot be attached",
                child.id, child.state
            )));
        }
        specs.push(ChildSpec {
            id: child.id.clone(),
            kind: child.kind,
            name: child.name.clone(),
            write_policy: child.write_policy,
        });
    }
    let created = node.spawn_children(specs).map_err(|state| {
        ScopeError::Persistence(format!("cannot attach children to {} node {}", state, node.id()))
    })?;

    for (child, child_snapshot) in created.iter().zip(&snapshot.children) {
        rebuild(child, child_snapshot, registry)?;
    }

    // Re-end branches in their recorded order to restore completion ranks.
    let mut ended: Vec<(&Arc<ExecutionNode>, &NodeSnapshot)> = created
        .iter()
        .zip(&snapshot.children)
        .filter(|(_, s)| s.state == LifecycleState::Ended)
        .collect();
    ended.sort_by_key(|(_, s)| s.completion_seq.unwrap_or(u64::MAX));
    for (child, _) in ended {
        child.end()?;
    }
    Ok(())
}

impl ExecutionTree {
    /// Capture the attached part of the tree.
    pub fn snapshot(&self) -> ScopeResult<TreeSnapshot> {
        if !self.root().is_active() {
            return Err(ScopeError::Persistence(format!(
                "process instance {} is no longer active",
                self.root_id()
            )));
        }
        Ok(TreeSnapshot {
            root_id: self.root_id().to_string(),
            taken_at: Utc::now(),
            root: capture(self.root())?,
        })
    }

    /// Rebuild a process instance from a snapshot.
    pub fn restore(
        snapshot: &TreeSnapshot,
        config: EngineConfig,
        registry: TypeRegistry,
    ) -> ScopeResult<Self> {
        if snapshot.root.kind != NodeKind::Root || snapshot.root.id != snapshot.root_id {
            return Err(ScopeError::Persistence(format!(
                "snapshot {} does not start at its root",
                snapshot.root_id
            )));
        }
        // The root keeps the write policy it was created with.
        let root = ExecutionNode::new_root(
            snapshot.root_id.clone(),
            snapshot.root.name.clone(),
            snapshot.root.write_policy,
        );
        let tree = ExecutionTree::from_root(root, config, registry);
        let registry = Arc::clone(tree.registry());
        rebuild(tree.root(), &snapshot.root, &registry)?;
        log::debug!(
            "Restored process instance {} ({} nodes)",
            tree.root_id(),
            tree.node_count()
        );
        Ok(tree)
    }

    pub fn save_to(&self, backend: &dyn PersistenceBackend) -> ScopeResult<()> {
        backend.save(&self.snapshot()?)
    }

    pub fn load_from(
        backend: &dyn PersistenceBackend,
        root_id: &str,
        config: EngineConfig,
        registry: TypeRegistry,
    ) -> ScopeResult<Option<Self>> {
        match backend.load(root_id)? {
            Some(snapshot) => Ok(Some(Self::restore(&snapshot, config, registry)?)),
            None => Ok(None),
        }
    }
}
