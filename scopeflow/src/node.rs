//! Execution tree nodes.
//!
//! Ownership flows strictly downward: a node holds strong references to its
//! children and only a `Weak` back-reference to its parent. Ending or
//! cancelling a node destroys its subtree; a node never outlives its parent
//! in the tree.
//!
//! Lock order is always lifecycle state before children, parent before child.
//! Join locks follow the same rule: a parent's before its branch's.

use crate::config::WritePolicy;
use crate::error::{ScopeError, ScopeResult};
use crate::store::VariableStore;
use crate::value::TypedValue;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Identifier of an execution node (opaque string).
pub type NodeId = String;

pub fn new_node_id() -> NodeId {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Active,
    Ended,
    Cancelled,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Ended => write!(f, "ended"),
            LifecycleState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structural role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Process instance root; always a scope.
    Root,
    /// Sub-scope such as a sub-process or loop iteration.
    Scope,
    /// Plain step without its own variables.
    Activity,
    /// Concurrent branch created by a fork; a scope and an isolation boundary.
    Branch,
}

impl NodeKind {
    pub fn is_scope(self) -> bool {
        !matches!(self, NodeKind::Activity)
    }
}

/// One node of a running process's tree.
pub struct ExecutionNode {
    id: NodeId,
    name: Option<String>,
    kind: NodeKind,
    depth: usize,
    write_policy: WritePolicy,
    parent: Weak<ExecutionNode>,
    children: RwLock<Vec<Arc<ExecutionNode>>>,
    store: Option<VariableStore>,
    state: RwLock<LifecycleState>,
    detached: AtomicBool,
    /// Store contents when the branch was forked; join diffs against it.
    fork_baseline: Option<HashMap<String, TypedValue>>,
    /// Completion rank among siblings, 0 until the branch ends.
    completion_seq: AtomicU64,
    /// Source of completion ranks for this node's branches.
    completion_counter: AtomicU64,
    /// Held by a join on this node and by lifecycle changes of the node and
    /// of its branches.
    join_lock: Mutex<()>,
}

/// Blueprint for a node about to be attached to a parent.
#[derive(Debug, Clone)]
pub(crate) struct ChildSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: Option<String>,
    pub write_policy: WritePolicy,
}

impl ChildSpec {
    pub fn new(kind: NodeKind, name: Option<String>, write_policy: WritePolicy) -> Self {
        Self {
            id: new_node_id(),
            kind,
            name,
            write_policy,
        }
    }
}

impl ExecutionNode {
    pub(crate) fn new_root(id: NodeId, name: Option<String>, write_policy: WritePolicy) -> Arc<Self> {
        Arc::new(Self::build(
            ChildSpec {
                id,
                kind: NodeKind::Root,
                name,
                write_policy,
            },
            Weak::new(),
            0,
        ))
    }

    fn build(spec: ChildSpec, parent: Weak<ExecutionNode>, depth: usize) -> Self {
        let store = spec
            .kind
            .is_scope()
            .then(|| VariableStore::new(spec.id.clone()));
        let fork_baseline = if spec.kind == NodeKind::Branch {
            store.as_ref().and_then(|s| s.snapshot().ok())
        } else {
            None
        };
        Self {
            id: spec.id,
            name: spec.name,
            kind: spec.kind,
            depth,
            write_policy: spec.write_policy,
            parent,
            children: RwLock::new(Vec::new()),
            store,
            state: RwLock::new(LifecycleState::Active),
            detached: AtomicBool::new(false),
            fork_baseline,
            completion_seq: AtomicU64::new(0),
            completion_counter: AtomicU64::new(0),
            join_lock: Mutex::new(()),
        }
    }

    /// Attach new children in one step. Fails with the current state when
    /// this node is no longer active, in which case nothing is attached.
    pub(crate) fn spawn_children(
        self: &Arc<Self>,
        specs: Vec<ChildSpec>,
    ) -> Result<Vec<Arc<ExecutionNode>>, LifecycleState> {
        let state = self.state.read();
        if *state != LifecycleState::Active {
            return Err(*state);
        }
        let created: Vec<Arc<ExecutionNode>> = specs
            .into_iter()
            .map(|spec| Arc::new(Self::build(spec, Arc::downgrade(self), self.depth + 1)))
            .collect();
        self.children.write().extend(created.iter().cloned());
        Ok(created)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_scope(&self) -> bool {
        self.kind.is_scope()
    }

    pub fn is_root(&self) -> bool {
        self.kind == NodeKind::Root
    }

    pub fn is_branch(&self) -> bool {
        self.kind == NodeKind::Branch
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle_state() == LifecycleState::Active
    }

    /// Whether the node has been removed from its parent's children.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// The node's own store; `None` for non-scope nodes.
    pub fn store(&self) -> Option<&VariableStore> {
        self.store.as_ref()
    }

    /// Rank in which this branch completed among its siblings (1-based).
    pub fn completion_seq(&self) -> Option<u64> {
        match self.completion_seq.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn parent(&self) -> Option<Arc<ExecutionNode>> {
        self.parent.upgrade()
    }

    /// Parent lookup that verifies the structural invariants on the way:
    /// only the root lacks a parent, and depth drops by exactly one per step.
    pub fn checked_parent(&self) -> ScopeResult<Option<Arc<ExecutionNode>>> {
        if self.is_root() {
            return Ok(None);
        }
        let parent = self.parent.upgrade().ok_or_else(|| {
            ScopeError::invariant(format!("parent of node {} no longer exists", self.id))
        })?;
        if parent.depth + 1 != self.depth {
            return Err(ScopeError::invariant(format!(
                "node {} at depth {} has parent {} at depth {}",
                self.id, self.depth, parent.id, parent.depth
            )));
        }
        Ok(Some(parent))
    }

    pub fn children(&self) -> Vec<Arc<ExecutionNode>> {
        self.children.read().clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn has_child(&self, id: &str) -> bool {
        self.children.read().iter().any(|c| c.id == id)
    }

    /// Ancestors from the parent up to the root.
    pub fn ancestors(&self) -> ScopeResult<Vec<Arc<ExecutionNode>>> {
        let mut ancestors = Vec::with_capacity(self.depth);
        let mut current = self.checked_parent()?;
        while let Some(node) = current {
            current = node.checked_parent()?;
            ancestors.push(node);
        }
        Ok(ancestors)
    }

    /// Other children of this node's parent.
    pub fn siblings(&self) -> Vec<Arc<ExecutionNode>> {
        match self.parent() {
            Some(parent) => parent
                .children()
                .into_iter()
                .filter(|c| c.id != self.id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// This node if it is a scope, otherwise the closest scope above it.
    pub fn nearest_scope(self: &Arc<Self>) -> ScopeResult<Arc<ExecutionNode>> {
        let mut current = Arc::clone(self);
        loop {
            if current.is_scope() {
                return Ok(current);
            }
            current = current.checked_parent()?.ok_or_else(|| {
                ScopeError::invariant(format!("no enclosing scope above node {}", self.id))
            })?;
        }
    }

    /// Fail unless reads through this node are meaningful. Ended branches
    /// awaiting join remain readable.
    pub fn ensure_readable(&self) -> ScopeResult<()> {
        match self.lifecycle_state() {
            LifecycleState::Cancelled => Err(ScopeError::invariant(format!(
                "read reached cancelled node {}",
                self.id
            ))),
            _ if self.is_detached() => Err(ScopeError::invariant(format!(
                "read reached detached node {}",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    pub fn ensure_writable(&self) -> ScopeResult<()> {
        match self.lifecycle_state() {
            LifecycleState::Active => Ok(()),
            state => Err(ScopeError::invariant(format!(
                "write reached {} node {}",
                state, self.id
            ))),
        }
    }

    /// Bindings this branch created or replaced since it was forked, sorted
    /// by name.
    pub fn written_since_fork(&self) -> ScopeResult<Vec<(String, TypedValue)>> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(Vec::new()),
        };
        let empty = HashMap::new();
        let baseline = self.fork_baseline.as_ref().unwrap_or(&empty);
        let mut written: Vec<(String, TypedValue)> = store
            .snapshot()?
            .into_iter()
            .filter(|(name, value)| match baseline.get(name) {
                Some(base) => base != value || base.version() != value.version(),
                None => true,
            })
            .collect();
        written.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(written)
    }

    pub(crate) fn lock_join(&self) -> MutexGuard<'_, ()> {
        self.join_lock.lock()
    }

    /// Normal completion.
    ///
    /// The subtree is destroyed. A branch keeps its (now frozen) store and
    /// stays attached until a join absorbs it; any other node is discarded
    /// and detached right away.
    pub fn end(&self) -> ScopeResult<()> {
        let parent = self.branch_parent();
        let _parent_guard = parent.as_ref().map(|p| p.lock_join());
        let _guard = self.lock_join();
        {
            let mut state = self.state.write();
            if *state != LifecycleState::Active {
                return Err(ScopeError::invariant(format!(
                    "cannot end {} node {}",
                    *state, self.id
                )));
            }
            *state = LifecycleState::Ended;
        }
        self.destroy_children();

        if self.is_branch() {
            if let Some(store) = &self.store {
                store.freeze();
            }
            let seq = match self.parent() {
                Some(parent) => parent.completion_counter.fetch_add(1, Ordering::AcqRel) + 1,
                None => 1,
            };
            self.completion_seq.store(seq, Ordering::Release);
            log::debug!("Branch {} completed (rank {})", self.id, seq);
        } else {
            self.discard_store();
            self.detach_from_parent();
            log::debug!("Node {} ended", self.id);
        }
        Ok(())
    }

    /// Discard the subtree and store immediately. Cancelling an ended branch
    /// that has not been joined yet withdraws it from the join.
    pub fn cancel(&self) -> ScopeResult<()> {
        let parent = self.branch_parent();
        let _parent_guard = parent.as_ref().map(|p| p.lock_join());
        let _guard = self.lock_join();
        {
            let mut state = self.state.write();
            if *state == LifecycleState::Cancelled {
                return Ok(());
            }
            if *state == LifecycleState::Ended && (!self.is_branch() || self.is_detached()) {
                return Err(ScopeError::invariant(format!(
                    "cannot cancel ended node {}",
                    self.id
                )));
            }
            *state = LifecycleState::Cancelled;
        }
        self.destroy_children();
        self.discard_store();
        self.detach_from_parent();
        log::debug!("Node {} cancelled", self.id);
        Ok(())
    }

    /// A branch's parent, whose join lock orders this branch's lifecycle
    /// changes against a running join.
    fn branch_parent(&self) -> Option<Arc<ExecutionNode>> {
        if self.is_branch() {
            self.parent.upgrade()
        } else {
            None
        }
    }

    /// Final step of a join: drop the branch's store and detach it.
    pub(crate) fn absorb(&self) {
        self.discard_store();
        self.detach_from_parent();
    }

    fn discard_store(&self) {
        if let Some(store) = &self.store {
            store.discard();
        }
    }

    fn detach_from_parent(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.children.write().retain(|c| c.id != self.id);
        }
        self.detached.store(true, Ordering::Release);
    }

    fn destroy_children(&self) {
        let children = std::mem::take(&mut *self.children.write());
        for child in children {
            child.destroy();
        }
    }

    /// Tear down a node whose parent is going away. The parent has already
    /// released it, so no detach from the parent's list is needed.
    fn destroy(&self) {
        let _guard = self.lock_join();
        {
            let mut state = self.state.write();
            if *state == LifecycleState::Active {
                *state = LifecycleState::Cancelled;
            }
        }
        self.destroy_children();
        self.discard_store();
        self.detached.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ExecutionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("depth", &self.depth)
            .field("state", &self.lifecycle_state())
            .field("children", &self.child_count())
            .finish()
    }
}
