//! Process instance: the execution tree plus its configuration.

use crate::config::{EngineConfig, JoinPolicy, WritePolicy};
use crate::context::ScopeContext;
use crate::error::{ScopeError, ScopeResult};
use crate::fork::ForkCoordinator;
use crate::join::{JoinOutcome, JoinResolver};
use crate::node::{new_node_id, ChildSpec, ExecutionNode, NodeId, NodeKind};
use crate::value::{RawValue, TypeRegistry, TypedValue};
use std::sync::Arc;

/// Entry point the scheduler uses for one running process instance.
///
/// The tree owns the root node; everything else is reachable from it. Handles
/// to inner nodes returned here stay valid to query after the node ends, but
/// reads and writes through them fail once the node is discarded.
#[derive(Debug)]
pub struct ExecutionTree {
    root: Arc<ExecutionNode>,
    config: EngineConfig,
    registry: Arc<TypeRegistry>,
    forks: ForkCoordinator,
    joins: JoinResolver,
}

impl ExecutionTree {
    /// A new process instance using the built-in value types.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, TypeRegistry::with_builtins())
    }

    pub fn with_registry(config: EngineConfig, registry: TypeRegistry) -> Self {
        Self::with_root_id(new_node_id(), config, registry)
    }

    pub fn with_root_id(root_id: NodeId, config: EngineConfig, registry: TypeRegistry) -> Self {
        let root = ExecutionNode::new_root(root_id, None, config.write_policy);
        Self::from_root(root, config, registry)
    }

    /// Wrap an already built root. Its write policy may differ from
    /// `config.write_policy` when it comes from a snapshot.
    pub(crate) fn from_root(
        root: Arc<ExecutionNode>,
        config: EngineConfig,
        registry: TypeRegistry,
    ) -> Self {
        log::debug!(
            "Started process instance {} (write policy {}, join policy {:?})",
            root.id(),
            root.write_policy(),
            config.join_policy
        );
        Self {
            forks: ForkCoordinator::new(&config),
            joins: JoinResolver::new(config.join_policy),
            root,
            config,
            registry: Arc::new(registry),
        }
    }

    pub fn root(&self) -> &Arc<ExecutionNode> {
        &self.root
    }

    pub fn root_id(&self) -> &str {
        self.root.id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Context bound to `node`, honoring this instance's undeclared-write knob.
    pub fn context(&self, node: &Arc<ExecutionNode>) -> ScopeContext {
        ScopeContext::new(Arc::clone(node)).with_undeclared_write(self.config.undeclared_write)
    }

    pub fn root_context(&self) -> ScopeContext {
        self.context(&self.root)
    }

    /// Wrap a raw value with this instance's type registry.
    pub fn wrap(&self, type_id: &str, raw: impl Into<RawValue>) -> ScopeResult<TypedValue> {
        self.registry.wrap(type_id, raw)
    }

    /// Enter a sub-scope (sub-process, loop iteration) using the instance's
    /// write policy.
    pub fn enter_scope(
        &self,
        parent: &Arc<ExecutionNode>,
        name: Option<&str>,
    ) -> ScopeResult<Arc<ExecutionNode>> {
        self.enter_scope_with_policy(parent, name, self.config.write_policy)
    }

    /// Enter a sub-scope whose write policy differs from the instance default.
    pub fn enter_scope_with_policy(
        &self,
        parent: &Arc<ExecutionNode>,
        name: Option<&str>,
        policy: WritePolicy,
    ) -> ScopeResult<Arc<ExecutionNode>> {
        self.spawn(parent, NodeKind::Scope, name, policy)
    }

    /// Start a non-scope step. It writes through to its nearest scope and
    /// shares that scope's write policy.
    pub fn start_activity(
        &self,
        parent: &Arc<ExecutionNode>,
        name: Option<&str>,
    ) -> ScopeResult<Arc<ExecutionNode>> {
        let policy = parent.nearest_scope()?.write_policy();
        self.spawn(parent, NodeKind::Activity, name, policy)
    }

    fn spawn(
        &self,
        parent: &Arc<ExecutionNode>,
        kind: NodeKind,
        name: Option<&str>,
        policy: WritePolicy,
    ) -> ScopeResult<Arc<ExecutionNode>> {
        if parent.depth() + 1 > self.config.max_depth {
            return Err(ScopeError::invariant(format!(
                "node under {} would exceed the maximum depth of {}",
                parent.id(),
                self.config.max_depth
            )));
        }
        let spec = ChildSpec::new(kind, name.map(str::to_string), policy);
        let mut created = parent.spawn_children(vec![spec]).map_err(|state| {
            ScopeError::invariant(format!(
                "cannot create {:?} under {} node {}",
                kind,
                state,
                parent.id()
            ))
        })?;
        created
            .pop()
            .ok_or_else(|| ScopeError::invariant("child creation returned nothing"))
    }

    pub fn fork(
        &self,
        parent: &Arc<ExecutionNode>,
        branch_count: usize,
    ) -> ScopeResult<Vec<Arc<ExecutionNode>>> {
        self.forks.fork(parent, branch_count)
    }

    pub fn fork_named<I, S>(
        &self,
        parent: &Arc<ExecutionNode>,
        names: I,
    ) -> ScopeResult<Vec<Arc<ExecutionNode>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forks.fork_named(parent, names)
    }

    /// Join with the instance's configured policy.
    pub fn join(
        &self,
        parent: &Arc<ExecutionNode>,
        branches: &[Arc<ExecutionNode>],
    ) -> ScopeResult<JoinOutcome> {
        self.joins.join_default(parent, branches)
    }

    pub fn join_with(
        &self,
        parent: &Arc<ExecutionNode>,
        branches: &[Arc<ExecutionNode>],
        policy: JoinPolicy,
    ) -> ScopeResult<JoinOutcome> {
        self.joins.join(parent, branches, policy)
    }

    pub fn end(&self, node: &Arc<ExecutionNode>) -> ScopeResult<()> {
        node.end()
    }

    pub fn cancel(&self, node: &Arc<ExecutionNode>) -> ScopeResult<()> {
        node.cancel()
    }

    /// Locate an attached node by id.
    pub fn find(&self, id: &str) -> Option<Arc<ExecutionNode>> {
        let mut pending = vec![Arc::clone(&self.root)];
        while let Some(node) = pending.pop() {
            if node.id() == id {
                return Some(node);
            }
            pending.extend(node.children());
        }
        None
    }

    /// Number of attached nodes, root included.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![Arc::clone(&self.root)];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.children());
        }
        count
    }
}
