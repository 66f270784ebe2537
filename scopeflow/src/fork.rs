//! Creation of concurrent sibling branches.

use crate::config::{EngineConfig, WritePolicy};
use crate::error::{ScopeError, ScopeResult};
use crate::node::{ChildSpec, ExecutionNode, LifecycleState, NodeKind};
use std::sync::Arc;

/// Splits an active node into independent branches.
///
/// Every branch is a scope with an empty store. Branch reads delegate to the
/// shared ancestors; branch writes stay in the branch until it is joined.
#[derive(Debug, Clone)]
pub struct ForkCoordinator {
    write_policy: WritePolicy,
    max_depth: usize,
}

impl ForkCoordinator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            write_policy: config.write_policy,
            max_depth: config.max_depth,
        }
    }

    pub fn fork(
        &self,
        parent: &Arc<ExecutionNode>,
        branch_count: usize,
    ) -> ScopeResult<Vec<Arc<ExecutionNode>>> {
        self.spawn(parent, vec![None; branch_count])
    }

    /// Fork one branch per name, in order.
    pub fn fork_named<I, S>(
        &self,
        parent: &Arc<ExecutionNode>,
        names: I,
    ) -> ScopeResult<Vec<Arc<ExecutionNode>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spawn(parent, names.into_iter().map(|n| Some(n.into())).collect())
    }

    fn spawn(
        &self,
        parent: &Arc<ExecutionNode>,
        names: Vec<Option<String>>,
    ) -> ScopeResult<Vec<Arc<ExecutionNode>>> {
        if names.is_empty() {
            return Err(ScopeError::InvalidFork(format!(
                "branch count must be at least 1 (parent {})",
                parent.id()
            )));
        }
        if parent.depth() + 1 > self.max_depth {
            return Err(ScopeError::InvalidFork(format!(
                "branches of {} would exceed the maximum depth of {}",
                parent.id(),
                self.max_depth
            )));
        }

        let specs = names
            .into_iter()
            .map(|name| ChildSpec::new(NodeKind::Branch, name, self.write_policy))
            .collect();
        let branches = parent.spawn_children(specs).map_err(|state| {
            ScopeError::InvalidFork(format!(
                "parent {} is {}, expected {}",
                parent.id(),
                state,
                LifecycleState::Active
            ))
        })?;

        log::debug!(
            "Forked {} into {} branches: [{}]",
            parent.id(),
            branches.len(),
            branches
                .iter()
                .map(|b| b.id())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(branches)
    }
}
