//! Merging completed branches back into their parent scope.

use crate::config::JoinPolicy;
use crate::error::{ConflictingWrite, ScopeError, ScopeResult};
use crate::node::{ExecutionNode, LifecycleState, NodeId};
use crate::value::TypedValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub parent: NodeId,
    /// Scope whose store received the merged names.
    pub target_scope: NodeId,
    /// Merged name and the branch whose value was applied.
    pub applied: BTreeMap<String, NodeId>,
    /// Joined branches in completion order.
    pub absorbed: Vec<NodeId>,
    /// Cancelled branches left out of the merge.
    pub excluded: Vec<NodeId>,
}

impl JoinOutcome {
    pub fn winner(&self, name: &str) -> Option<&str> {
        self.applied.get(name).map(String::as_str)
    }
}

/// Writes of one name, in branch completion order.
type WriteSet = Vec<(NodeId, TypedValue)>;

#[derive(Debug, Clone, Default)]
pub struct JoinResolver {
    default_policy: JoinPolicy,
}

impl JoinResolver {
    pub fn new(default_policy: JoinPolicy) -> Self {
        Self { default_policy }
    }

    pub fn default_policy(&self) -> JoinPolicy {
        self.default_policy
    }

    pub fn join_default(
        &self,
        parent: &Arc<ExecutionNode>,
        branches: &[Arc<ExecutionNode>],
    ) -> ScopeResult<JoinOutcome> {
        self.join(parent, branches, self.default_policy)
    }

    /// Merge the writes of `branches` into `parent`'s scope.
    ///
    /// Either every selected value is applied and every completed branch is
    /// absorbed, or nothing changes. Joins on one parent are serialized so
    /// tie-breaks stay deterministic.
    pub fn join(
        &self,
        parent: &Arc<ExecutionNode>,
        branches: &[Arc<ExecutionNode>],
        policy: JoinPolicy,
    ) -> ScopeResult<JoinOutcome> {
        let _guard = parent.lock_join();
        if parent.lifecycle_state() == LifecycleState::Cancelled {
            return Err(ScopeError::invariant(format!(
                "join reached cancelled node {}",
                parent.id()
            )));
        }

        let mut seen = HashSet::new();
        let mut completed = Vec::new();
        let mut excluded = Vec::new();
        let mut active = Vec::new();
        for branch in branches {
            if !seen.insert(branch.id().to_string()) {
                continue;
            }
            let forked_here = branch.is_branch()
                && branch
                    .parent()
                    .map(|p| Arc::ptr_eq(&p, parent))
                    .unwrap_or(false);
            // Cancelled branches are already detached; the parent link is all
            // that is left to check.
            let state = branch.lifecycle_state();
            let is_child = forked_here
                && (state == LifecycleState::Cancelled || parent.has_child(branch.id()));
            if !is_child {
                return Err(ScopeError::UnknownBranch {
                    parent: parent.id().to_string(),
                    branch: branch.id().to_string(),
                });
            }
            match state {
                LifecycleState::Cancelled => excluded.push(branch.id().to_string()),
                LifecycleState::Active => active.push(branch.id().to_string()),
                LifecycleState::Ended => completed.push(Arc::clone(branch)),
            }
        }
        if !active.is_empty() {
            return Err(ScopeError::IncompleteJoin {
                parent: parent.id().to_string(),
                active,
            });
        }
        completed.sort_by_key(|b| b.completion_seq().unwrap_or(u64::MAX));

        let mut writes: BTreeMap<String, WriteSet> = BTreeMap::new();
        for branch in &completed {
            for (name, value) in branch.written_since_fork()? {
                writes
                    .entry(name)
                    .or_default()
                    .push((branch.id().to_string(), value));
            }
        }

        let selected = Self::select(writes, policy)?;

        let target = parent.nearest_scope()?;
        target.ensure_writable()?;
        let store = target.store().ok_or_else(|| {
            ScopeError::invariant(format!("scope node {} has no store", target.id()))
        })?;
        let mut applied = BTreeMap::new();
        let mut entries = Vec::with_capacity(selected.len());
        for (name, (winner, value)) in selected {
            applied.insert(name.clone(), winner);
            entries.push((name, value));
        }
        // A join never retypes a binding the target already holds.
        store.write_all_same_type(entries)?;

        let absorbed: Vec<NodeId> = completed.iter().map(|b| b.id().to_string()).collect();
        for branch in &completed {
            branch.absorb();
        }

        log::debug!(
            "Joined {} branches into {} ({:?}): {} names applied, {} cancelled excluded",
            absorbed.len(),
            target.id(),
            policy,
            applied.len(),
            excluded.len()
        );

        Ok(JoinOutcome {
            parent: parent.id().to_string(),
            target_scope: target.id().to_string(),
            applied,
            absorbed,
            excluded,
        })
    }

    fn select(
        writes: BTreeMap<String, WriteSet>,
        policy: JoinPolicy,
    ) -> ScopeResult<BTreeMap<String, (NodeId, TypedValue)>> {
        let mut selected = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (name, mut set) in writes {
            let pick = match policy {
                JoinPolicy::LastWriter => set.pop(),
                JoinPolicy::FirstWriter => set.into_iter().next(),
                JoinPolicy::ConflictDetect => {
                    let first_value = set[0].1.clone();
                    if set.iter().any(|(_, v)| *v != first_value) {
                        conflicts.push(ConflictingWrite {
                            name,
                            branches: set.into_iter().map(|(id, _)| id).collect(),
                        });
                        continue;
                    }
                    set.into_iter().next()
                }
            };
            if let Some(pick) = pick {
                selected.insert(name, pick);
            }
        }
        if !conflicts.is_empty() {
            log::warn!(
                "Join rejected: {} conflicting names",
                conflicts.len()
            );
            return Err(ScopeError::MergeConflict(conflicts));
        }
        Ok(selected)
    }
}
