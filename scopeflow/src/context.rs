//! Variable lookup and mutation bound to one execution node.
//!
//! Reads check the bound node's scope first and then delegate up the parent
//! chain until the root; running off the root is the only way a lookup ends
//! without a value, and that is a normal `Ok(None)`.
//!
//! Writes resolve a target scope according to the write policy fixed for the
//! node when it was created. Propagating writes never cross the nearest
//! enclosing fork branch: a name declared above that branch is shadowed in
//! the branch's own store and reaches the ancestor only through a join.

use crate::config::{UndeclaredWrite, WritePolicy};
use crate::error::{ScopeError, ScopeResult};
use crate::node::{ExecutionNode, NodeId};
use crate::store::VariableStore;
use crate::value::{RawValue, TypedValue};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The get/set contract consumed by the scheduler and by process-definition
/// evaluation.
pub trait Context: Send + Sync {
    /// Look a name up; absence is `Ok(None)`.
    fn get(&self, name: &str) -> ScopeResult<Option<TypedValue>>;

    /// Bind a name according to the context's write policy.
    fn set(&self, name: &str, value: TypedValue) -> ScopeResult<()>;
}

/// Where a write will land.
struct WriteTarget {
    scope: Arc<ExecutionNode>,
    /// Binding found while resolving, used for the retype check. It may live
    /// in an ancestor of `scope` when the write shadows across a fork.
    declared: Option<TypedValue>,
    shadows_ancestor: bool,
}

#[derive(Debug, Clone)]
pub struct ScopeContext {
    node: Arc<ExecutionNode>,
    policy: WritePolicy,
    undeclared: UndeclaredWrite,
}

impl ScopeContext {
    /// Bind a context to `node` using the node's write policy.
    pub fn new(node: Arc<ExecutionNode>) -> Self {
        let policy = node.write_policy();
        Self {
            node,
            policy,
            undeclared: UndeclaredWrite::default(),
        }
    }

    pub fn with_undeclared_write(mut self, undeclared: UndeclaredWrite) -> Self {
        self.undeclared = undeclared;
        self
    }

    pub fn node(&self) -> &Arc<ExecutionNode> {
        &self.node
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// Scopes on the lookup path, nearest first.
    fn scope_chain(&self) -> ScopeResult<Vec<Arc<ExecutionNode>>> {
        let mut chain = Vec::with_capacity(self.node.depth() + 1);
        let mut current = Some(Arc::clone(&self.node));
        while let Some(node) = current {
            current = node.checked_parent()?;
            if node.is_scope() {
                chain.push(node);
            }
        }
        Ok(chain)
    }

    fn store_of(scope: &ExecutionNode) -> ScopeResult<&VariableStore> {
        scope.store().ok_or_else(|| {
            ScopeError::invariant(format!("scope node {} has no store", scope.id()))
        })
    }

    pub fn get(&self, name: &str) -> ScopeResult<Option<TypedValue>> {
        self.node.ensure_readable()?;
        let mut current = Some(Arc::clone(&self.node));
        while let Some(node) = current {
            if let Some(store) = node.store() {
                if let Some(value) = store.read(name)? {
                    return Ok(Some(value));
                }
            }
            current = node.checked_parent()?;
        }
        Ok(None)
    }

    /// Typed read: the payload of `name`, checked against `type_id`.
    pub fn get_as(&self, name: &str, type_id: &str) -> ScopeResult<Option<RawValue>> {
        match self.get(name)? {
            Some(value) => Ok(Some(value.unwrap(type_id)?.clone())),
            None => Ok(None),
        }
    }

    /// Read the nearest scope only, without delegating to ancestors.
    pub fn get_local(&self, name: &str) -> ScopeResult<Option<TypedValue>> {
        self.node.ensure_readable()?;
        let scope = self.node.nearest_scope()?;
        Self::store_of(&scope)?.read(name)
    }

    pub fn contains(&self, name: &str) -> ScopeResult<bool> {
        Ok(self.get(name)?.is_some())
    }

    /// Id of the scope that currently binds `name` on this node's path.
    pub fn declaring_scope(&self, name: &str) -> ScopeResult<Option<NodeId>> {
        self.node.ensure_readable()?;
        for scope in self.scope_chain()? {
            if Self::store_of(&scope)?.contains(name)? {
                return Ok(Some(scope.id().to_string()));
            }
        }
        Ok(None)
    }

    /// Every name visible from this node, sorted and listed once.
    pub fn visible_names(&self) -> ScopeResult<Vec<String>> {
        self.node.ensure_readable()?;
        let mut names = BTreeSet::new();
        for scope in self.scope_chain()? {
            names.extend(Self::store_of(&scope)?.names()?);
        }
        Ok(names.into_iter().collect())
    }

    fn resolve_write_target(&self, name: &str) -> ScopeResult<WriteTarget> {
        let chain = self.scope_chain()?;
        let nearest = chain.first().cloned().ok_or_else(|| {
            ScopeError::invariant(format!("no enclosing scope above node {}", self.node.id()))
        })?;

        if self.policy == WritePolicy::Local {
            let declared = Self::store_of(&nearest)?.read(name)?;
            return Ok(WriteTarget {
                scope: nearest,
                declared,
                shadows_ancestor: false,
            });
        }

        let mut boundary: Option<Arc<ExecutionNode>> = None;
        for scope in &chain {
            if let Some(existing) = Self::store_of(scope)?.read(name)? {
                return Ok(match boundary {
                    Some(branch) => WriteTarget {
                        scope: branch,
                        declared: Some(existing),
                        shadows_ancestor: true,
                    },
                    None => WriteTarget {
                        scope: Arc::clone(scope),
                        declared: Some(existing),
                        shadows_ancestor: false,
                    },
                });
            }
            if scope.is_branch() && boundary.is_none() {
                boundary = Some(Arc::clone(scope));
            }
        }

        let scope = match self.undeclared {
            UndeclaredWrite::Local => nearest,
            UndeclaredWrite::Root => match boundary {
                Some(branch) => branch,
                None => chain.last().cloned().unwrap_or(nearest),
            },
        };
        Ok(WriteTarget {
            scope,
            declared: None,
            shadows_ancestor: false,
        })
    }

    pub fn set(&self, name: &str, value: TypedValue) -> ScopeResult<()> {
        self.node.ensure_writable()?;
        let target = self.resolve_write_target(name)?;
        target.scope.ensure_writable()?;

        if let Some(existing) = &target.declared {
            if existing.type_id() != value.type_id() {
                return Err(ScopeError::type_mismatch(
                    existing.type_id(),
                    value.type_id(),
                    format!("variable '{}'", name),
                ));
            }
        }
        if target.shadows_ancestor {
            log::debug!(
                "Shadowing '{}' in branch {} instead of writing past the fork",
                name,
                target.scope.id()
            );
        }
        Self::store_of(&target.scope)?.write_same_type(name, value)?;
        Ok(())
    }

    /// Remove `name` from the scope a write would target. Bindings that live
    /// above the nearest fork branch are never removed from inside it.
    pub fn remove(&self, name: &str) -> ScopeResult<Option<TypedValue>> {
        self.node.ensure_writable()?;
        let target = self.resolve_write_target(name)?;
        if target.shadows_ancestor || target.declared.is_none() {
            return Ok(None);
        }
        target.scope.ensure_writable()?;
        Self::store_of(&target.scope)?.remove(name)
    }
}

impl Context for ScopeContext {
    fn get(&self, name: &str) -> ScopeResult<Option<TypedValue>> {
        ScopeContext::get(self, name)
    }

    fn set(&self, name: &str, value: TypedValue) -> ScopeResult<()> {
        ScopeContext::set(self, name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ChildSpec, NodeKind};
    use pretty_assertions::assert_eq;

    fn child(
        parent: &Arc<ExecutionNode>,
        kind: NodeKind,
        policy: WritePolicy,
    ) -> Arc<ExecutionNode> {
        parent
            .spawn_children(vec![ChildSpec::new(kind, None, policy)])
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_get_walks_through_activities() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Propagate);
        ScopeContext::new(Arc::clone(&root))
            .set("x", TypedValue::integer(1))
            .unwrap();
        let step = child(&root, NodeKind::Activity, WritePolicy::Propagate);
        let ctx = ScopeContext::new(step);
        assert_eq!(ctx.get("x").unwrap(), Some(TypedValue::integer(1)));
        assert_eq!(ctx.get("missing").unwrap(), None);
    }

    #[test]
    fn test_local_write_from_activity_lands_in_nearest_scope() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Local);
        let scope = child(&root, NodeKind::Scope, WritePolicy::Local);
        let step = child(&scope, NodeKind::Activity, WritePolicy::Local);
        ScopeContext::new(step)
            .set("y", TypedValue::text("v"))
            .unwrap();
        assert!(scope.store().unwrap().contains("y").unwrap());
        assert!(!root.store().unwrap().contains("y").unwrap());
    }

    #[test]
    fn test_undeclared_root_target() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Propagate);
        let scope = child(&root, NodeKind::Scope, WritePolicy::Propagate);
        let ctx = ScopeContext::new(Arc::clone(&scope)).with_undeclared_write(UndeclaredWrite::Root);
        ctx.set("z", TypedValue::integer(9)).unwrap();
        assert!(root.store().unwrap().contains("z").unwrap());
        assert_eq!(ctx.declaring_scope("z").unwrap(), Some("r".to_string()));
    }

    #[test]
    fn test_undeclared_root_target_stops_at_branch() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Propagate);
        let branch = child(&root, NodeKind::Branch, WritePolicy::Propagate);
        let inner = child(&branch, NodeKind::Scope, WritePolicy::Propagate);
        ScopeContext::new(inner)
            .with_undeclared_write(UndeclaredWrite::Root)
            .set("z", TypedValue::integer(9))
            .unwrap();
        assert!(branch.store().unwrap().contains("z").unwrap());
        assert!(!root.store().unwrap().contains("z").unwrap());
    }

    #[test]
    fn test_visible_names_deduplicated() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Local);
        let scope = child(&root, NodeKind::Scope, WritePolicy::Local);
        ScopeContext::new(Arc::clone(&root))
            .set("a", TypedValue::integer(1))
            .unwrap();
        let ctx = ScopeContext::new(scope);
        ctx.set("a", TypedValue::integer(2)).unwrap();
        ctx.set("b", TypedValue::integer(3)).unwrap();
        assert_eq!(ctx.visible_names().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_get_as() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Propagate);
        let ctx = ScopeContext::new(root);
        ctx.set("n", TypedValue::integer(4)).unwrap();
        assert_eq!(ctx.get_as("n", "integer").unwrap(), Some(RawValue::Integer(4)));
        assert!(matches!(
            ctx.get_as("n", "text"),
            Err(ScopeError::TypeMismatch { .. })
        ));
        assert_eq!(ctx.get_as("nope", "text").unwrap(), None);
    }

    #[test]
    fn test_context_as_trait_object() {
        let root = ExecutionNode::new_root("r".into(), None, WritePolicy::Propagate);
        let ctx: Box<dyn Context> = Box::new(ScopeContext::new(root));
        ctx.set("k", TypedValue::boolean(true)).unwrap();
        assert_eq!(ctx.get("k").unwrap(), Some(TypedValue::boolean(true)));
    }
}
