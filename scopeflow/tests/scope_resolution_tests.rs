use pretty_assertions::assert_eq;
use scopeflow::{
    EngineConfig, ExecutionNode, ExecutionTree, ScopeError, TypedValue, WritePolicy,
};
use std::sync::Arc;

/// Root A with nested scopes B and C; C gets `c_policy`.
fn nested(c_policy: WritePolicy) -> (ExecutionTree, Arc<ExecutionNode>, Arc<ExecutionNode>) {
    let tree = ExecutionTree::new(EngineConfig::default());
    let b = tree.enter_scope(tree.root(), Some("B")).unwrap();
    let c = tree.enter_scope_with_policy(&b, Some("C"), c_policy).unwrap();
    (tree, b, c)
}

#[test]
fn test_delegation_to_root() {
    let (tree, _b, c) = nested(WritePolicy::Propagate);
    tree.root_context().set("x", TypedValue::integer(1)).unwrap();

    assert_eq!(
        tree.context(&c).get("x").unwrap(),
        Some(TypedValue::integer(1))
    );
}

#[test]
fn test_unset_variable_is_not_found() {
    let (tree, _b, c) = nested(WritePolicy::Propagate);
    assert_eq!(tree.context(&c).get("x").unwrap(), None);
    assert!(!tree.context(&c).contains("x").unwrap());
}

#[test]
fn test_local_write_shadows_without_leaking_upward() {
    let (tree, b, c) = nested(WritePolicy::Local);
    tree.root_context().set("x", TypedValue::integer(1)).unwrap();

    let c_ctx = tree.context(&c);
    c_ctx.set("x", TypedValue::integer(2)).unwrap();

    assert_eq!(c_ctx.get("x").unwrap(), Some(TypedValue::integer(2)));
    assert_eq!(
        tree.context(&b).get("x").unwrap(),
        Some(TypedValue::integer(1))
    );
    assert_eq!(
        tree.root_context().get("x").unwrap(),
        Some(TypedValue::integer(1))
    );
    assert_eq!(c_ctx.declaring_scope("x").unwrap(), Some(c.id().to_string()));
}

#[test]
fn test_local_write_may_shadow_with_another_type() {
    let (tree, _b, c) = nested(WritePolicy::Local);
    tree.root_context().set("x", TypedValue::integer(1)).unwrap();
    let c_ctx = tree.context(&c);
    c_ctx.set("x", TypedValue::text("two")).unwrap();
    assert_eq!(c_ctx.get("x").unwrap(), Some(TypedValue::text("two")));

    // Once declared locally, the local binding keeps its type.
    assert!(matches!(
        c_ctx.set("x", TypedValue::integer(3)),
        Err(ScopeError::TypeMismatch { .. })
    ));
}

#[test]
fn test_propagate_write_mutates_declaring_ancestor() {
    let (tree, b, c) = nested(WritePolicy::Propagate);
    tree.root_context().set("x", TypedValue::integer(1)).unwrap();

    tree.context(&c).set("x", TypedValue::integer(2)).unwrap();

    assert_eq!(
        tree.context(&b).get("x").unwrap(),
        Some(TypedValue::integer(2))
    );
    assert!(c.store().unwrap().is_empty());
    let stored = tree.root().store().unwrap().read("x").unwrap().unwrap();
    assert_eq!(stored.version(), 1);
}

#[test]
fn test_propagate_write_of_undeclared_name_is_local() {
    let (tree, b, c) = nested(WritePolicy::Propagate);
    tree.context(&c).set("fresh", TypedValue::boolean(true)).unwrap();

    assert!(c.store().unwrap().contains("fresh").unwrap());
    assert_eq!(tree.context(&b).get("fresh").unwrap(), None);
}

#[test]
fn test_propagate_write_rejects_retype_until_removed() {
    let (tree, _b, c) = nested(WritePolicy::Propagate);
    tree.root_context().set("x", TypedValue::integer(1)).unwrap();
    let c_ctx = tree.context(&c);

    let err = c_ctx.set("x", TypedValue::text("one")).unwrap_err();
    assert_eq!(
        err,
        ScopeError::type_mismatch("integer", "text", "variable 'x'")
    );
    assert_eq!(c_ctx.get("x").unwrap(), Some(TypedValue::integer(1)));

    let removed = c_ctx.remove("x").unwrap();
    assert_eq!(removed, Some(TypedValue::integer(1)));
    assert_eq!(tree.root_context().get("x").unwrap(), None);

    c_ctx.set("x", TypedValue::text("one")).unwrap();
    assert_eq!(c_ctx.get("x").unwrap(), Some(TypedValue::text("one")));
}

#[test]
fn test_remove_missing_is_none() {
    let (tree, _b, c) = nested(WritePolicy::Propagate);
    assert_eq!(tree.context(&c).remove("ghost").unwrap(), None);
}

#[test]
fn test_activity_reads_and_writes_through_scope() {
    let tree = ExecutionTree::new(EngineConfig::default());
    let sub = tree.enter_scope(tree.root(), None).unwrap();
    let step = tree.start_activity(&sub, Some("task")).unwrap();

    let ctx = tree.context(&step);
    ctx.set("out", TypedValue::text("done")).unwrap();
    assert!(sub.store().unwrap().contains("out").unwrap());
    assert_eq!(ctx.get_local("out").unwrap(), Some(TypedValue::text("done")));
}

#[test]
fn test_write_to_ended_node_is_invariant_violation() {
    let (tree, b, c) = nested(WritePolicy::Propagate);
    let c_ctx = tree.context(&c);
    tree.end(&b).unwrap();

    let err = c_ctx.set("x", TypedValue::integer(1)).unwrap_err();
    assert!(matches!(err, ScopeError::InvariantViolation(_)));
    assert!(!err.is_recoverable());

    let err = tree.context(&b).set("x", TypedValue::integer(1)).unwrap_err();
    assert!(matches!(err, ScopeError::InvariantViolation(_)));
}

#[test]
fn test_instance_wide_local_policy() {
    let tree = ExecutionTree::new(EngineConfig::default().with_write_policy(WritePolicy::Local));
    tree.root_context().set("x", TypedValue::integer(1)).unwrap();
    let sub = tree.enter_scope(tree.root(), None).unwrap();
    tree.context(&sub).set("x", TypedValue::integer(5)).unwrap();

    assert_eq!(
        tree.root_context().get("x").unwrap(),
        Some(TypedValue::integer(1))
    );
    assert_eq!(
        tree.context(&sub).get("x").unwrap(),
        Some(TypedValue::integer(5))
    );
}
