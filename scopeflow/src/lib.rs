//! Scoped variable resolution for hierarchical process executions.
//!
//! A running process instance is a tree of [`ExecutionNode`]s. Scope nodes own
//! a [`VariableStore`]; a [`ScopeContext`] bound to a node resolves reads by
//! delegating up the parent chain and resolves writes according to the
//! node's [`WritePolicy`]. Parallel branches are created with a fork and
//! merged back with a join, which applies a [`JoinPolicy`] to names written by
//! more than one branch.
//!
//! ```
//! use scopeflow::{EngineConfig, ExecutionTree, TypedValue};
//!
//! # fn main() -> scopeflow::ScopeResult<()> {
//! let tree = ExecutionTree::new(EngineConfig::default());
//! tree.root_context().set("y", TypedValue::integer(0))?;
//!
//! let branches = tree.fork(tree.root(), 2)?;
//! tree.context(&branches[0]).set("y", TypedValue::integer(1))?;
//! tree.context(&branches[1]).set("y", TypedValue::integer(2))?;
//! branches[0].end()?;
//! branches[1].end()?;
//!
//! let outcome = tree.join(tree.root(), &branches)?;
//! assert_eq!(outcome.winner("y"), Some(branches[1].id()));
//! assert_eq!(tree.root_context().get("y")?, Some(TypedValue::integer(2)));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fork;
pub mod join;
pub mod node;
pub mod persistence;
pub mod store;
pub mod tree;
pub mod value;

pub use config::{EngineConfig, JoinPolicy, UndeclaredWrite, WritePolicy};
pub use context::{Context, ScopeContext};
pub use error::{ConflictingWrite, ScopeError, ScopeResult};
pub use fork::ForkCoordinator;
pub use join::{JoinOutcome, JoinResolver};
pub use node::{ExecutionNode, LifecycleState, NodeId, NodeKind};
pub use persistence::{InMemoryPersistence, NodeSnapshot, PersistenceBackend, TreeSnapshot};
pub use store::VariableStore;
pub use tree::ExecutionTree;
pub use value::{
    BuiltinType, ConstrainedType, RawValue, TypeRegistry, TypedValue, ValueEnvelope, ValueShape,
    ValueType,
};
