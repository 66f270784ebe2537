//! Engine configuration.
//!
//! Policies here are fixed per process instance: every scope created in an
//! [`ExecutionTree`](crate::tree::ExecutionTree) takes its write policy from
//! the config the tree was built with.

use crate::error::{ScopeError, ScopeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// How `set` picks the store that receives a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Write into the declaring scope found on the ancestor chain.
    Propagate,
    /// Always write into the local scope, shadowing ancestors.
    Local,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::Propagate
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WritePolicy::Propagate => write!(f, "propagate"),
            WritePolicy::Local => write!(f, "local"),
        }
    }
}

/// Tie-break applied when several joined branches wrote the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// The branch that completed last wins.
    LastWriter,
    /// The branch that completed first wins.
    FirstWriter,
    /// Differing writes reject the whole merge.
    ConflictDetect,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self::LastWriter
    }
}

/// Target of a propagate-write when no ancestor declares the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndeclaredWrite {
    /// Create the binding in the local scope.
    Local,
    /// Create the binding in the outermost scope reachable without crossing
    /// a fork boundary.
    Root,
}

impl Default for UndeclaredWrite {
    fn default() -> Self {
        Self::Local
    }
}

/// Configuration for one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub write_policy: WritePolicy,
    pub join_policy: JoinPolicy,
    pub undeclared_write: UndeclaredWrite,
    /// Maximum depth of the execution tree (root is depth 0).
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::Propagate,
            join_policy: JoinPolicy::LastWriter,
            undeclared_write: UndeclaredWrite::Local,
            max_depth: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn with_undeclared_write(mut self, target: UndeclaredWrite) -> Self {
        self.undeclared_write = target;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parse a config from TOML. Missing keys fall back to defaults.
    pub fn from_toml_str(source: &str) -> ScopeResult<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ScopeResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            ScopeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&source)?;
        log::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> ScopeResult<()> {
        if self.max_depth == 0 {
            return Err(ScopeError::Config(
                "max_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.write_policy, WritePolicy::Propagate);
        assert_eq!(config.join_policy, JoinPolicy::LastWriter);
        assert_eq!(config.undeclared_write, UndeclaredWrite::Local);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            write_policy = "local"
            join_policy = "conflict_detect"
            "#,
        )
        .unwrap();
        assert_eq!(
            config,
            EngineConfig::default()
                .with_write_policy(WritePolicy::Local)
                .with_join_policy(JoinPolicy::ConflictDetect)
        );
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        let err = EngineConfig::from_toml_str(r#"write_policy = "sideways""#).unwrap_err();
        assert!(matches!(err, ScopeError::Config(_)));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = EngineConfig::from_toml_str("max_depth = 0").unwrap_err();
        assert!(matches!(err, ScopeError::Config(_)));
    }
}
