// Error handling for the scope engine

use thiserror::Error;

pub type ScopeResult<T> = Result<T, ScopeError>;

/// A single name that more than one branch wrote with differing values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingWrite {
    pub name: String,
    /// Ids of the branches that wrote the name, in completion order.
    pub branches: Vec<String>,
}

/// Errors raised by the scope engine.
///
/// Value-layer errors (`UnsupportedType`, `TypeMismatch`, `CorruptValue`) are
/// always reported to the immediate caller. Structural misuse (`InvalidFork`,
/// `IncompleteJoin`, `UnknownBranch`) fails the requested operation only.
/// `InvariantViolation` means the tree itself is inconsistent and the
/// enclosing operation must be aborted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScopeError {
    #[error("Unsupported value type: {0}")]
    UnsupportedType(String),

    #[error("Type mismatch for {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: String,
        actual: String,
        context: String,
    },

    #[error("Corrupt value: {0}")]
    CorruptValue(String),

    #[error("Invalid fork: {0}")]
    InvalidFork(String),

    #[error("Incomplete join on {parent}: branches still active: {}", .active.join(", "))]
    IncompleteJoin { parent: String, active: Vec<String> },

    #[error("Node {branch} is not a branch of {parent}")]
    UnknownBranch { parent: String, branch: String },

    #[error("Merge conflict on {}", format_conflicts(.0))]
    MergeConflict(Vec<ConflictingWrite>),

    #[error("Tree invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

fn format_conflicts(conflicts: &[ConflictingWrite]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} (written by {})", c.name, c.branches.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ScopeError {
    pub fn type_mismatch(
        expected: impl Into<String>,
        actual: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        ScopeError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
            context: context.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        ScopeError::InvariantViolation(message.into())
    }

    /// Whether the caller can correct the condition and retry.
    ///
    /// Invariant violations are never recoverable; everything else is either
    /// a caller mistake or an expected runtime condition.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ScopeError::InvariantViolation(_))
    }

    /// Names involved in a merge conflict, empty for any other error.
    pub fn conflicting_names(&self) -> Vec<&str> {
        match self {
            ScopeError::MergeConflict(conflicts) => {
                conflicts.iter().map(|c| c.name.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<serde_json::Error> for ScopeError {
    fn from(e: serde_json::Error) -> Self {
        ScopeError::CorruptValue(e.to_string())
    }
}

impl From<toml::de::Error> for ScopeError {
    fn from(e: toml::de::Error) -> Self {
        ScopeError::Config(e.to_string())
    }
}

impl From<std::io::Error> for ScopeError {
    fn from(e: std::io::Error) -> Self {
        ScopeError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_conflict_display_lists_names_and_branches() {
        let err = ScopeError::MergeConflict(vec![ConflictingWrite {
            name: "y".to_string(),
            branches: vec!["b1".to_string(), "b2".to_string()],
        }]);
        assert_eq!(err.to_string(), "Merge conflict on y (written by b1, b2)");
        assert_eq!(err.conflicting_names(), vec!["y"]);
    }

    #[test]
    fn test_recoverability() {
        assert!(ScopeError::type_mismatch("integer", "text", "x").is_recoverable());
        assert!(ScopeError::MergeConflict(vec![]).is_recoverable());
        assert!(!ScopeError::invariant("cycle").is_recoverable());
    }

    #[test]
    fn test_incomplete_join_display() {
        let err = ScopeError::IncompleteJoin {
            parent: "p".to_string(),
            active: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Incomplete join on p: branches still active: a, b"
        );
    }
}
