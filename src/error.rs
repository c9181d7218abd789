//! Error types for the sequencing core.
//!
//! Every concern gets its own strongly typed enum (compilation, registry,
//! content store, sequencer execution, lifecycle). `SequencingError` wraps
//! them so callers can match on the precise failure or just propagate it.

use thiserror::Error;

/// Errors raised while compiling a path expression.
///
/// These are only ever produced by [`crate::path::PathExpression::compile`];
/// matching a compiled expression never fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathExpressionError {
    #[error("Invalid path expression '{expression}': {reason}")]
    InvalidPathExpression {
        expression: String,
        reason: String,
    },
}

impl PathExpressionError {
    pub(crate) fn invalid(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPathExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while adding or replacing a registry entry.
///
/// A failure is isolated to the one configuration being applied.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid sequencer configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("No sequencer implementation named '{implementation}' is known")]
    UnknownImplementation {
        implementation: String,
    },

    #[error("Failed to instantiate sequencer '{sequencer}': {message}")]
    Instantiation {
        sequencer: String,
        message: String,
    },

    #[error("Sequencer '{sequencer}' did not retain its configuration")]
    ConfigurationNotRetained {
        sequencer: String,
    },

    #[error("Sequencer '{sequencer}' has an invalid path expression: {source}")]
    InvalidPathExpression {
        sequencer: String,
        #[source]
        source: PathExpressionError,
    },
}

/// Errors reported by a content store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Node not found: {workspace}:{path}")]
    NodeNotFound {
        workspace: String,
        path: String,
    },

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Session for workspace '{0}' has been logged out")]
    SessionClosed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Content store backend error: {0}")]
    Backend(String),
}

/// Errors raised by a sequencer while executing against a node.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("Sequencer '{sequencer}' failed: {message}")]
    Execution {
        sequencer: String,
        message: String,
    },

    #[error("Sequencing was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SequencerError {
    /// Creates an execution error for the named sequencer.
    #[must_use]
    pub fn execution(sequencer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            sequencer: sequencer.into(),
            message: message.into(),
        }
    }
}

/// Misuse of the sequencing system's lifecycle or configuration API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("The sequencing system cannot be started without a content store")]
    MissingContentStore,

    #[error("Unable to change {what} while the sequencing system is running")]
    Started {
        what: &'static str,
    },

    #[error("The sequencing system has been shut down and cannot be used")]
    Shutdown,

    #[error("Failed to start the sequencing worker pool: {reason}")]
    PoolUnavailable {
        reason: String,
    },
}

/// Top-level error type for the sequencing core.
#[derive(Debug, Error)]
pub enum SequencingError {
    #[error("Path expression error: {0}")]
    PathExpression(#[from] PathExpressionError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Content store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

impl SequencingError {
    /// Returns true if this is a path expression compilation error.
    #[must_use]
    pub const fn is_path_expression(&self) -> bool {
        matches!(self, Self::PathExpression(_))
    }

    /// Returns true if this is a registry error.
    #[must_use]
    pub const fn is_registry(&self) -> bool {
        matches!(self, Self::Registry(_))
    }

    /// Returns true if this is a content store error.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if this is a lifecycle misuse error.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }

    /// Returns true if retrying the same call could succeed.
    ///
    /// Only backend store failures are transient; everything else is a
    /// programming or configuration problem.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) | Self::Sequencer(SequencerError::Store(e)) => {
                matches!(e, StoreError::Backend(_))
            }
            _ => false,
        }
    }
}

/// Result type alias for sequencing operations.
pub type SequencingResult<T> = Result<T, SequencingError>;
