use std::error::Error as StdError;

use thiserror::Error;

/// Main error type for the search relevance workspace
#[derive(Error, Debug)]
pub enum SrError {
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failures reported by a search executor.
///
/// `Wrapped` lets callers attach context while keeping the original failure
/// reachable through [`std::error::Error::source`], so a cause chain can nest
/// arbitrarily deep.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Query failed on index {index}: {message}")]
    QueryFailed { index: String, message: String },

    #[error("Invalid query definition: {message}")]
    InvalidQuery { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Malformed search response: {message}")]
    MalformedResponse { message: String },

    #[error("Index not found: {index}")]
    IndexNotFound { index: String },

    #[error("Search task panicked: {message}")]
    TaskPanicked { message: String },

    #[error("Circuit breaker tripped: {message}")]
    CircuitBreaking { message: String },

    #[error("Cluster blocked: {message}")]
    ClusterBlocked { message: String },

    #[error("Out of memory: {message}")]
    OutOfMemory { message: String },

    #[error("Stack overflow: {message}")]
    StackOverflow { message: String },

    #[error("{context}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
}

impl SearchError {
    /// Attach context to an existing failure.
    pub fn wrap(
        context: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Resource exhaustion or cluster-level unavailability, as opposed to a
    /// failure scoped to one query. Only looks at this error, not its causes.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::CircuitBreaking { .. }
                | Self::ClusterBlocked { .. }
                | Self::OutOfMemory { .. }
                | Self::StackOverflow { .. }
        )
    }
}

/// Persistence failures from a result store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Write rejected: {message}")]
    WriteRejected { message: String },

    #[error("Record not found: {id}")]
    NotFound { id: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

/// Caller-visible failure of a whole variant batch
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(
        "Batch aborted for experiment {experiment_id}, search configuration {search_config_id}, query '{query_text}': {source}"
    )]
    Aborted {
        experiment_id: String,
        search_config_id: String,
        query_text: String,
        #[source]
        source: SearchError,
    },

    #[error("Batch {batch_id} was dropped before it completed")]
    Dropped { batch_id: String },
}

/// Result type alias for search relevance operations
pub type SrResult<T> = Result<T, SrError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SrError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SrError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SrError::Config(format!($($arg)*))
    };
}
