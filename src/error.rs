//! Error types for hidden-state retrieval.

/// Errors returned by a [`TensorStorage`](crate::storage::TensorStorage).
///
/// Drivers match on the variant: `NotFound` skips the query, anything
/// else aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Nothing is stored for the query (or its dataset selection is empty).
    #[error("no hidden states found for {0}")]
    NotFound(String),

    /// The stored data exists but could not be read.
    #[error("failed to load hidden states for {query}: {reason}")]
    Unknown {
        /// Query description.
        query: String,
        /// What went wrong.
        reason: String,
    },
}

impl RetrievalError {
    /// Build an [`RetrievalError::Unknown`] from any displayable cause.
    pub fn unknown(query: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unknown {
            query: query.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may skip this query and continue.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
