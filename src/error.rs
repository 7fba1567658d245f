//! Typed error conditions that callers branch on.
//!
//! Most fallible operations in this crate return [`anyhow::Result`]. The
//! variants here travel inside an [`anyhow::Error`] and can be recovered
//! with [`anyhow::Error::downcast_ref`] when a caller needs to tell an
//! abort apart from an ordinary failure.

use thiserror::Error;

/// Errors with a defined meaning for callers.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A cooperative abort signal fired; `stage` names the boundary where it was observed.
    #[error("operation aborted during {stage}")]
    Aborted { stage: String },
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A vector did not match the dimensionality of the active index.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// The embedding provider returned a different number of vectors than texts sent.
    #[error("embedding provider returned {actual} vectors for {expected} texts")]
    EmbeddingCountMismatch { expected: usize, actual: usize },
}

impl HarnessError {
    pub fn aborted(stage: impl Into<String>) -> Self {
        HarnessError::Aborted {
            stage: stage.into(),
        }
    }

    /// True if `err` is (or wraps) an [`HarnessError::Aborted`].
    pub fn is_abort(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Aborted { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_survives_anyhow_wrapping() {
        let err: anyhow::Error = HarnessError::aborted("embed").into();
        assert!(HarnessError::is_abort(&err));
        assert_eq!(err.to_string(), "operation aborted during embed");

        let other = anyhow::anyhow!("disk full");
        assert!(!HarnessError::is_abort(&other));
    }
}
