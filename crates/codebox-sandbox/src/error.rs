//! Error types for the codebox sandbox.
//!
//! [`SandboxError`] covers failures that stop an execution before the
//! completion arbiter could ever settle it. Everything that happens after the
//! worker is running (script errors, timeouts, crashes, limit rejections) is
//! reported inside an [`ExecutionResult`](crate::ExecutionResult) instead.

use thiserror::Error;

/// Errors surfaced directly to the caller of
/// [`Supervisor::execute`](crate::Supervisor::execute).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The worker process could not be created or handed its payload.
    #[error("failed to spawn worker: {reason}")]
    Spawn {
        /// What went wrong.
        reason: String,
    },

    /// Code failed validation checks.
    #[error("code validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A request limit is out of range.
    #[error("invalid execution request: {reason}")]
    InvalidRequest {
        /// What went wrong.
        reason: String,
    },

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Message serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    pub(crate) fn spawn(reason: impl Into<String>) -> Self {
        Self::Spawn {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_mentions_reason() {
        let err = SandboxError::spawn("no such file");
        assert_eq!(err.to_string(), "failed to spawn worker: no such file");
    }

    #[test]
    fn code_too_large_reports_both_sizes() {
        let err = SandboxError::CodeTooLarge {
            max: 10,
            actual: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("10") && msg.contains("12"), "{msg}");
    }
}
