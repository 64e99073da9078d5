//! Typed error type for codebox tool collaborators.
//!
//! Provides [`ToolError`]: the canonical error returned by a
//! `ToolDispatcher` when a proxied tool call fails.

use thiserror::Error;

/// Canonical error type for tool invocations made on behalf of sandboxed code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool is registered under the requested name.
    #[error("tool not found: '{0}'")]
    ToolNotFound(String),

    /// The tool layer refused the call (permission prompt declined, policy, etc).
    #[error("permission denied for tool '{tool}': {reason}")]
    PermissionDenied {
        /// The tool that was refused.
        tool: String,
        /// Why the call was refused.
        reason: String,
    },

    /// The arguments did not match what the tool expects.
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArgs {
        /// The tool that rejected its arguments.
        tool: String,
        /// Description of the problem.
        message: String,
    },

    /// The tool did not finish in time.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The tool that timed out.
        tool: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The tool ran and reported a failure.
    #[error("tool '{tool}' failed: {message}")]
    Failed {
        /// The tool that failed.
        tool: String,
        /// The failure message.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::InvalidArgs { .. } => "INVALID_ARGS",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Failed { .. } => "FAILED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the call that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Failed { .. } => true,
            Self::ToolNotFound(_) => false,
            Self::PermissionDenied { .. } => false,
            Self::InvalidArgs { .. } => false,
            Self::Internal(_) => false,
        }
    }
}

// Compile-time assertion: ToolError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<ToolError>();
};
