#![warn(missing_docs)]

//! # codebox-sandbox
//!
//! Runs untrusted, model-generated JavaScript in an isolated worker process.
//!
//! The [`Supervisor`] spawns one `codebox-worker` per request and talks to it
//! over length-delimited JSON on stdin/stdout. Every external effect the
//! script has is a tool call, routed through the supervisor to a
//! [`ToolDispatcher`] and gated by a per-execution budget. Output is bounded,
//! the worker's heap is capped, and a wall-clock deadline kills runaway
//! scripts. Whatever happens, each request yields exactly one
//! [`ExecutionResult`].
//!
//! ## Limits
//!
//! - **Tool calls**: counted at dispatch; the call that would exceed
//!   `max_tool_calls` is rejected without reaching the dispatcher
//! - **Memory**: V8 heap ceiling of `max_worker_memory_mb`
//! - **Output**: `max_output_bytes`, keeping the earliest and latest output
//! - **Time**: `timeout_ms`, after which the worker is killed

pub mod arbiter;
pub mod audit;
pub mod budget;
pub mod error;
pub mod host;
pub mod ipc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod output;
pub mod pending;
pub mod request;
pub mod runtime;
pub mod supervisor;
pub mod truncate;
pub mod validator;

pub use error::SandboxError;
pub use request::{ExecutionRequest, ExecutionResult, ExecutionStatus, SupervisorConfig};
pub use supervisor::Supervisor;

/// The tool collaborator: runs tools on behalf of sandboxed scripts.
///
/// Implementations own permission checks and logging of the tools
/// themselves. The supervisor only decides whether a call may be dispatched.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Run `tool_name` with `args`.
    async fn invoke(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, codebox_error::ToolError>;
}
