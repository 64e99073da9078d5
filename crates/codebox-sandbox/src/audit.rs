//! Audit records for sandbox executions.
//!
//! Every execution emits one [`AuditEntry`] containing:
//! - Execution ID (UUID), shared with the result and the spill file
//! - SHA-256 hash of the code, plus a 500-char preview
//! - Every tool call with hashed args (never raw) and how it was settled
//! - Final status, duration and output size
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::request::{ExecutionResult, ExecutionStatus};

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// When the execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First characters of the code, for human review.
    pub code_preview: String,
    /// Tool calls received from the script, in settlement order.
    pub tool_calls: Vec<ToolCallAudit>,
    /// Final status.
    pub status: ExecutionStatus,
    /// Error text of the result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Bytes of captured stdout and stderr.
    pub output_bytes: usize,
    /// Whether output was evicted to stay within budget.
    pub output_truncated: bool,
}

/// How a tool call was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    /// The collaborator returned a value.
    Ok,
    /// The collaborator returned an error.
    Error {
        /// Stable error code from `ToolError::code`.
        code: String,
    },
    /// Rejected for budget; never dispatched.
    LimitExceeded,
    /// Still in flight when the execution settled.
    Cancelled,
}

/// Audit record for a single tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallAudit {
    /// Call id assigned by the worker.
    pub id: u64,
    /// Tool identifier.
    pub tool: String,
    /// SHA-256 hash of the serialized arguments.
    pub args_hash: String,
    /// Time from dispatch to settlement in milliseconds.
    pub duration_ms: u64,
    /// How the call was settled.
    pub outcome: ToolCallOutcome,
}

impl ToolCallAudit {
    /// Build a record, hashing `args`.
    pub fn new(
        id: u64,
        tool: impl Into<String>,
        args: &serde_json::Value,
        duration_ms: u64,
        outcome: ToolCallOutcome,
    ) -> Self {
        Self {
            id,
            tool: tool.into(),
            args_hash: sha256_hex(&args.to_string()),
            duration_ms,
            outcome,
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits audit entries as structured `tracing` events at `INFO` with
/// `audit = true`. Tool calls are summarised as counts.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let rejected = entry
            .tool_calls
            .iter()
            .filter(|c| c.outcome == ToolCallOutcome::LimitExceeded)
            .count();
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            code_hash = %entry.code_hash,
            status = %entry.status,
            duration_ms = entry.duration_ms,
            output_bytes = entry.output_bytes,
            output_truncated = entry.output_truncated,
            tool_calls = entry.tool_calls.len(),
            tool_calls_rejected = rejected,
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First [`CODE_PREVIEW_MAX`] bytes of `code`, cut at a char boundary, with
/// an ellipsis when shortened.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Collects audit data while an execution runs.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    tool_calls: Vec<ToolCallAudit>,
}

impl AuditEntryBuilder {
    /// Start an entry for `code` under a fresh execution id.
    pub fn new(code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
            tool_calls: Vec::new(),
        }
    }

    /// The execution id this entry is for.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record a settled tool call.
    pub fn record_tool_call(&mut self, audit: ToolCallAudit) {
        self.tool_calls.push(audit);
    }

    /// Finalize the entry from the execution's result.
    pub fn finish(self, result: &ExecutionResult, output_bytes: usize) -> AuditEntry {
        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            tool_calls: self.tool_calls,
            status: result.status,
            error_message: result.error_message.clone(),
            duration_ms: result.duration_ms,
            output_bytes,
            output_truncated: result.output_truncated,
        }
    }
}
