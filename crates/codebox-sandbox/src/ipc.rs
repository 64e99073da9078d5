//! IPC protocol for supervisor ↔ worker communication.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! All messages are typed via [`ParentMessage`] and [`ChildMessage`] enums and
//! carry a snake_case `"type"` tag on the wire (`tool_call`, `tool_result`,
//! `limit_exceeded`, `done`, ...).
//!
//! The stream from one sender is ordered. Nothing orders a `done` frame against
//! the worker's exit status, which arrives through the process host instead;
//! [`CompletionArbiter`](crate::arbiter::CompletionArbiter) reconciles the two.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::output::OutputStream;

/// Messages sent from the supervisor to the worker child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Initial message: evaluate this code.
    Execute {
        /// The script body, evaluated inside an async function.
        code: String,
        /// Worker limits.
        config: WorkerConfig,
    },
    /// Settles a pending tool call with the collaborator's outcome.
    ToolResult {
        /// Matches the id of the originating [`ChildMessage::ToolCall`].
        id: u64,
        /// The tool's value, or its error message.
        result: Result<Value, String>,
    },
    /// Settles a pending tool call with a budget rejection. The tool was not run.
    LimitExceeded {
        /// Matches the id of the originating [`ChildMessage::ToolCall`].
        id: u64,
        /// Human-readable limit description.
        reason: String,
    },
}

/// Messages sent from the worker child to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Request the supervisor to run a tool on the script's behalf.
    ToolCall {
        /// Unique per execution, never reused.
        id: u64,
        /// Tool identifier.
        tool_name: String,
        /// Tool arguments.
        args: Value,
    },
    /// A console write accepted into the worker's output buffer.
    Output {
        /// Which console stream produced the text.
        stream: OutputStream,
        /// The written text.
        text: String,
    },
    /// A diagnostic message from the worker runtime itself.
    Log {
        /// The log message text.
        message: String,
    },
    /// The script finished (returned or threw). Sent at most once.
    Done {
        /// Captured stdout, already bounded by the worker's output budget.
        stdout: String,
        /// Captured stderr, already bounded by the worker's output budget.
        stderr: String,
        /// The script's uncaught error, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Whether the worker evicted output to stay within budget.
        #[serde(default)]
        truncated: bool,
    },
}

/// Configuration passed to the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum captured console output in bytes.
    pub max_output_bytes: usize,
    /// Maximum IPC message size in bytes. Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl WorkerConfig {
    /// Derive the worker's limits from an execution request.
    pub fn for_request(request: &crate::ExecutionRequest, max_ipc_message_size: usize) -> Self {
        Self {
            max_heap_size: request.max_worker_memory_mb.saturating_mul(1024 * 1024),
            max_output_bytes: request.max_output_bytes,
            max_ipc_message_size,
        }
    }
}

/// Protocol anomalies detected on the IPC channel.
///
/// Only [`ProtocolViolation::MalformedFrame`] ends the execution; the others
/// are logged and the offending message is ignored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A frame could not be read or decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A tool call reused an id already seen in this execution.
    #[error("duplicate tool call id {0}")]
    DuplicateCallId(u64),

    /// A reply referenced an id that is unknown or already settled.
    #[error("unknown or already-settled call id {0}")]
    UnknownCallId(u64),

    /// A message arrived that is not valid in the current state.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Not cancel-safe: a partially read frame is lost if the future is dropped,
/// so callers that multiplex should read from a dedicated task.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC message too large: {} bytes (limit: {} bytes)",
                len, max_size
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}
