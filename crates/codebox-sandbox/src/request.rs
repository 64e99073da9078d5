//! Execution requests, results, and supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;

use codebox_config::SandboxOverrides;
use serde::{Deserialize, Serialize};

/// Default wall-clock limit: five minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
/// Default tool-call budget per execution.
pub const DEFAULT_MAX_TOOL_CALLS: usize = 500;
/// Default worker heap ceiling in MiB.
pub const DEFAULT_MAX_WORKER_MEMORY_MB: usize = 512;
/// Default captured-output budget: 20 MiB.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 20 * 1024 * 1024;

/// A single script to run, with its limits. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    /// Script source, evaluated as the body of an async function.
    pub code: String,
    /// Wall-clock limit in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of tool calls dispatched to the collaborator.
    pub max_tool_calls: usize,
    /// Worker heap ceiling in MiB.
    pub max_worker_memory_mb: usize,
    /// Maximum captured console output in bytes.
    pub max_output_bytes: usize,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            code: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            max_worker_memory_mb: DEFAULT_MAX_WORKER_MEMORY_MB,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ExecutionRequest {
    /// A request for `code` with default limits.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// The wall-clock limit as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The script returned normally.
    Success,
    /// The script threw an uncaught error.
    ScriptError,
    /// The wall-clock limit elapsed first.
    Timeout,
    /// The script finished but at least one tool call was rejected for budget.
    LimitExceeded,
    /// The worker died or broke protocol before reporting completion.
    Crashed,
}

impl ExecutionStatus {
    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ScriptError => "script_error",
            Self::Timeout => "timeout",
            Self::LimitExceeded => "limit_exceeded",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal result of an [`ExecutionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique id of this execution; also names the spill file.
    pub execution_id: String,
    /// How the execution ended.
    pub status: ExecutionStatus,
    /// Bounded preview of stdout.
    pub stdout_preview: String,
    /// Bounded preview of stderr.
    pub stderr_preview: String,
    /// Full captured output on disk. `None` if the spill write failed.
    pub full_output_path: Option<PathBuf>,
    /// Worker exit code, when the worker exited with one.
    pub exit_code: Option<i32>,
    /// Script error, crash reason, or limit reason.
    pub error_message: Option<String>,
    /// Tool calls dispatched to the collaborator.
    pub tool_calls: usize,
    /// Whether captured output lost bytes to the output budget.
    pub output_truncated: bool,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
}

/// Supervisor-wide settings. Per-request limits come from
/// [`ExecutionRequest`]; this carries the defaults used by
/// [`SupervisorConfig::request`] and the knobs no request can change.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Explicit worker binary. `None` searches next to the current executable.
    pub worker_bin: Option<PathBuf>,
    /// Directory receiving `<execution_id>.log` spill files.
    pub output_dir: PathBuf,
    /// Lines kept at each end of a preview.
    pub preview_lines: usize,
    /// Byte cap applied to each preview.
    pub preview_max_bytes: usize,
    /// How long to wait for a worker to exit after `done`, and for trailing
    /// frames after an exit.
    pub exit_grace: Duration,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// Maximum IPC frame size in bytes.
    pub max_ipc_message_size: usize,
    /// Default request limits.
    pub defaults: ExecutionRequest,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_bin: None,
            output_dir: std::env::temp_dir().join("codebox"),
            preview_lines: 100,
            preview_max_bytes: 32 * 1024,
            exit_grace: Duration::from_millis(500),
            max_code_size: 1024 * 1024, // 1 MB
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
            defaults: ExecutionRequest::default(),
        }
    }
}

impl SupervisorConfig {
    /// Apply file-level overrides on top of the defaults.
    pub fn from_overrides(overrides: &SandboxOverrides) -> Self {
        let mut config = Self::default();
        if let Some(v) = overrides.timeout_ms {
            config.defaults.timeout_ms = v;
        }
        if let Some(v) = overrides.max_tool_calls {
            config.defaults.max_tool_calls = v;
        }
        if let Some(v) = overrides.max_worker_memory_mb {
            config.defaults.max_worker_memory_mb = v;
        }
        if let Some(v) = overrides.max_output_bytes {
            config.defaults.max_output_bytes = v;
        }
        if let Some(v) = overrides.max_code_size {
            config.max_code_size = v;
        }
        if let Some(v) = overrides.preview_lines {
            config.preview_lines = v;
        }
        if let Some(ref dir) = overrides.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(ref bin) = overrides.worker_bin {
            config.worker_bin = Some(bin.clone());
        }
        if let Some(ms) = overrides.exit_grace_ms {
            config.exit_grace = Duration::from_millis(ms);
        }
        config
    }

    /// A request for `code` carrying this configuration's default limits.
    pub fn request(&self, code: impl Into<String>) -> ExecutionRequest {
        ExecutionRequest {
            code: code.into(),
            ..self.defaults.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_match_documented_limits() {
        let req = ExecutionRequest::new("return 1");
        assert_eq!(req.timeout_ms, 300_000);
        assert_eq!(req.max_tool_calls, 500);
        assert_eq!(req.max_worker_memory_mb, 512);
        assert_eq!(req.max_output_bytes, 20 * 1024 * 1024);
        assert_eq!(req.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn request_deserializes_with_missing_fields() {
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"code": "console.log(1)", "max_tool_calls": 2}"#).unwrap();
        assert_eq!(req.code, "console.log(1)");
        assert_eq!(req.max_tool_calls, 2);
        assert_eq!(req.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::LimitExceeded).unwrap();
        assert_eq!(json, "\"limit_exceeded\"");
        assert_eq!(ExecutionStatus::ScriptError.to_string(), "script_error");
    }

    #[test]
    fn result_serializes_optional_path() {
        let result = ExecutionResult {
            execution_id: "abc".into(),
            status: ExecutionStatus::Crashed,
            stdout_preview: String::new(),
            stderr_preview: String::new(),
            full_output_path: None,
            exit_code: Some(137),
            error_message: Some("worker crashed".into()),
            tool_calls: 0,
            output_truncated: false,
            duration_ms: 12,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "crashed");
        assert!(json["full_output_path"].is_null());
        assert_eq!(json["exit_code"], 137);
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let overrides = SandboxOverrides {
            timeout_ms: Some(1_000),
            max_tool_calls: Some(2),
            preview_lines: Some(10),
            exit_grace_ms: Some(50),
            ..Default::default()
        };
        let config = SupervisorConfig::from_overrides(&overrides);
        assert_eq!(config.defaults.timeout_ms, 1_000);
        assert_eq!(config.defaults.max_tool_calls, 2);
        assert_eq!(config.defaults.max_worker_memory_mb, DEFAULT_MAX_WORKER_MEMORY_MB);
        assert_eq!(config.preview_lines, 10);
        assert_eq!(config.exit_grace, Duration::from_millis(50));

        let req = config.request("1");
        assert_eq!(req.max_tool_calls, 2);
        assert_eq!(req.code, "1");
    }
}
