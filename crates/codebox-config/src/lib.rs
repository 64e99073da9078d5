#![warn(missing_docs)]

//! # codebox-config
//!
//! Configuration loading for the codebox sandbox supervisor.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 300000
//! max_tool_calls = 500
//! max_worker_memory_mb = 512
//! max_output_bytes = 20971520
//! output_dir = "${HOME}/.cache/codebox/output"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level codebox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeboxConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Sandbox configuration overrides. Every field is optional; unset fields
/// keep the supervisor's built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Wall-clock execution deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum tool calls dispatched per execution.
    #[serde(default)]
    pub max_tool_calls: Option<usize>,

    /// Worker heap ceiling in megabytes.
    #[serde(default)]
    pub max_worker_memory_mb: Option<usize>,

    /// Maximum captured console output in bytes.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,

    /// Maximum size of submitted code in bytes.
    #[serde(default)]
    pub max_code_size: Option<usize>,

    /// Lines kept at each end of an output preview.
    #[serde(default)]
    pub preview_lines: Option<usize>,

    /// Directory receiving the untruncated output of each execution.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Explicit path to the `codebox-worker` binary.
    #[serde(default)]
    pub worker_bin: Option<PathBuf>,

    /// How long to wait for trailing IPC messages after the worker exits.
    #[serde(default)]
    pub exit_grace_ms: Option<u64>,
}

impl CodeboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CodeboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        let positive: [(&str, Option<u64>); 5] = [
            ("timeout_ms", sandbox.timeout_ms),
            ("max_worker_memory_mb", sandbox.max_worker_memory_mb.map(|v| v as u64)),
            ("max_output_bytes", sandbox.max_output_bytes.map(|v| v as u64)),
            ("max_code_size", sandbox.max_code_size.map(|v| v as u64)),
            ("preview_lines", sandbox.preview_lines.map(|v| v as u64)),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be greater than zero"
                )));
            }
        }
        if let Some(path) = &sandbox.worker_bin {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.worker_bin must be an absolute path, got: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
