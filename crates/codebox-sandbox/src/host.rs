//! Worker process host.
//!
//! Spawns `codebox-worker` with a clean environment, hands it the `execute`
//! message, and exposes the process to the supervisor through the
//! [`WorkerProcess`] trait so the event loop never touches the OS directly.

use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::SandboxError;
use crate::ipc::{write_message, ParentMessage, WorkerConfig};
use crate::request::{ExecutionRequest, SupervisorConfig};

/// File name of the worker binary.
pub const WORKER_BIN_NAME: &str = "codebox-worker";

/// Environment variable naming an explicit worker binary (absolute path).
pub const WORKER_BIN_ENV: &str = "CODEBOX_WORKER_BIN";

/// When set, the worker's stderr is inherited instead of discarded.
pub const DEBUG_ENV: &str = "CODEBOX_DEBUG";

/// Data-segment allowance on top of the script's memory budget for the V8
/// runtime itself. Platform worker thread stacks dominate it.
pub const RUNTIME_MEMORY_HEADROOM: u64 = 512 * 1024 * 1024;

/// Process-level allocation ceiling for a worker running `request`.
///
/// Covers the V8 heap, `ArrayBuffer` backing stores (allocated outside the
/// heap), and up to two copies of the output budget held while `done` is
/// serialized.
pub fn worker_memory_limit(request: &ExecutionRequest) -> u64 {
    let heap = (request.max_worker_memory_mb as u64).saturating_mul(1024 * 1024);
    let output = (request.max_output_bytes as u64).saturating_mul(2);
    heap.saturating_add(output).saturating_add(RUNTIME_MEMORY_HEADROOM)
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with a status code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
    /// Its status could not be collected.
    Lost(String),
}

impl WorkerExit {
    /// Exit code 0.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// The exit code, if the worker exited with one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            _ => None,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Lost(format!("unrecognized exit status: {status}"))
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "killed by signal {signal}"),
            Self::Lost(reason) => write!(f, "exit status lost: {reason}"),
        }
    }
}

/// Why the supervisor killed a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The wall-clock limit elapsed.
    Timeout,
    /// The worker sent a frame that could not be decoded.
    ProtocolViolation,
    /// The worker reported completion but did not exit in time.
    Lingering,
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::Lingering => "lingering",
        })
    }
}

/// A running worker as seen by the supervisor loop.
#[async_trait::async_trait]
pub trait WorkerProcess: Send {
    /// Wait for the worker to exit. Cancel-safe; once observed, the exit is
    /// returned again on every later call.
    async fn wait(&mut self) -> WorkerExit;

    /// Kill the worker. Idempotent, and a no-op once it has exited.
    async fn terminate(&mut self, reason: TerminateReason);
}

/// A real `codebox-worker` child process.
pub struct ChildWorker {
    child: Child,
    exit: Option<WorkerExit>,
    terminated: Option<TerminateReason>,
}

#[async_trait::async_trait]
impl WorkerProcess for ChildWorker {
    async fn wait(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.child.wait().await {
            Ok(status) => WorkerExit::from_status(status),
            Err(e) => WorkerExit::Lost(e.to_string()),
        };
        self.exit = Some(exit.clone());
        exit
    }

    async fn terminate(&mut self, reason: TerminateReason) {
        if self.exit.is_some() || self.terminated.is_some() {
            return;
        }
        self.terminated = Some(reason);
        tracing::warn!(pid = ?self.child.id(), reason = %reason, "terminating worker");
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "worker already gone");
        }
    }
}

/// A freshly spawned worker that has been sent its `execute` message.
pub struct WorkerHandle {
    process: ChildWorker,
    stdout: BufReader<ChildStdout>,
    stdin: ChildStdin,
}

impl WorkerHandle {
    /// Spawn a worker for `request` and send it the code.
    pub async fn spawn(
        request: &ExecutionRequest,
        config: &SupervisorConfig,
        max_ipc_message_size: usize,
    ) -> Result<Self, SandboxError> {
        let worker_bin = find_worker_binary(config.worker_bin.as_deref())?;

        let mut command = Command::new(&worker_bin);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var_os(DEBUG_ENV).is_some() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true);
        #[cfg(unix)]
        apply_worker_limits(&mut command, worker_memory_limit(request));

        let mut child = command.spawn().map_err(|e| {
            SandboxError::spawn(format!("cannot start {}: {e}", worker_bin.display()))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::spawn("no stdin on worker"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::spawn("no stdout on worker"))?;

        tracing::debug!(pid = ?child.id(), bin = %worker_bin.display(), "worker spawned");

        let execute = ParentMessage::Execute {
            code: request.code.clone(),
            config: WorkerConfig::for_request(request, max_ipc_message_size),
        };
        write_message(&mut stdin, &execute)
            .await
            .map_err(|e| SandboxError::spawn(format!("failed to send code to worker: {e}")))?;

        Ok(Self {
            process: ChildWorker {
                child,
                exit: None,
                terminated: None,
            },
            stdout: BufReader::new(stdout),
            stdin,
        })
    }

    /// Split into the process, its IPC reader, and its IPC writer.
    pub fn into_parts(self) -> (ChildWorker, BufReader<ChildStdout>, ChildStdin) {
        (self.process, self.stdout, self.stdin)
    }
}

/// Disable core dumps and cap the worker's data segment at `data_limit`
/// bytes.
///
/// `RLIMIT_DATA` rather than `RLIMIT_AS`: V8 reserves large inaccessible
/// address ranges up front, which count against the address-space limit but
/// not the data limit until they are committed.
#[cfg(unix)]
fn apply_worker_limits(command: &mut Command, data_limit: u64) {
    // SAFETY: the closure runs between fork and exec and only calls
    // getrlimit/setrlimit, which are async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &no_core) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::getrlimit(libc::RLIMIT_DATA, &mut current) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // An unprivileged process cannot raise its hard limit.
            let v = (data_limit as libc::rlim_t).min(current.rlim_max);
            let data = libc::rlimit {
                rlim_cur: v,
                rlim_max: v,
            };
            if libc::setrlimit(libc::RLIMIT_DATA, &data) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Locate the `codebox-worker` binary.
///
/// Search order:
/// 1. `configured`, from [`SupervisorConfig::worker_bin`]
/// 2. `CODEBOX_WORKER_BIN` (must be an absolute path)
/// 3. The current executable's directory, then its parent (test binaries
///    live in `target/<profile>/deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf, SandboxError> {
    if let Some(path) = configured {
        if !path.is_absolute() {
            return Err(SandboxError::spawn(format!(
                "worker_bin must be an absolute path, got: {}",
                path.display()
            )));
        }
        validate_binary_permissions(path)?;
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        let p = PathBuf::from(path);
        if !p.is_absolute() {
            return Err(SandboxError::spawn(format!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {}",
                p.display()
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate_dir in std::iter::once(dir).chain(dir.parent()) {
                let worker = candidate_dir.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::spawn(format!(
        "{WORKER_BIN_NAME} binary not found. \
         Set {WORKER_BIN_ENV} or install it next to this executable"
    )))
}

fn validate_binary_permissions(path: &Path) -> Result<(), SandboxError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        SandboxError::spawn(format!("cannot read metadata for {}: {e}", path.display()))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::spawn(format!(
                "insecure permissions on worker binary {}: mode {mode:o} is world-writable",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;
    Ok(())
}
