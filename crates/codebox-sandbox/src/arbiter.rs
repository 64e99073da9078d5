//! Completion arbitration.
//!
//! Three sources can end an execution: the worker's `done` message, the
//! worker process exiting, and the wall-clock deadline. They race, and a
//! `done` frame can be read after the exit that followed it. The supervisor
//! offers every trigger it observes during one scheduling turn, then asks the
//! arbiter to resolve; the winner is picked by priority `done > exit > timeout`
//! and everything after it is ignored.

use crate::host::WorkerExit;
use crate::ipc::ProtocolViolation;
use crate::request::ExecutionStatus;
use crate::runtime::MEMORY_LIMIT_EXIT_CODE;

/// An event that can end an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The worker reported completion.
    Done {
        /// The script's uncaught error, if any.
        error: Option<String>,
    },
    /// The worker process exited.
    Exit(WorkerExit),
    /// The deadline elapsed.
    Timeout {
        /// The limit that elapsed.
        timeout_ms: u64,
    },
}

/// Arbiter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    /// No trigger seen yet.
    Running,
    /// Triggers offered this turn, not yet resolved.
    Settling,
    /// A result was chosen. Terminal.
    Settled,
}

/// The winning trigger, mapped to a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Status before budget escalation.
    pub status: ExecutionStatus,
    /// Error text for the result.
    pub error_message: Option<String>,
    /// Worker exit, if one was offered this turn.
    pub exit: Option<WorkerExit>,
}

/// Picks exactly one outcome per execution.
#[derive(Debug)]
pub struct CompletionArbiter {
    state: ArbiterState,
    done: Option<Option<String>>,
    exit: Option<WorkerExit>,
    timeout_ms: Option<u64>,
    violation: Option<ProtocolViolation>,
}

impl Default for CompletionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionArbiter {
    /// A running arbiter.
    pub fn new() -> Self {
        Self {
            state: ArbiterState::Running,
            done: None,
            exit: None,
            timeout_ms: None,
            violation: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ArbiterState {
        self.state
    }

    /// Whether a result has been chosen.
    pub fn is_settled(&self) -> bool {
        self.state == ArbiterState::Settled
    }

    /// Offer a trigger for this turn. Ignored once settled; within a turn the
    /// first trigger of each kind wins.
    pub fn offer(&mut self, trigger: Trigger) {
        if self.is_settled() {
            tracing::debug!(?trigger, "trigger after settlement ignored");
            return;
        }
        self.state = ArbiterState::Settling;
        match trigger {
            Trigger::Done { error } => {
                self.done.get_or_insert(error);
            }
            Trigger::Exit(exit) => {
                self.exit.get_or_insert(exit);
            }
            Trigger::Timeout { timeout_ms } => {
                self.timeout_ms.get_or_insert(timeout_ms);
            }
        }
    }

    /// Record a protocol violation; it names the crash if the worker exits
    /// without completing.
    pub fn note_protocol_violation(&mut self, violation: ProtocolViolation) {
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
    }

    /// Resolve the triggers offered this turn. `None` if nothing was offered
    /// or a result was already chosen.
    pub fn resolve(&mut self) -> Option<Resolution> {
        if self.state != ArbiterState::Settling {
            return None;
        }
        self.state = ArbiterState::Settled;

        let exit = self.exit.clone();
        if let Some(error) = self.done.take() {
            let status = if error.is_some() {
                ExecutionStatus::ScriptError
            } else {
                ExecutionStatus::Success
            };
            return Some(Resolution {
                status,
                error_message: error,
                exit,
            });
        }

        if let Some(worker_exit) = &self.exit {
            return Some(Resolution {
                status: ExecutionStatus::Crashed,
                error_message: Some(self.crash_message(worker_exit)),
                exit,
            });
        }

        let timeout_ms = self.timeout_ms.unwrap_or_default();
        Some(Resolution {
            status: ExecutionStatus::Timeout,
            error_message: Some(format!("execution timed out after {timeout_ms} ms")),
            exit,
        })
    }

    fn crash_message(&self, exit: &WorkerExit) -> String {
        if let Some(violation) = &self.violation {
            return format!("protocol violation: {violation}");
        }
        match exit {
            WorkerExit::Code(0) => {
                "protocol violation: worker exited without reporting completion".to_string()
            }
            WorkerExit::Code(MEMORY_LIMIT_EXIT_CODE) => {
                "worker exceeded its memory limit".to_string()
            }
            other => format!("worker crashed: {other}"),
        }
    }
}
