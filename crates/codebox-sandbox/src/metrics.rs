//! Prometheus metrics for the codebox supervisor.
//!
//! Only compiled with the `metrics` feature.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::audit::ToolCallOutcome;
use crate::request::ExecutionStatus;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    /// Final execution status, e.g. "success" or "timeout".
    pub status: String,
}

/// Label set for tool-call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "ok", "error", "limit_exceeded" or "cancelled".
    pub outcome: String,
}

/// Supervisor metrics.
pub struct SandboxMetrics {
    /// Executions by final status.
    pub executions_total: Family<StatusLabels, Counter>,
    /// Execution duration in seconds, by final status.
    pub execution_duration_seconds: Family<StatusLabels, Histogram>,
    /// Tool calls by settlement outcome.
    pub tool_calls_total: Family<OutcomeLabels, Counter>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "codebox_executions",
            "Sandbox executions by final status",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<StatusLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0].into_iter(),
                )
            });
        registry.register(
            "codebox_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        let tool_calls_total = Family::default();
        registry.register(
            "codebox_tool_calls",
            "Tool calls by settlement outcome",
            tool_calls_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            tool_calls_total,
        }
    }

    /// Record a finished execution.
    pub fn record_execution(&self, status: ExecutionStatus, duration_secs: f64) {
        let labels = StatusLabels {
            status: status.as_str().to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a settled tool call.
    pub fn record_tool_call(&self, outcome: &ToolCallOutcome) {
        let outcome = match outcome {
            ToolCallOutcome::Ok => "ok",
            ToolCallOutcome::Error { .. } => "error",
            ToolCallOutcome::LimitExceeded => "limit_exceeded",
            ToolCallOutcome::Cancelled => "cancelled",
        };
        self.tool_calls_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}
