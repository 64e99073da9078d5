//! The execution supervisor.
//!
//! One [`Supervisor::execute`] call owns one worker process from spawn to
//! reap. A single event loop per execution consumes four sources: decoded
//! frames from the worker, completions of dispatched tool calls, the worker's
//! exit, and the deadline. Each turn offers whatever ended the execution to
//! the [`CompletionArbiter`], which settles exactly once.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use codebox_error::ToolError;

use crate::arbiter::{CompletionArbiter, Resolution, Trigger};
use crate::audit::{
    AuditEntryBuilder, AuditLogger, NoopAuditLogger, ToolCallAudit, ToolCallOutcome,
};
use crate::budget::CallBudget;
use crate::error::SandboxError;
use crate::host::{TerminateReason, WorkerExit, WorkerHandle, WorkerProcess};
use crate::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage, ProtocolViolation,
};
#[cfg(feature = "metrics")]
use crate::metrics::SandboxMetrics;
use crate::output::{CapturedOutput, OutputBuffer};
use crate::pending::{PendingCall, PendingCalls};
use crate::request::{ExecutionRequest, ExecutionResult, ExecutionStatus, SupervisorConfig};
use crate::truncate::OutputTruncator;
use crate::validator::validate_request;
use crate::ToolDispatcher;

/// Headroom above twice the output budget for a `done` frame's JSON framing.
const DONE_FRAME_SLACK: usize = 1024 * 1024;

/// Frames buffered between the reader task and the event loop.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Runs execution requests in isolated workers.
pub struct Supervisor {
    config: SupervisorConfig,
    dispatcher: Arc<dyn ToolDispatcher>,
    truncator: OutputTruncator,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SandboxMetrics>>,
}

impl Supervisor {
    /// Create a supervisor dispatching tool calls to `dispatcher`.
    pub fn new(config: SupervisorConfig, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        let truncator = OutputTruncator::from_config(&config);
        Self {
            config,
            dispatcher,
            truncator,
            audit_logger: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Emit an audit entry per execution to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// Record execution and tool-call metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The supervisor's configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `request` in a fresh worker and return its single result.
    ///
    /// Errors only when the execution never started: the request was invalid
    /// or the worker could not be spawned. Script errors, crashes, timeouts
    /// and budget rejections are all reported inside the result.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        validate_request(&request, self.config.max_code_size)?;

        let started = Instant::now();
        let handle = WorkerHandle::spawn(&request, &self.config, self.ipc_limit(&request)).await?;
        let (process, reader, writer) = handle.into_parts();
        Ok(self
            .execute_with_worker(&request, process, reader, writer, started)
            .await)
    }

    fn ipc_limit(&self, request: &ExecutionRequest) -> usize {
        let done_frame = request
            .max_output_bytes
            .saturating_mul(2)
            .saturating_add(DONE_FRAME_SLACK);
        self.config.max_ipc_message_size.max(done_frame)
    }

    /// Drive one execution against an already-started worker.
    pub(crate) async fn execute_with_worker<P, R, W>(
        &self,
        request: &ExecutionRequest,
        mut process: P,
        reader: R,
        writer: W,
        started: Instant,
    ) -> ExecutionResult
    where
        P: WorkerProcess,
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let audit = AuditEntryBuilder::new(&request.code);
        let execution_id = audit.execution_id().to_string();
        tracing::info!(
            execution_id = %execution_id,
            timeout_ms = request.timeout_ms,
            max_tool_calls = request.max_tool_calls,
            "execution started"
        );

        let deadline = started + request.timeout();
        let mut session = Session {
            execution_id: execution_id.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            writer,
            writer_open: true,
            deadline,
            worker_exited: false,
            budget: CallBudget::new(request.max_tool_calls),
            pending: PendingCalls::new(),
            in_flight: FuturesUnordered::new(),
            mirror: OutputBuffer::new(request.max_output_bytes),
            done_output: None,
            first_rejection: None,
            arbiter: CompletionArbiter::new(),
            audit,
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        };

        let (mut frames, reader_task) = spawn_reader(reader, self.ipc_limit(request));
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut exit: Option<WorkerExit> = None;
        let mut frames_open = true;

        let resolution = loop {
            let event = tokio::select! {
                biased;
                frame = frames.recv(), if frames_open => Event::Frame(frame),
                Some(outcome) = session.in_flight.next(), if !session.in_flight.is_empty() => {
                    Event::Dispatched(outcome)
                }
                worker_exit = process.wait(), if exit.is_none() => Event::Exited(worker_exit),
                () = &mut sleep => Event::Deadline,
            };

            match event {
                Event::Frame(Some(Ok(msg))) => session.on_message(msg).await,
                Event::Frame(Some(Err(reason))) => {
                    frames_open = false;
                    session.malformed_frame(reason);
                    process.terminate(TerminateReason::ProtocolViolation).await;
                }
                Event::Frame(None) => frames_open = false,
                Event::Dispatched(outcome) => session.on_dispatched(outcome).await,
                Event::Exited(worker_exit) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        exit = %worker_exit,
                        "worker exited"
                    );
                    session.worker_exited = true;
                    if frames_open {
                        // A `done` flushed just before exit may still be queued.
                        let drain_until = Instant::now() + self.config.exit_grace;
                        while let Ok(Some(frame)) =
                            tokio::time::timeout_at(drain_until, frames.recv()).await
                        {
                            match frame {
                                Ok(msg) => session.on_message(msg).await,
                                Err(reason) => {
                                    session.malformed_frame(reason);
                                    break;
                                }
                            }
                        }
                        frames_open = false;
                    }
                    exit = Some(worker_exit.clone());
                    session.arbiter.offer(Trigger::Exit(worker_exit));
                }
                Event::Deadline => {}
            }

            if Instant::now() >= deadline {
                session.arbiter.offer(Trigger::Timeout {
                    timeout_ms: request.timeout_ms,
                });
            }

            if let Some(resolution) = session.arbiter.resolve() {
                break resolution;
            }
        };

        reader_task.abort();
        let exit = match exit {
            Some(exit) => Some(exit),
            None => self.reap(&mut process, &resolution, &execution_id).await,
        };
        session.cancel_pending();

        let captured = session
            .done_output
            .take()
            .unwrap_or_else(|| session.mirror.snapshot());
        let output_bytes = captured.stdout.len() + captured.stderr.len();
        let previews = self.truncator.truncate(&execution_id, &captured).await;

        let (status, error_message) = escalate(resolution, session.first_rejection.take());
        let result = ExecutionResult {
            execution_id: execution_id.clone(),
            status,
            stdout_preview: previews.stdout_preview,
            stderr_preview: previews.stderr_preview,
            full_output_path: previews.full_path,
            exit_code: exit.as_ref().and_then(WorkerExit::code),
            error_message,
            tool_calls: session.budget.dispatched(),
            output_truncated: captured.truncated,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            execution_id = %execution_id,
            status = %result.status,
            tool_calls = result.tool_calls,
            tool_calls_rejected = session.budget.rejected(),
            output_truncated = result.output_truncated,
            duration_ms = result.duration_ms,
            "execution finished"
        );

        let entry = session.audit.finish(&result, output_bytes);
        self.audit_logger.log(&entry).await;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(result.status, started.elapsed().as_secs_f64());
        }

        result
    }

    /// Make sure a worker that has not been seen exiting is gone.
    async fn reap<P: WorkerProcess>(
        &self,
        process: &mut P,
        resolution: &Resolution,
        execution_id: &str,
    ) -> Option<WorkerExit> {
        let grace = self.config.exit_grace;
        if resolution.status == ExecutionStatus::Timeout {
            process.terminate(TerminateReason::Timeout).await;
            return tokio::time::timeout(grace, process.wait()).await.ok();
        }

        if let Ok(exit) = tokio::time::timeout(grace, process.wait()).await {
            return Some(exit);
        }
        tracing::warn!(execution_id = %execution_id, "worker still running after done");
        process.terminate(TerminateReason::Lingering).await;
        tokio::time::timeout(grace, process.wait()).await.ok()
    }
}

/// A finished budget escalates a completed script to `limit_exceeded`.
fn escalate(
    resolution: Resolution,
    first_rejection: Option<String>,
) -> (ExecutionStatus, Option<String>) {
    match (resolution.status, first_rejection) {
        (ExecutionStatus::Success | ExecutionStatus::ScriptError, Some(reason)) => (
            ExecutionStatus::LimitExceeded,
            resolution.error_message.or(Some(reason)),
        ),
        (status, _) => (status, resolution.error_message),
    }
}

type Frame = Result<ChildMessage, String>;

/// Read frames on a dedicated task: a partially read frame must survive the
/// event loop switching to another source.
fn spawn_reader<R>(mut reader: R, max_size: usize) -> (mpsc::Receiver<Frame>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let task = tokio::spawn(async move {
        loop {
            match read_message_with_limit::<ChildMessage, _>(&mut reader, max_size).await {
                Ok(Some(msg)) => {
                    if tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e.to_string())).await;
                    break;
                }
            }
        }
    });
    (rx, task)
}

struct DispatchOutcome {
    id: u64,
    result: Result<Value, ToolError>,
}

enum Event {
    Frame(Option<Frame>),
    Dispatched(DispatchOutcome),
    Exited(WorkerExit),
    Deadline,
}

/// Per-execution state owned by the event loop.
struct Session<W> {
    execution_id: String,
    dispatcher: Arc<dyn ToolDispatcher>,
    writer: W,
    writer_open: bool,
    /// Writes to the worker never outlive the execution deadline.
    deadline: Instant,
    worker_exited: bool,
    budget: CallBudget,
    pending: PendingCalls,
    in_flight: FuturesUnordered<BoxFuture<'static, DispatchOutcome>>,
    mirror: OutputBuffer,
    done_output: Option<CapturedOutput>,
    first_rejection: Option<String>,
    arbiter: CompletionArbiter,
    audit: AuditEntryBuilder,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SandboxMetrics>>,
}

impl<W: AsyncWrite + Unpin + Send> Session<W> {
    async fn send(&mut self, msg: &ParentMessage) {
        if !self.writer_open {
            return;
        }
        let write = write_message(&mut self.writer, msg);
        match tokio::time::timeout_at(self.deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(
                    execution_id = %self.execution_id,
                    error = %e,
                    "worker stdin closed"
                );
                self.writer_open = false;
            }
            Err(_) => {
                // A frame may be half written; nothing more can follow it.
                tracing::warn!(
                    execution_id = %self.execution_id,
                    "worker stdin not draining before the deadline"
                );
                self.writer_open = false;
            }
        }
    }

    async fn on_message(&mut self, msg: ChildMessage) {
        match msg {
            ChildMessage::ToolCall {
                id,
                tool_name,
                args,
            } => self.on_tool_call(id, tool_name, args).await,
            ChildMessage::Output { stream, text } => self.mirror.push(stream, &text),
            ChildMessage::Log { message } => {
                tracing::debug!(
                    target: "codebox::worker",
                    execution_id = %self.execution_id,
                    "{message}"
                );
            }
            ChildMessage::Done {
                stdout,
                stderr,
                error,
                truncated,
            } => {
                if self.done_output.is_some() {
                    self.anomaly(ProtocolViolation::UnexpectedMessage("second done".into()));
                    return;
                }
                self.done_output = Some(CapturedOutput {
                    stdout,
                    stderr,
                    truncated,
                });
                self.arbiter.offer(Trigger::Done { error });
            }
        }
    }

    async fn on_tool_call(&mut self, id: u64, tool_name: String, args: Value) {
        if self.worker_exited {
            tracing::debug!(
                execution_id = %self.execution_id,
                id,
                tool = %tool_name,
                "tool call from exited worker ignored"
            );
            return;
        }
        if let Err(violation) = self.pending.observe(id) {
            self.anomaly(violation);
            return;
        }

        match self.budget.try_acquire() {
            Ok(count) => {
                tracing::debug!(
                    execution_id = %self.execution_id,
                    id,
                    tool = %tool_name,
                    count,
                    "dispatching tool call"
                );
                self.pending
                    .insert(PendingCall::new(id, tool_name.clone(), args.clone()));
                let dispatcher = Arc::clone(&self.dispatcher);
                self.in_flight.push(Box::pin(async move {
                    let result = dispatcher.invoke(&tool_name, args).await;
                    DispatchOutcome { id, result }
                }));
            }
            Err(exhausted) => {
                let reason = exhausted.to_string();
                tracing::info!(
                    execution_id = %self.execution_id,
                    id,
                    tool = %tool_name,
                    max = exhausted.max,
                    "tool call rejected: budget exhausted"
                );
                if self.first_rejection.is_none() {
                    self.first_rejection = Some(reason.clone());
                }
                self.record_call(id, &tool_name, &args, 0, ToolCallOutcome::LimitExceeded);
                self.send(&ParentMessage::LimitExceeded { id, reason }).await;
            }
        }
    }

    async fn on_dispatched(&mut self, outcome: DispatchOutcome) {
        let Some(call) = self.pending.settle(outcome.id) else {
            self.anomaly(ProtocolViolation::UnknownCallId(outcome.id));
            return;
        };
        let elapsed_ms = call.created_at.elapsed().as_millis() as u64;

        let audit_outcome = match &outcome.result {
            Ok(_) => ToolCallOutcome::Ok,
            Err(e) => {
                tracing::info!(
                    execution_id = %self.execution_id,
                    id = call.id,
                    tool = %call.tool_name,
                    code = e.code(),
                    retryable = e.retryable(),
                    "tool call failed"
                );
                ToolCallOutcome::Error {
                    code: e.code().to_string(),
                }
            }
        };
        self.record_call(call.id, &call.tool_name, &call.args, elapsed_ms, audit_outcome);

        let result = outcome.result.map_err(|e| e.to_string());
        self.send(&ParentMessage::ToolResult {
            id: call.id,
            result,
        })
        .await;
    }

    fn malformed_frame(&mut self, reason: String) {
        let violation = ProtocolViolation::MalformedFrame(reason);
        tracing::warn!(
            execution_id = %self.execution_id,
            violation = %violation,
            "protocol violation"
        );
        self.arbiter.note_protocol_violation(violation);
    }

    fn anomaly(&self, violation: ProtocolViolation) {
        tracing::warn!(
            execution_id = %self.execution_id,
            violation = %violation,
            "ignoring protocol anomaly"
        );
    }

    /// Drop in-flight dispatches and settle their calls as cancelled.
    fn cancel_pending(&mut self) {
        self.in_flight = FuturesUnordered::new();
        if self.pending.is_empty() {
            return;
        }
        for call in self.pending.cancel_all() {
            tracing::info!(
                execution_id = %self.execution_id,
                id = call.id,
                tool = %call.tool_name,
                "tool call cancelled at settlement"
            );
            let elapsed_ms = call.created_at.elapsed().as_millis() as u64;
            self.record_call(
                call.id,
                &call.tool_name,
                &call.args,
                elapsed_ms,
                ToolCallOutcome::Cancelled,
            );
        }
    }

    fn record_call(
        &mut self,
        id: u64,
        tool: &str,
        args: &Value,
        duration_ms: u64,
        outcome: ToolCallOutcome,
    ) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_tool_call(&outcome);
        }
        self.audit
            .record_tool_call(ToolCallAudit::new(id, tool, args, duration_ms, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::oneshot;

    use crate::audit::AuditEntry;
    use crate::ipc::read_message;
    use crate::output::OutputStream;

    struct CountingDispatcher {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ToolDispatcher for CountingDispatcher {
        async fn invoke(&self, tool_name: &str, args: Value) -> Result<Value, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match tool_name {
                "fail" => Err(ToolError::Failed {
                    tool: tool_name.into(),
                    message: "disk on fire".into(),
                }),
                "hang" => std::future::pending().await,
                "bulk" => Ok(json!("x".repeat(256 * 1024))),
                _ => Ok(json!({ "tool": tool_name, "n": n, "args": args })),
            }
        }
    }

    #[derive(Default)]
    struct CaptureAudit(Mutex<Vec<AuditEntry>>);

    #[async_trait::async_trait]
    impl AuditLogger for CaptureAudit {
        async fn log(&self, entry: &AuditEntry) {
            self.0.lock().unwrap().push(entry.clone());
        }
    }

    struct FakeProcess {
        exit_rx: Option<oneshot::Receiver<WorkerExit>>,
        exit: Option<WorkerExit>,
        terminations: Arc<Mutex<Vec<TerminateReason>>>,
    }

    #[async_trait::async_trait]
    impl WorkerProcess for FakeProcess {
        async fn wait(&mut self) -> WorkerExit {
            if let Some(exit) = &self.exit {
                return exit.clone();
            }
            let exit = match self.exit_rx.as_mut() {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| WorkerExit::Lost("exit sender dropped".into())),
                None => std::future::pending().await,
            };
            self.exit = Some(exit.clone());
            exit
        }

        async fn terminate(&mut self, reason: TerminateReason) {
            if self.exit.is_some() {
                return;
            }
            self.terminations.lock().unwrap().push(reason);
            self.exit_rx = None;
            self.exit = Some(WorkerExit::Signal(9));
        }
    }

    /// The worker's side of a scripted session.
    struct FakeWorker {
        to_supervisor: DuplexStream,
        from_supervisor: DuplexStream,
        exit_tx: Option<oneshot::Sender<WorkerExit>>,
    }

    impl FakeWorker {
        async fn send(&mut self, msg: ChildMessage) {
            write_message(&mut self.to_supervisor, &msg).await.unwrap();
        }

        async fn recv(&mut self) -> ParentMessage {
            read_message(&mut self.from_supervisor)
                .await
                .unwrap()
                .expect("supervisor closed the channel")
        }

        async fn call(&mut self, id: u64, tool: &str) -> ParentMessage {
            self.send(ChildMessage::ToolCall {
                id,
                tool_name: tool.into(),
                args: json!({ "id": id }),
            })
            .await;
            self.recv().await
        }

        async fn stdout(&mut self, text: &str) {
            self.send(ChildMessage::Output {
                stream: OutputStream::Stdout,
                text: text.into(),
            })
            .await;
        }

        async fn done(&mut self, stdout: &str, error: Option<&str>) {
            self.send(ChildMessage::Done {
                stdout: stdout.into(),
                stderr: String::new(),
                error: error.map(str::to_string),
                truncated: false,
            })
            .await;
        }

        fn exit(&mut self, exit: WorkerExit) {
            if let Some(tx) = self.exit_tx.take() {
                let _ = tx.send(exit);
            }
        }

        /// Hold the session open until the supervisor hangs up.
        async fn linger(mut self) {
            while let Ok(Some(_)) =
                read_message::<ParentMessage, _>(&mut self.from_supervisor).await
            {}
        }
    }

    struct Harness {
        supervisor: Supervisor,
        dispatcher: Arc<CountingDispatcher>,
        audit: Arc<CaptureAudit>,
        terminations: Arc<Mutex<Vec<TerminateReason>>>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_grace(Duration::from_millis(500))
        }

        fn with_grace(exit_grace: Duration) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = SupervisorConfig {
                output_dir: dir.path().to_path_buf(),
                exit_grace,
                ..SupervisorConfig::default()
            };
            let dispatcher = Arc::new(CountingDispatcher {
                calls: AtomicUsize::new(0),
            });
            let audit = Arc::new(CaptureAudit::default());
            let supervisor = Supervisor::new(config, dispatcher.clone())
                .with_audit_logger(audit.clone());
            Self {
                supervisor,
                dispatcher,
                audit,
                terminations: Arc::new(Mutex::new(Vec::new())),
                _dir: dir,
            }
        }

        async fn run<F, Fut>(&self, request: ExecutionRequest, script: F) -> ExecutionResult
        where
            F: FnOnce(FakeWorker) -> Fut,
            Fut: std::future::Future<Output = ()> + Send + 'static,
        {
            let (sup_reader, to_supervisor) = tokio::io::duplex(64 * 1024);
            let (sup_writer, from_supervisor) = tokio::io::duplex(64 * 1024);
            let (exit_tx, exit_rx) = oneshot::channel();

            let process = FakeProcess {
                exit_rx: Some(exit_rx),
                exit: None,
                terminations: Arc::clone(&self.terminations),
            };
            let worker = FakeWorker {
                to_supervisor,
                from_supervisor,
                exit_tx: Some(exit_tx),
            };
            let task = tokio::spawn(script(worker));

            let result = self
                .supervisor
                .execute_with_worker(&request, process, sup_reader, sup_writer, Instant::now())
                .await;
            task.abort();
            result
        }

        fn dispatched(&self) -> usize {
            self.dispatcher.calls.load(Ordering::SeqCst)
        }

        fn terminations(&self) -> Vec<TerminateReason> {
            self.terminations.lock().unwrap().clone()
        }

        fn audit_entry(&self) -> AuditEntry {
            self.audit.0.lock().unwrap().last().cloned().expect("audit entry")
        }
    }

    #[tokio::test]
    async fn budget_rejects_the_call_beyond_the_limit() {
        let harness = Harness::new();
        let request = ExecutionRequest {
            max_tool_calls: 2,
            ..ExecutionRequest::new("for (...) await tools.call(...)")
        };

        let result = harness
            .run(request, |mut w| async move {
                let mut stdout = String::new();
                for id in 1..=2 {
                    match w.call(id, "read_file").await {
                        ParentMessage::ToolResult { id: got, result } => {
                            assert_eq!(got, id);
                            let line = format!("{}\n", result.unwrap());
                            w.stdout(&line).await;
                            stdout.push_str(&line);
                        }
                        other => panic!("expected ToolResult, got: {other:?}"),
                    }
                }
                match w.call(3, "read_file").await {
                    ParentMessage::LimitExceeded { id, reason } => {
                        assert_eq!(id, 3);
                        assert!(reason.contains("max 2"), "{reason}");
                    }
                    other => panic!("expected LimitExceeded, got: {other:?}"),
                }
                w.done(&stdout, None).await;
                w.exit(WorkerExit::Code(0));
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::LimitExceeded);
        assert_eq!(result.tool_calls, 2);
        assert_eq!(harness.dispatched(), 2);
        assert_eq!(result.stdout_preview.lines().count(), 2);
        assert!(result.error_message.unwrap().contains("limit"));

        let entry = harness.audit_entry();
        assert_eq!(entry.tool_calls.len(), 3);
        assert_eq!(entry.tool_calls[2].outcome, ToolCallOutcome::LimitExceeded);
    }

    #[tokio::test]
    async fn zero_budget_never_reaches_the_dispatcher() {
        let harness = Harness::new();
        let request = ExecutionRequest {
            max_tool_calls: 0,
            ..ExecutionRequest::new("await tools.x()")
        };

        let result = harness
            .run(request, |mut w| async move {
                assert!(matches!(
                    w.call(1, "x").await,
                    ParentMessage::LimitExceeded { .. }
                ));
                w.done("", Some("LimitExceededError: tool call limit exceeded")).await;
                w.exit(WorkerExit::Code(0));
            })
            .await;

        assert_eq!(harness.dispatched(), 0);
        assert_eq!(result.status, ExecutionStatus::LimitExceeded);
        assert_eq!(
            result.error_message.as_deref(),
            Some("LimitExceededError: tool call limit exceeded")
        );
    }

    #[tokio::test]
    async fn done_then_exit_is_success() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("console.log('hi')"), |mut w| async move {
                w.stdout("hi\n").await;
                w.done("hi\n", None).await;
                drop(w.to_supervisor);
                if let Some(tx) = w.exit_tx.take() {
                    let _ = tx.send(WorkerExit::Code(0));
                }
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout_preview, "hi\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.output_truncated);
        assert!(harness.terminations().is_empty());
    }

    #[tokio::test]
    async fn exit_then_done_is_still_success() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("1"), |mut w| async move {
                w.exit(WorkerExit::Code(0));
                tokio::time::sleep(Duration::from_millis(20)).await;
                w.done("late\n", None).await;
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout_preview, "late\n");
        assert!(harness.terminations().is_empty());
    }

    #[tokio::test]
    async fn script_error_is_reported() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("throw new Error('boom')"), |mut w| async move {
                w.done("", Some("Error: boom")).await;
                w.exit(WorkerExit::Code(0));
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::ScriptError);
        assert_eq!(result.error_message.as_deref(), Some("Error: boom"));
    }

    #[tokio::test]
    async fn crash_keeps_partial_output_on_disk() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("1"), |mut w| async move {
                w.stdout("before crash\n").await;
                w.exit(WorkerExit::Signal(11));
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert_eq!(result.exit_code, None);
        assert!(result.error_message.unwrap().contains("signal 11"));
        assert_eq!(result.stdout_preview, "before crash\n");

        let path = result.full_output_path.expect("spill file");
        let on_disk = std::fs::read_to_string(path).unwrap();
        assert!(on_disk.contains("before crash"));
    }

    #[tokio::test]
    async fn clean_exit_without_done_is_a_crash() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("1"), |mut w| async move {
                drop(w.to_supervisor);
                if let Some(tx) = w.exit_tx.take() {
                    let _ = tx.send(WorkerExit::Code(0));
                }
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert!(result.error_message.unwrap().contains("protocol violation"));
    }

    #[tokio::test]
    async fn timeout_terminates_the_worker() {
        let harness = Harness::new();
        let request = ExecutionRequest {
            timeout_ms: 100,
            ..ExecutionRequest::new("while (true) {}")
        };

        let result = harness
            .run(request, |mut w| async move {
                w.stdout("spinning\n").await;
                w.linger().await;
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(harness.terminations(), vec![TerminateReason::Timeout]);
        assert!(result.duration_ms >= 100);
        assert_eq!(result.stdout_preview, "spinning\n");
    }

    #[tokio::test]
    async fn in_flight_calls_are_cancelled_at_timeout() {
        let harness = Harness::new();
        let request = ExecutionRequest {
            timeout_ms: 100,
            ..ExecutionRequest::new("await tools.hang()")
        };

        let result = harness
            .run(request, |mut w| async move {
                w.send(ChildMessage::ToolCall {
                    id: 1,
                    tool_name: "hang".into(),
                    args: json!({}),
                })
                .await;
                w.linger().await;
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.tool_calls, 1);
        assert_eq!(harness.terminations(), vec![TerminateReason::Timeout]);
        let entry = harness.audit_entry();
        assert_eq!(entry.tool_calls.len(), 1);
        assert_eq!(entry.tool_calls[0].outcome, ToolCallOutcome::Cancelled);
    }

    #[tokio::test]
    async fn stalled_worker_stdin_does_not_block_the_deadline() {
        let harness = Harness::new();
        let request = ExecutionRequest {
            timeout_ms: 100,
            ..ExecutionRequest::new("await tools.bulk()")
        };

        let result = harness
            .run(request, |mut w| async move {
                w.send(ChildMessage::ToolCall {
                    id: 1,
                    tool_name: "bulk".into(),
                    args: json!({}),
                })
                .await;
                // The reply is larger than the pipe and is never read.
                let _held = w;
                std::future::pending::<()>().await;
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.tool_calls, 1);
        assert!(result.duration_ms < 5_000, "took {}ms", result.duration_ms);
        assert_eq!(harness.terminations(), vec![TerminateReason::Timeout]);
    }

    #[tokio::test]
    async fn malformed_frame_terminates_the_worker() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("1"), |mut w| async move {
                let payload = b"not json";
                let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
                frame.extend_from_slice(payload);
                w.to_supervisor.write_all(&frame).await.unwrap();
                w.linger().await;
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Crashed);
        assert!(result.error_message.unwrap().contains("protocol violation"));
        assert_eq!(harness.terminations(), vec![TerminateReason::ProtocolViolation]);
    }

    #[tokio::test]
    async fn tool_errors_reach_the_worker() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("await tools.fail()"), |mut w| async move {
                match w.call(1, "fail").await {
                    ParentMessage::ToolResult { id, result } => {
                        assert_eq!(id, 1);
                        assert!(result.unwrap_err().contains("disk on fire"));
                    }
                    other => panic!("expected ToolResult, got: {other:?}"),
                }
                w.done("", None).await;
                w.exit(WorkerExit::Code(0));
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        let entry = harness.audit_entry();
        assert_eq!(
            entry.tool_calls[0].outcome,
            ToolCallOutcome::Error {
                code: "FAILED".into()
            }
        );
    }

    #[tokio::test]
    async fn duplicate_call_ids_are_ignored() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("1"), |mut w| async move {
                assert!(matches!(w.call(1, "echo").await, ParentMessage::ToolResult { .. }));
                w.send(ChildMessage::ToolCall {
                    id: 1,
                    tool_name: "echo".into(),
                    args: json!({}),
                })
                .await;
                w.done("", None).await;
                w.exit(WorkerExit::Code(0));
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(harness.dispatched(), 1);
        assert_eq!(result.tool_calls, 1);
    }

    #[tokio::test]
    async fn in_flight_calls_are_cancelled_at_settlement() {
        let harness = Harness::new();
        let result = harness
            .run(ExecutionRequest::new("tools.hang(); "), |mut w| async move {
                w.send(ChildMessage::ToolCall {
                    id: 1,
                    tool_name: "hang".into(),
                    args: json!({}),
                })
                .await;
                w.done("", None).await;
                w.exit(WorkerExit::Code(0));
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.tool_calls, 1);
        let entry = harness.audit_entry();
        assert_eq!(entry.tool_calls.len(), 1);
        assert_eq!(entry.tool_calls[0].outcome, ToolCallOutcome::Cancelled);
    }

    #[tokio::test]
    async fn lingering_worker_is_terminated_after_done() {
        let harness = Harness::with_grace(Duration::from_millis(50));
        let result = harness
            .run(ExecutionRequest::new("1"), |mut w| async move {
                w.done("", None).await;
                w.linger().await;
            })
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(harness.terminations(), vec![TerminateReason::Lingering]);
    }

    #[tokio::test]
    async fn invalid_request_fails_before_spawning() {
        let harness = Harness::new();
        let err = harness
            .supervisor
            .execute(ExecutionRequest::new("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ValidationFailed { .. }));
    }

    #[test]
    fn escalation_only_applies_to_completed_scripts() {
        let done = Resolution {
            status: ExecutionStatus::Success,
            error_message: None,
            exit: None,
        };
        assert_eq!(
            escalate(done, Some("limit".into())),
            (ExecutionStatus::LimitExceeded, Some("limit".into()))
        );

        let crashed = Resolution {
            status: ExecutionStatus::Crashed,
            error_message: Some("worker crashed".into()),
            exit: None,
        };
        assert_eq!(
            escalate(crashed, Some("limit".into())),
            (ExecutionStatus::Crashed, Some("worker crashed".into()))
        );
    }
}
