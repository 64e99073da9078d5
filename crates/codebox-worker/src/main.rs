//! codebox worker: the isolated child process that runs one script.
//!
//! Spawned by the supervisor in `codebox-sandbox`. Reads a single `execute`
//! message from stdin, runs the script in a fresh V8 isolate, streams console
//! output back, proxies tool calls to the parent, and finishes with `done`.
//!
//! **Security**: the process starts with a cleared environment and has no
//! capability besides its stdin/stdout pipe. Every effect goes through the
//! parent as a tool call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use codebox_sandbox::ipc::{
    read_message, read_message_with_limit, write_message, ChildMessage, ParentMessage,
};
use codebox_sandbox::output::OutputChunk;
use codebox_sandbox::runtime::{
    run_script, CallRejection, ScriptOutcome, ToolProxy, MEMORY_LIMIT_EXIT_CODE,
};
use serde_json::Value;
use tokio::io::{self, BufReader, Stdout};
use tokio::sync::{mpsc, oneshot};

type Reply = Result<Value, CallRejection>;

/// Events the IPC loop writes to the parent.
enum Outbound {
    ToolCall {
        id: u64,
        tool_name: String,
        args: Value,
        reply: oneshot::Sender<Reply>,
    },
    Finished(Result<ScriptOutcome, String>),
}

/// Proxies the isolate's tool calls through the IPC loop.
///
/// The reply channel travels with the call, so the waiter is registered
/// before the request can reach the parent.
struct IpcToolProxy {
    tx: mpsc::UnboundedSender<Outbound>,
    next_id: AtomicU64,
}

#[async_trait::async_trait]
impl ToolProxy for IpcToolProxy {
    async fn call(&self, tool_name: &str, args: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Outbound::ToolCall {
                id,
                tool_name: tool_name.to_string(),
                args,
                reply,
            })
            .map_err(|_| CallRejection::Cancelled("worker IPC loop has stopped".into()))?;

        rx.await.map_err(|_| {
            CallRejection::Cancelled("execution settled before the tool replied".into())
        })?
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // The supervisor already spawns with env_clear; make sure nothing leaked in.
    let env_keys: Vec<_> = std::env::vars_os().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending execute")?;

    let (code, config) = match msg {
        ParentMessage::Execute { code, config } => (code, config),
        other => anyhow::bail!("expected execute message, got: {:?}", other),
    };
    let max_ipc_size = config.max_ipc_message_size;

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<OutputChunk>();

    let proxy: Arc<dyn ToolProxy> = Arc::new(IpcToolProxy {
        tx: tx.clone(),
        next_id: AtomicU64::new(1),
    });

    // V8 isolates are !Send: the script gets its own thread and runtime.
    let exec_tx = tx;
    let exec_handle = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = exec_tx.send(Outbound::Finished(Err(format!(
                    "failed to create tokio runtime: {e}"
                ))));
                return;
            }
        };

        let result = rt
            .block_on(run_script(&code, &config, proxy, Some(output_tx)))
            .map_err(|e| e.to_string());
        let _ = exec_tx.send(Outbound::Finished(result));
    });

    // Parent replies are read on their own task; a frame read must not be
    // abandoned halfway when another branch of the loop wins.
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let next =
                read_message_with_limit::<ParentMessage, _>(&mut stdin, max_ipc_size).await;
            let stop = !matches!(next, Ok(Some(_)));
            if inbound_tx.send(next).is_err() || stop {
                break;
            }
        }
    });

    let mut waiters: HashMap<u64, oneshot::Sender<Reply>> = HashMap::new();
    let mut outputs_open = true;

    let outcome = loop {
        tokio::select! {
            biased;

            chunk = output_rx.recv(), if outputs_open => match chunk {
                Some(chunk) => send_output(&mut stdout, chunk).await?,
                None => outputs_open = false,
            },

            event = rx.recv() => match event {
                Some(Outbound::ToolCall { id, tool_name, args, reply }) => {
                    waiters.insert(id, reply);
                    let msg = ChildMessage::ToolCall { id, tool_name, args };
                    write_message(&mut stdout, &msg)
                        .await
                        .context("failed to write tool call to parent")?;
                }
                Some(Outbound::Finished(outcome)) => break outcome,
                None => break Err("script thread exited without a result".to_string()),
            },

            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(Some(msg))) => {
                    on_parent_message(msg, &mut waiters, &mut stdout).await?
                }
                Some(Ok(None)) | None => {
                    // The parent hung up; nobody is left to report to.
                    return Ok(());
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "failed to read from parent");
                    return Ok(());
                }
            },
        }
    };

    // Output written before completion is already queued; flush it first.
    while let Ok(chunk) = output_rx.try_recv() {
        send_output(&mut stdout, chunk).await?;
    }
    drop(waiters);
    let _ = exec_handle.join();

    let done = match outcome {
        Ok(ScriptOutcome::Completed { output, error }) => ChildMessage::Done {
            stdout: output.stdout,
            stderr: output.stderr,
            error,
            truncated: output.truncated,
        },
        Ok(ScriptOutcome::MemoryLimitExceeded { .. }) => {
            tracing::warn!("script exceeded its memory limit");
            std::process::exit(MEMORY_LIMIT_EXIT_CODE);
        }
        Err(error) => ChildMessage::Done {
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
            truncated: false,
        },
    };
    write_message(&mut stdout, &done)
        .await
        .context("failed to write done to parent")?;

    Ok(())
}

async fn send_output(stdout: &mut Stdout, chunk: OutputChunk) -> Result<()> {
    let msg = ChildMessage::Output {
        stream: chunk.stream,
        text: chunk.text,
    };
    write_message(stdout, &msg)
        .await
        .context("failed to write output to parent")
}

async fn on_parent_message(
    msg: ParentMessage,
    waiters: &mut HashMap<u64, oneshot::Sender<Reply>>,
    stdout: &mut Stdout,
) -> Result<()> {
    let (id, reply) = match msg {
        ParentMessage::ToolResult { id, result } => (id, result.map_err(CallRejection::Tool)),
        ParentMessage::LimitExceeded { id, reason } => {
            (id, Err(CallRejection::LimitExceeded(reason)))
        }
        ParentMessage::Execute { .. } => {
            tracing::warn!("ignoring second execute message");
            return Ok(());
        }
    };

    match waiters.remove(&id) {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => {
            tracing::warn!(id, "reply for unknown tool call");
            let log = ChildMessage::Log {
                message: format!("reply for unknown tool call id {id} ignored"),
            };
            write_message(stdout, &log)
                .await
                .context("failed to write log to parent")?;
        }
    }
    Ok(())
}
