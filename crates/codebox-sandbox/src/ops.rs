//! deno_core ops backing the worker's execution context.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments, so `missing_docs` is
//! suppressed here.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use serde_json::json;
use tokio::sync::mpsc;

use crate::output::{CapturedOutput, OutputBuffer, OutputChunk, OutputStream};
use crate::runtime::{CallRejection, ToolProxy};

/// Console capture held in OpState: the bounded buffer plus an optional
/// forwarder streaming each write to the supervisor.
pub struct ConsoleCapture {
    buffer: OutputBuffer,
    forward: Option<mpsc::UnboundedSender<OutputChunk>>,
}

impl ConsoleCapture {
    /// An empty capture bounded by `max_bytes`.
    pub fn new(max_bytes: usize, forward: Option<mpsc::UnboundedSender<OutputChunk>>) -> Self {
        Self {
            buffer: OutputBuffer::new(max_bytes),
            forward,
        }
    }

    /// Account `text` against the buffer, then forward it.
    pub fn write(&mut self, stream: OutputStream, text: &str) {
        self.buffer.push(stream, text);

        let Some(tx) = &self.forward else {
            return;
        };
        // Anything before the last `max_bytes` would be evicted on arrival.
        let max = self.buffer.max_bytes();
        let start = (text.len().saturating_sub(max)..=text.len())
            .find(|&i| text.is_char_boundary(i))
            .unwrap_or(text.len());
        let kept = &text[start..];
        if kept.is_empty() {
            return;
        }
        let chunk = OutputChunk {
            stream,
            text: kept.to_string(),
        };
        if tx.send(chunk).is_err() {
            self.forward = None;
        }
    }

    /// Rendered output so far.
    pub fn snapshot(&self) -> CapturedOutput {
        self.buffer.snapshot()
    }
}

/// Completion envelope written by the script wrapper.
pub struct ScriptCompletion(pub String);

/// `console.log` / `info` / `debug`.
#[op2(fast)]
pub fn op_codebox_stdout(state: &mut OpState, #[string] text: &str) {
    state
        .borrow_mut::<ConsoleCapture>()
        .write(OutputStream::Stdout, text);
}

/// `console.warn` / `error`.
#[op2(fast)]
pub fn op_codebox_stderr(state: &mut OpState, #[string] text: &str) {
    state
        .borrow_mut::<ConsoleCapture>()
        .write(OutputStream::Stderr, text);
}

/// Store the completion envelope. Only the first call counts.
#[op2(fast)]
pub fn op_codebox_finish(state: &mut OpState, #[string] json: &str) {
    if !state.has::<ScriptCompletion>() {
        state.put(ScriptCompletion(json.to_string()));
    }
}

/// Proxy a tool call through the [`ToolProxy`] in OpState.
///
/// Resolves to a JSON envelope: `{"ok": value}`, `{"error": msg}`,
/// `{"limit_exceeded": msg}` or `{"cancelled": msg}`. The bootstrap turns the
/// non-`ok` variants into typed exceptions.
#[op2(async)]
#[string]
pub async fn op_codebox_call_tool(
    op_state: Rc<RefCell<OpState>>,
    #[string] tool_name: String,
    #[string] args_json: String,
) -> String {
    let proxy = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn ToolProxy>>().clone()
    };

    let args: serde_json::Value = match serde_json::from_str(&args_json) {
        Ok(args) => args,
        Err(e) => return json!({ "error": format!("invalid JSON args: {e}") }).to_string(),
    };

    tracing::debug!(tool = %tool_name, args_len = args_json.len(), "tool call proxied");

    let envelope = match proxy.call(&tool_name, args).await {
        Ok(value) => json!({ "ok": value }),
        Err(CallRejection::Tool(message)) => json!({ "error": message }),
        Err(CallRejection::LimitExceeded(message)) => json!({ "limit_exceeded": message }),
        Err(CallRejection::Cancelled(message)) => json!({ "cancelled": message }),
    };
    envelope.to_string()
}

deno_core::extension!(
    codebox_ext,
    ops = [
        op_codebox_stdout,
        op_codebox_stderr,
        op_codebox_finish,
        op_codebox_call_tool
    ],
);
