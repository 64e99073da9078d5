//! Worker-side script execution.
//!
//! Each execution gets a brand new deno_core `JsRuntime` with a V8 heap
//! ceiling. V8 isolates are `!Send`, so callers run [`run_script`] on a
//! dedicated thread with its own single-threaded tokio runtime. Tool calls
//! leave the isolate through a [`ToolProxy`]; console writes go to a bounded
//! [`ConsoleCapture`](crate::ops::ConsoleCapture).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::SandboxError;
use crate::ipc::WorkerConfig;
use crate::ops::{codebox_ext, ConsoleCapture, ScriptCompletion};
use crate::output::{CapturedOutput, OutputChunk};

/// Exit code of a worker that ran out of memory: the isolate hit its heap
/// limit, or the process limit refused a backing store.
pub const MEMORY_LIMIT_EXIT_CODE: i32 = 86;

/// Message of the `RangeError` V8 throws when an `ArrayBuffer` backing store
/// cannot be allocated. Backing stores live outside the V8 heap, so the
/// process data limit set at spawn is what refuses them.
const BACKING_STORE_REFUSED: &str = "RangeError: Array buffer allocation failed";

/// Why a proxied tool call did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallRejection {
    /// The tool ran and failed. Surfaces as `ToolError` in the script.
    #[error("{0}")]
    Tool(String),
    /// The call budget was exhausted; the tool was not run.
    /// Surfaces as `LimitExceededError`.
    #[error("{0}")]
    LimitExceeded(String),
    /// No reply will come. Surfaces as `CancelledError`.
    #[error("{0}")]
    Cancelled(String),
}

/// Where the isolate's tool calls go.
#[async_trait::async_trait]
pub trait ToolProxy: Send + Sync {
    /// Run `tool_name` with `args` on the script's behalf.
    async fn call(&self, tool_name: &str, args: Value) -> Result<Value, CallRejection>;
}

/// How a script run ended inside the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The script returned or threw.
    Completed {
        /// Captured console output.
        output: CapturedOutput,
        /// `"<name>: <message>"` of the uncaught error, if any.
        error: Option<String>,
    },
    /// The isolate was stopped at its heap limit, or an allocation refused by
    /// the process memory limit escaped the script.
    MemoryLimitExceeded {
        /// Output captured before the stop.
        output: CapturedOutput,
    },
}

const BOOTSTRAP: &str = r#"((ops) => {
    const format = (args) => args.map((value) => {
        if (typeof value === "string") return value;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    }).join(" ") + "\n";

    const stdout = (...args) => ops.op_codebox_stdout(format(args));
    const stderr = (...args) => ops.op_codebox_stderr(format(args));
    globalThis.console = Object.freeze({
        log: stdout, info: stdout, debug: stdout,
        warn: stderr, error: stderr,
    });

    class ToolError extends Error {
        constructor(message) { super(message); this.name = "ToolError"; }
    }
    class LimitExceededError extends Error {
        constructor(message) { super(message); this.name = "LimitExceededError"; }
    }
    class CancelledError extends Error {
        constructor(message) { super(message); this.name = "CancelledError"; }
    }
    for (const cls of [ToolError, LimitExceededError, CancelledError]) {
        Object.defineProperty(globalThis, cls.name, {
            value: cls, writable: false, configurable: false, enumerable: false,
        });
    }

    const callToolOp = ops.op_codebox_call_tool;
    const call = async (name, args) => {
        if (typeof name !== "string" || name.length === 0) {
            throw new TypeError("tool name must be a non-empty string");
        }
        const argsJson = JSON.stringify(args === undefined ? {} : args) ?? "null";
        const reply = JSON.parse(await callToolOp(name, argsJson));
        if ("ok" in reply) return reply.ok;
        if ("limit_exceeded" in reply) throw new LimitExceededError(reply.limit_exceeded);
        if ("cancelled" in reply) throw new CancelledError(reply.cancelled);
        throw new ToolError(reply.error);
    };

    const base = Object.freeze({ call });
    const tools = new Proxy(base, {
        get(target, prop) {
            if (prop in target) return target[prop];
            if (typeof prop !== "string" || prop === "then") return undefined;
            return (args) => call(prop, args);
        },
        set() { return false; },
        defineProperty() { return false; },
        deleteProperty() { return false; },
        setPrototypeOf() { return false; },
    });
    Object.defineProperty(globalThis, "tools", {
        value: tools, writable: false, configurable: false, enumerable: true,
    });

    const finishOp = ops.op_codebox_finish;
    Object.defineProperty(globalThis, "__codebox_finish", {
        value: (json) => finishOp(json), writable: false, configurable: false, enumerable: false,
    });

    delete globalThis.Deno;

    delete globalThis.eval;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
})(Deno.core.ops);"#;

/// Wrap `code` as the body of an async function whose completion, normal or
/// thrown, is reported through `__codebox_finish`.
fn wrap_script(code: &str) -> String {
    format!(
        r#"(async () => {{
    try {{
        await (async () => {{
{code}
        }})();
        __codebox_finish(JSON.stringify({{ ok: true }}));
    }} catch (e) {{
        let message;
        try {{
            message = (e instanceof Error) ? `${{e.name}}: ${{e.message}}` : String(e);
        }} catch (_) {{
            message = "uncaught exception";
        }}
        __codebox_finish(JSON.stringify({{ error: message }}));
    }}
}})();
"#
    )
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution at the heap limit and grants 1MB so the termination
/// can propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_script`,
    // which outlives the runtime (the runtime is dropped first).
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Create a fresh runtime with the codebox extension, heap limit and state.
fn create_runtime(
    config: &WorkerConfig,
    proxy: Arc<dyn ToolProxy>,
    forward: Option<mpsc::UnboundedSender<OutputChunk>>,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![codebox_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(proxy);
        state.put(ConsoleCapture::new(config.max_output_bytes, forward));
    }
    runtime
}

/// Run `code` to completion on the current thread.
///
/// Must be called from a dedicated thread, not a multi-threaded tokio
/// runtime. `forward` receives each console write as it happens.
pub async fn run_script(
    code: &str,
    config: &WorkerConfig,
    proxy: Arc<dyn ToolProxy>,
    forward: Option<mpsc::UnboundedSender<OutputChunk>>,
) -> Result<ScriptOutcome, SandboxError> {
    let mut runtime = create_runtime(config, proxy, forward);

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    runtime
        .execute_script("[codebox:bootstrap]", BOOTSTRAP)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    let exec_error = match runtime.execute_script("[codebox:script]", wrap_script(code)) {
        Ok(_) => runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .err()
            .map(|e| e.to_string()),
        Err(e) => Some(e.to_string()),
    };

    let (output, completion) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let output = state.borrow::<ConsoleCapture>().snapshot();
        let completion = state.try_take::<ScriptCompletion>();
        (output, completion)
    };

    drop(runtime);
    let heap_exhausted = heap_state.triggered.load(Ordering::SeqCst);
    drop(heap_state);

    if heap_exhausted {
        return Ok(ScriptOutcome::MemoryLimitExceeded { output });
    }

    let error = match completion {
        Some(ScriptCompletion(json)) => {
            let envelope: Value = serde_json::from_str(&json)?;
            envelope
                .get("error")
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
        }
        None => Some(exec_error.unwrap_or_else(|| {
            "script never settled: a promise it awaited can no longer resolve".to_string()
        })),
    };

    if error.as_deref().is_some_and(is_allocation_failure) {
        return Ok(ScriptOutcome::MemoryLimitExceeded { output });
    }

    Ok(ScriptOutcome::Completed { output, error })
}

fn is_allocation_failure(error: &str) -> bool {
    error.starts_with(BACKING_STORE_REFUSED)
}
