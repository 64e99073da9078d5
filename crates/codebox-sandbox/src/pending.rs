//! Registry of tool calls awaiting a reply.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::Value;

use crate::ipc::ProtocolViolation;

/// A dispatched tool call that has not been answered yet.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Id assigned by the worker.
    pub id: u64,
    /// Tool identifier.
    pub tool_name: String,
    /// Arguments as sent by the script.
    pub args: Value,
    /// When the call was dispatched.
    pub created_at: Instant,
}

impl PendingCall {
    /// A call dispatched now.
    pub fn new(id: u64, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            tool_name: tool_name.into(),
            args,
            created_at: Instant::now(),
        }
    }
}

/// Pending calls keyed by id. Each entry is settled exactly once; ids are
/// never reused within an execution, even after settlement.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<u64, PendingCall>,
    seen: HashSet<u64>,
}

impl PendingCalls {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` was used. Fails if it was used before.
    pub fn observe(&mut self, id: u64) -> Result<(), ProtocolViolation> {
        if self.seen.insert(id) {
            Ok(())
        } else {
            Err(ProtocolViolation::DuplicateCallId(id))
        }
    }

    /// Track a dispatched call until it is settled.
    pub fn insert(&mut self, call: PendingCall) {
        self.seen.insert(call.id);
        self.calls.insert(call.id, call);
    }

    /// Remove and return the call for `id`. `None` if unknown or already settled.
    pub fn settle(&mut self, id: u64) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Settle every outstanding call as cancelled, oldest first.
    pub fn cancel_all(&mut self) -> Vec<PendingCall> {
        let mut cancelled: Vec<PendingCall> = self.calls.drain().map(|(_, call)| call).collect();
        cancelled.sort_by_key(|call| call.created_at);
        cancelled
    }

    /// Whether every call has been settled.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settles_exactly_once() {
        let mut pending = PendingCalls::new();
        pending.observe(1).unwrap();
        pending.insert(PendingCall::new(1, "read_file", json!({"path": "a"})));
        assert!(!pending.is_empty());

        let call = pending.settle(1).expect("pending call");
        assert_eq!(call.tool_name, "read_file");
        assert!(pending.settle(1).is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut pending = PendingCalls::new();
        pending.observe(7).unwrap();
        pending.insert(PendingCall::new(7, "t", json!(null)));
        pending.settle(7);

        assert_eq!(
            pending.observe(7),
            Err(ProtocolViolation::DuplicateCallId(7))
        );
    }

    #[test]
    fn cancel_all_drains_everything() {
        let mut pending = PendingCalls::new();
        for id in 1..=3 {
            pending.observe(id).unwrap();
            pending.insert(PendingCall::new(id, "t", json!({})));
        }
        let cancelled = pending.cancel_all();
        assert_eq!(cancelled.len(), 3);
        assert!(pending.is_empty());
        assert!(pending.cancel_all().is_empty());
    }
}
