//! Execution Context
//!
//! The `ExecutionContext` is the value the orchestrator threads through every
//! navigation step. Operations in this crate never mutate a caller's context;
//! they take `&ExecutionContext` and hand back an updated copy, which becomes
//! the only source of truth for what is still pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Shared execution state for one routine run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
    /// Process-scoped variables. `variables.errors` holds error records.
    pub variables: BTreeMap<String, Value>,
    pub events: EventBuckets,
    pub parallel_execution: ParallelExecution,
    pub subprocesses: SubprocessBookkeeping,
    /// Passed through unchanged.
    pub gateways: Value,
    /// Passed through unchanged.
    pub compensation: Value,
    pub external: ExternalEvents,
    pub loop_iterations: BTreeMap<String, u32>,
    pub multi_instance_states: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Look up the event subprocess state for `subprocess_id`.
    ///
    /// When several records exist (a completed one followed by nothing else is
    /// the common case) the most recent is returned.
    pub fn event_subprocess_state(&self, subprocess_id: &str) -> Option<&EventSubprocessState> {
        self.subprocesses
            .event_subprocesses
            .iter()
            .rev()
            .find(|s| s.subprocess_id == subprocess_id)
    }

    pub(crate) fn event_subprocess_state_mut(
        &mut self,
        subprocess_id: &str,
    ) -> Option<&mut EventSubprocessState> {
        self.subprocesses
            .event_subprocesses
            .iter_mut()
            .rev()
            .find(|s| s.subprocess_id == subprocess_id)
    }

    /// Error records under `variables.errors`, if that variable is an array.
    pub fn error_records(&self) -> &[Value] {
        match self.variables.get(ERRORS_VARIABLE) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    pub(crate) fn error_records_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self.variables.get_mut(ERRORS_VARIABLE) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }
    }
}

/// Variable that carries error records matched by error triggers.
pub const ERRORS_VARIABLE: &str = "errors";

// ─── Event buckets ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventBuckets {
    /// Ids of event definitions currently being listened for.
    pub active: Vec<String>,
    /// Ids of event definitions waiting on an external party.
    pub pending: Vec<String>,
    pub fired: Vec<FiredEvent>,
    pub timers: Vec<TimerEntry>,
}

/// A scheduled deadline. Compared against a caller-supplied `now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerEntry {
    pub id: String,
    /// Start-event (or subprocess) id the timer belongs to.
    pub event_id: String,
    pub expires_at: DateTime<Utc>,
    pub kind: TimerKind,
}

impl TimerEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    EventSubprocessStart,
    Boundary,
    Intermediate,
}

/// An event that has already fired inside the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiredEvent {
    pub id: String,
    pub event_id: String,
    pub kind: FiredEventKind,
    #[serde(default)]
    pub payload: Value,
    pub fired_at: DateTime<Utc>,
    pub source: String,
    /// Set once an event subprocess has consumed this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_by: Option<String>,
}

impl FiredEvent {
    /// Escalation (or error) code carried in the payload, if any.
    pub fn code(&self) -> Option<&str> {
        self.payload
            .get("code")
            .or_else(|| self.payload.get("escalationCode"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiredEventKind {
    Timer,
    Message,
    Signal,
    Error,
    Escalation,
    Conditional,
    Compensation,
}

// ─── Parallel / subprocess bookkeeping ────────────────────────

/// Fork/join bookkeeping. Opaque to this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelExecution {
    pub active_branches: Vec<Value>,
    pub completed_branches: Vec<Value>,
    pub join_points: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubprocessBookkeeping {
    pub active_subprocesses: Vec<String>,
    pub completed_subprocesses: Vec<String>,
    /// Authoritative list of event subprocess instances.
    pub event_subprocesses: Vec<EventSubprocessState>,
}

// ─── External inbound events ──────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalEvents {
    pub message_events: Vec<MessageEvent>,
    pub signal_events: Vec<SignalEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: String,
    pub message_ref: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub id: String,
    pub signal_ref: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

// ─── Event subprocess state ───────────────────────────────────

/// Lifecycle of one event subprocess instance.
///
/// `monitoring -> active -> completed`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubprocessStatus {
    Monitoring,
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubprocessState {
    pub id: String,
    pub subprocess_id: String,
    /// Start-event id whose trigger activates this instance.
    pub trigger_event: String,
    pub interrupting: bool,
    pub status: SubprocessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ─── Locations ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    #[default]
    Node,
    SubprocessContext,
}

/// A pointer into the process graph for one navigation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbstractLocation {
    pub node_id: String,
    pub routine_id: String,
    #[serde(rename = "type", default)]
    pub location_type: LocationType,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Metadata key naming the enclosing event subprocess.
pub const SUBPROCESS_ID_KEY: &str = "subprocessId";

impl AbstractLocation {
    /// A plain location in the main flow.
    pub fn node(routine_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            routine_id: routine_id.into(),
            location_type: LocationType::Node,
            metadata: Map::new(),
        }
    }

    /// A location inside an event subprocess.
    pub fn in_subprocess(
        routine_id: impl Into<String>,
        node_id: impl Into<String>,
        subprocess_id: &str,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert(
            SUBPROCESS_ID_KEY.to_string(),
            Value::String(subprocess_id.to_string()),
        );
        Self {
            node_id: node_id.into(),
            routine_id: routine_id.into(),
            location_type: LocationType::SubprocessContext,
            metadata,
        }
    }

    /// The enclosing event subprocess, for `subprocess_context` locations.
    pub fn subprocess_id(&self) -> Option<&str> {
        match self.location_type {
            LocationType::SubprocessContext => self
                .metadata
                .get(SUBPROCESS_ID_KEY)
                .and_then(Value::as_str),
            LocationType::Node => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_uses_wire_field_names() {
        let mut ctx = ExecutionContext::new();
        ctx.external.message_events.push(MessageEvent {
            id: "m1".to_string(),
            message_ref: "OrderCancelled".to_string(),
            payload: json!({"orderId": 7}),
            received_at: None,
        });
        let v = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            v["external"]["messageEvents"][0]["messageRef"],
            "OrderCancelled"
        );
        assert!(v["subprocesses"]["eventSubprocesses"].is_array());
        assert!(v["parallelExecution"]["joinPoints"].is_object());
    }

    #[test]
    fn test_partial_context_deserializes_with_defaults() {
        let ctx: ExecutionContext = serde_json::from_value(json!({
            "variables": {"approved": true},
            "events": {"timers": [{
                "id": "t1",
                "eventId": "TimerStart",
                "expiresAt": "2024-01-01T00:00:00Z",
                "kind": "event_subprocess_start"
            }]}
        }))
        .unwrap();
        assert_eq!(ctx.events.timers.len(), 1);
        assert!(ctx.external.message_events.is_empty());
        assert_eq!(ctx.variables["approved"], json!(true));
    }

    #[test]
    fn test_subprocess_location_round_trip() {
        let loc = AbstractLocation::in_subprocess("routine-1", "TimerStart", "TimeoutHandler");
        let v = serde_json::to_value(&loc).unwrap();
        assert_eq!(v["type"], "subprocess_context");
        assert_eq!(v["metadata"]["subprocessId"], "TimeoutHandler");
        assert_eq!(loc.subprocess_id(), Some("TimeoutHandler"));
        assert_eq!(AbstractLocation::node("r", "task").subprocess_id(), None);
    }

    #[test]
    fn test_error_records_ignores_non_array() {
        let ctx = ExecutionContext::new().with_variable("errors", json!("oops"));
        assert!(ctx.error_records().is_empty());
    }
}
