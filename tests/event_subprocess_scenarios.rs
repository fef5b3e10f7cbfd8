//! Event subprocess scenarios
//!
//! End-to-end passes of the monitor against a loaded process model:
//! 1. Expired timer starts an interrupting subprocess
//! 2. Inbound message starts a non-interrupting subprocess and is consumed
//! 3. Simultaneous triggers in one pass
//! 4. Full lifecycle: monitoring -> active -> completed
//! 5. Conditional trigger driven by process variables

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tierflow::context::{MessageEvent, TimerEntry, TimerKind};
use tierflow::{
    AbstractLocation, EngineError, EventSubprocessMonitor, ExecutionContext, ProcessModel,
    SubprocessStatus, TriggerKind,
};

const CLAIMS_PROCESS: &str = r#"
id: claims
name: Insurance claim handling
nodes:
  - { kind: StartEvent, id: start }
  - { kind: Task, id: assess, task_type: llm }
  - { kind: ExclusiveGateway, id: route }
  - { kind: Task, id: payout, task_type: tool }
  - { kind: Task, id: deny, task_type: tool }
  - { kind: EndEvent, id: end }
flows:
  - { from: start, to: assess }
  - { from: assess, to: route }
  - { id: approve, from: route, to: payout, condition: "assessment.score >= 70" }
  - { id: otherwise, from: route, to: deny, is_default: true }
  - { from: payout, to: end }
  - { from: deny, to: end }
event_subprocesses:
  - id: SlaBreach
    isInterrupting: true
    nodes:
      - kind: StartEvent
        id: TimerStart
        trigger: { type: timer, duration: PT2H }
      - { kind: Task, id: escalate_to_human }
      - { kind: EndEvent, id: SlaEnd }
    flows:
      - { from: TimerStart, to: escalate_to_human }
      - { from: escalate_to_human, to: SlaEnd }
  - id: CustomerUpdate
    cancelActivity: false
    nodes:
      - kind: StartEvent
        id: UpdateStart
        trigger: { type: message, messageRef: ClaimUpdated }
      - { kind: Task, id: merge_update }
      - { kind: EndEvent, id: UpdateEnd }
    flows:
      - { from: UpdateStart, to: merge_update }
      - { from: merge_update, to: UpdateEnd }
  - id: FraudWatch
    cancelActivity: false
    nodes:
      - kind: StartEvent
        id: FraudStart
        trigger: { type: conditional, condition: "risk.flagged == true and risk.score > 80" }
      - { kind: EndEvent, id: FraudEnd }
    flows:
      - { from: FraudStart, to: FraudEnd }
"#;

fn model() -> ProcessModel {
    ProcessModel::from_yaml_str(CLAIMS_PROCESS).expect("claims process should load")
}

fn opened_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
}

fn at(node: &str) -> AbstractLocation {
    AbstractLocation::node("claims-routine", node)
}

fn claim_update(id: &str) -> MessageEvent {
    MessageEvent {
        id: id.to_string(),
        message_ref: "ClaimUpdated".to_string(),
        payload: json!({"field": "address"}),
        received_at: Some(opened_at()),
    }
}

#[test]
fn test_expired_timer_interrupts_main_flow() {
    let model = model();
    let monitor = EventSubprocessMonitor::new();
    let mut ctx = ExecutionContext::new();
    ctx.events.timers.push(TimerEntry {
        id: "sla-timer".to_string(),
        event_id: "TimerStart".to_string(),
        expires_at: opened_at() - Duration::minutes(1),
        kind: TimerKind::EventSubprocessStart,
    });

    let result = monitor
        .check_event_subprocesses(&model, &at("assess"), &ctx, opened_at())
        .unwrap();

    assert_eq!(result.next_locations.len(), 1, "one location expected");
    assert_eq!(result.next_locations[0].node_id, "TimerStart");
    assert_eq!(result.next_locations[0].subprocess_id(), Some("SlaBreach"));
    assert_eq!(result.subprocess_activations.len(), 1);
    assert_eq!(result.subprocess_activations[0].subprocess_id, "SlaBreach");
    assert!(result.subprocess_activations[0].interrupting);
    assert!(result.should_interrupt_main_process);
    assert!(
        result.updated_context.events.timers.is_empty(),
        "fired timer must be consumed"
    );
}

#[test]
fn test_message_runs_alongside_main_flow() {
    let model = model();
    let monitor = EventSubprocessMonitor::new();
    let mut ctx = ExecutionContext::new();
    ctx.external.message_events.push(claim_update("m-1"));

    let result = monitor
        .check_event_subprocesses(&model, &at("assess"), &ctx, opened_at())
        .unwrap();

    assert_eq!(result.next_locations.len(), 1);
    assert_eq!(result.next_locations[0].node_id, "UpdateStart");
    assert!(!result.subprocess_activations[0].interrupting);
    assert_eq!(result.subprocess_activations[0].event_type, TriggerKind::Message);
    assert!(!result.should_interrupt_main_process);
    assert!(result.updated_context.external.message_events.is_empty());

    // Wire names stay stable.
    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["shouldInterruptMainProcess"], json!(false));
    assert_eq!(wire["subprocessActivations"][0]["eventType"], json!("message"));
    assert_eq!(wire["nextLocations"][0]["type"], json!("subprocess_context"));
    assert_eq!(
        wire["nextLocations"][0]["metadata"]["subprocessId"],
        json!("CustomerUpdate")
    );
}

#[test]
fn test_simultaneous_triggers_each_activate_once() {
    let model = model();
    let monitor = EventSubprocessMonitor::new();
    let mut ctx =
        monitor.initialize_monitoring(&model, None, &ExecutionContext::new(), opened_at());
    ctx.external.message_events.push(claim_update("m-1"));
    ctx.external.message_events.push(claim_update("m-2"));

    let deadline_passed = opened_at() + Duration::hours(3);
    let result = monitor
        .check_event_subprocesses(&model, &at("assess"), &ctx, deadline_passed)
        .unwrap();

    let started: Vec<&str> = result
        .subprocess_activations
        .iter()
        .map(|a| a.subprocess_id.as_str())
        .collect();
    assert_eq!(started, vec!["SlaBreach", "CustomerUpdate"]);
    assert!(result.should_interrupt_main_process);
    // One message consumed, the second still pending.
    assert_eq!(result.updated_context.external.message_events.len(), 1);
    assert_eq!(result.updated_context.external.message_events[0].id, "m-2");

    // The next pass must not restart either subprocess.
    let again = monitor
        .check_event_subprocesses(&model, &at("assess"), &result.updated_context, deadline_passed)
        .unwrap();
    assert!(again.subprocess_activations.is_empty());
    assert_eq!(again.updated_context.external.message_events.len(), 1);
}

#[test]
fn test_full_subprocess_lifecycle() {
    let model = model();
    let monitor = EventSubprocessMonitor::new();
    let mut ctx =
        monitor.initialize_monitoring(&model, None, &ExecutionContext::new(), opened_at());
    assert_eq!(
        ctx.event_subprocess_state("CustomerUpdate").unwrap().status,
        SubprocessStatus::Monitoring
    );
    ctx.external.message_events.push(claim_update("m-1"));

    let mut result = monitor
        .check_event_subprocesses(&model, &at("assess"), &ctx, opened_at())
        .unwrap();
    let mut location = result.next_locations.remove(0);
    let mut ctx = result.updated_context;
    let mut visited = vec![location.node_id.clone()];

    // Drive the subprocess through its own nodes until nothing is left.
    for step in 1..=5 {
        let now = opened_at() + Duration::minutes(step);
        let pass = monitor
            .check_event_subprocesses(&model, &location, &ctx, now)
            .unwrap();
        ctx = pass.updated_context;
        match pass.next_locations.into_iter().next() {
            Some(next) => {
                visited.push(next.node_id.clone());
                location = next;
            }
            None => break,
        }
    }

    assert_eq!(visited, vec!["UpdateStart", "merge_update", "UpdateEnd"]);
    let state = ctx.event_subprocess_state("CustomerUpdate").unwrap();
    assert_eq!(state.status, SubprocessStatus::Completed);
    assert!(state.completed_at.is_some());
    assert_eq!(ctx.subprocesses.completed_subprocesses, vec!["CustomerUpdate"]);

    let summary = monitor.summary(&ctx);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.monitoring, 2);
}

#[test]
fn test_conditional_trigger_reads_variables() {
    let model = model();
    let monitor = EventSubprocessMonitor::new();
    let calm = ExecutionContext::new().with_variable("risk", json!({"flagged": true, "score": 40}));
    let result = monitor
        .check_event_subprocesses(&model, &at("assess"), &calm, opened_at())
        .unwrap();
    assert!(result.subprocess_activations.is_empty());

    let alarming =
        ExecutionContext::new().with_variable("risk", json!({"flagged": true, "score": 95}));
    let result = monitor
        .check_event_subprocesses(&model, &at("assess"), &alarming, opened_at())
        .unwrap();
    assert_eq!(result.subprocess_activations.len(), 1);
    assert_eq!(
        result.subprocess_activations[0].event_type,
        TriggerKind::Conditional
    );
    assert!(!result.should_interrupt_main_process);
}

#[test]
fn test_main_flow_traversal_follows_conditions() {
    let model = model();
    let high = ExecutionContext::new().with_variable("assessment", json!({"score": 88}));
    let next: Vec<&str> = model
        .next_nodes("route", &high.variables)
        .unwrap()
        .iter()
        .map(|n| n.id.as_str())
        .collect();
    assert_eq!(next, vec!["payout"]);

    let unknown = ExecutionContext::new();
    let next = model.next_nodes("route", &unknown.variables).unwrap();
    assert_eq!(next[0].id, "deny");
}

#[test]
fn test_unknown_subprocess_operations_fail() {
    let model = model();
    let monitor = EventSubprocessMonitor::new();
    let ctx = ExecutionContext::new();

    let err = monitor
        .complete_subprocess("SlaBreach", &ctx, opened_at())
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
    assert!(err.to_string().contains("SlaBreach"));

    let stray = AbstractLocation::in_subprocess("claims-routine", "X", "Ghost");
    let err = monitor
        .check_event_subprocesses(&model, &stray, &ctx, opened_at())
        .unwrap_err();
    assert!(err.to_string().contains("Ghost"));

    let started = monitor
        .activate_subprocess(&model, "SlaBreach", "claims-routine", &ctx, opened_at(), Value::Null)
        .unwrap();
    let again = monitor
        .activate_subprocess(
            &model,
            "SlaBreach",
            "claims-routine",
            &started.updated_context,
            opened_at(),
            Value::Null,
        )
        .unwrap();
    assert!(again.next_locations.is_empty(), "no reactivation");
}
