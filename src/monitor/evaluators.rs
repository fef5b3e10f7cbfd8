//! Trigger evaluators
//!
//! One evaluator per `TriggerKind`, registered in a `TriggerRegistry`.
//! Evaluators only look: they report what matched and how to consume it,
//! and the monitor applies the consumption to its working copy of the
//! context before the next subprocess is evaluated.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::context::{ExecutionContext, FiredEventKind};
use crate::model::{EventSubprocessDef, TriggerDefinition, TriggerKind};

/// Everything an evaluator may look at.
pub struct TriggerInput<'a> {
    pub context: &'a ExecutionContext,
    pub subprocess: &'a EventSubprocessDef,
    pub now: DateTime<Utc>,
}

/// A satisfied trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    pub kind: TriggerKind,
    pub consumed: ConsumedTrigger,
    /// Handed to the subprocess through its start location's metadata.
    pub payload: Value,
}

/// Which context entry a match consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumedTrigger {
    Timer { timer_id: String },
    Message { event_id: String },
    Signal { event_id: String },
    /// Position in `variables.errors`.
    Error { index: usize },
    Escalation { fired_id: String },
    /// Satisfied condition; the state transition itself prevents re-firing.
    Condition,
}

impl ConsumedTrigger {
    /// Remove or mark the trigger so no later evaluation can see it again.
    pub fn consume(&self, ctx: &mut ExecutionContext, subprocess_id: &str) {
        match self {
            ConsumedTrigger::Timer { timer_id } => {
                ctx.events.timers.retain(|t| &t.id != timer_id);
            }
            ConsumedTrigger::Message { event_id } => {
                ctx.external.message_events.retain(|m| &m.id != event_id);
            }
            ConsumedTrigger::Signal { event_id } => {
                ctx.external.signal_events.retain(|s| &s.id != event_id);
            }
            ConsumedTrigger::Error { index } => {
                if let Some(record) = ctx
                    .error_records_mut()
                    .and_then(|records| records.get_mut(*index))
                {
                    mark_error_handled(record, subprocess_id);
                }
            }
            ConsumedTrigger::Escalation { fired_id } => {
                if let Some(fired) = ctx.events.fired.iter_mut().find(|f| &f.id == fired_id) {
                    fired.consumed_by = Some(subprocess_id.to_string());
                }
            }
            ConsumedTrigger::Condition => {}
        }
    }
}

fn mark_error_handled(record: &mut Value, subprocess_id: &str) {
    if !record.is_object() {
        // Bare string records carry only a code.
        let mut obj = Map::new();
        obj.insert("code".to_string(), record.take());
        *record = Value::Object(obj);
    }
    if let Value::Object(obj) = record {
        obj.insert("handled".to_string(), Value::Bool(true));
        obj.insert(
            "handledBy".to_string(),
            Value::String(subprocess_id.to_string()),
        );
    }
}

fn error_code(record: &Value) -> Option<&str> {
    match record {
        Value::String(code) => Some(code),
        Value::Object(obj) => obj
            .get("code")
            .or_else(|| obj.get("errorCode"))
            .and_then(Value::as_str),
        _ => None,
    }
}

fn is_handled(record: &Value) -> bool {
    record
        .get("handled")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub type TriggerEvaluator = fn(&TriggerDefinition, &TriggerInput<'_>) -> Option<TriggerMatch>;

/// Evaluators keyed by trigger kind.
#[derive(Clone)]
pub struct TriggerRegistry {
    evaluators: BTreeMap<TriggerKind, TriggerEvaluator>,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(TriggerKind::Timer, evaluate_timer);
        registry.register(TriggerKind::Message, evaluate_message);
        registry.register(TriggerKind::Signal, evaluate_signal);
        registry.register(TriggerKind::Error, evaluate_error);
        registry.register(TriggerKind::Escalation, evaluate_escalation);
        registry.register(TriggerKind::Conditional, evaluate_conditional);
        registry
    }
}

impl TriggerRegistry {
    pub fn empty() -> Self {
        Self {
            evaluators: BTreeMap::new(),
        }
    }

    /// Register (or replace) the evaluator for `kind`.
    pub fn register(&mut self, kind: TriggerKind, evaluator: TriggerEvaluator) {
        self.evaluators.insert(kind, evaluator);
    }

    pub fn supports(&self, kind: TriggerKind) -> bool {
        self.evaluators.contains_key(&kind)
    }

    /// Evaluate the subprocess's own trigger. Kinds without an evaluator never fire.
    pub fn evaluate(&self, input: &TriggerInput<'_>) -> Option<TriggerMatch> {
        let trigger = &input.subprocess.trigger;
        let evaluator = self.evaluators.get(&trigger.kind())?;
        evaluator(trigger, input)
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("kinds", &self.evaluators.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─── Evaluators ───────────────────────────────────────────────

fn evaluate_timer(trigger: &TriggerDefinition, input: &TriggerInput<'_>) -> Option<TriggerMatch> {
    let TriggerDefinition::Timer(_) = trigger else {
        return None;
    };
    let sub = input.subprocess;
    input
        .context
        .events
        .timers
        .iter()
        .find(|t| (t.event_id == sub.start_node || t.event_id == sub.id) && t.is_expired(input.now))
        .map(|t| TriggerMatch {
            kind: TriggerKind::Timer,
            consumed: ConsumedTrigger::Timer {
                timer_id: t.id.clone(),
            },
            payload: json!({ "timerId": t.id, "expiresAt": t.expires_at }),
        })
}

fn evaluate_message(trigger: &TriggerDefinition, input: &TriggerInput<'_>) -> Option<TriggerMatch> {
    let TriggerDefinition::Message { message_ref } = trigger else {
        return None;
    };
    input
        .context
        .external
        .message_events
        .iter()
        .find(|m| &m.message_ref == message_ref)
        .map(|m| TriggerMatch {
            kind: TriggerKind::Message,
            consumed: ConsumedTrigger::Message {
                event_id: m.id.clone(),
            },
            payload: m.payload.clone(),
        })
}

fn evaluate_signal(trigger: &TriggerDefinition, input: &TriggerInput<'_>) -> Option<TriggerMatch> {
    let TriggerDefinition::Signal { signal_ref } = trigger else {
        return None;
    };
    input
        .context
        .external
        .signal_events
        .iter()
        .find(|s| &s.signal_ref == signal_ref)
        .map(|s| TriggerMatch {
            kind: TriggerKind::Signal,
            consumed: ConsumedTrigger::Signal {
                event_id: s.id.clone(),
            },
            payload: s.payload.clone(),
        })
}

fn evaluate_error(trigger: &TriggerDefinition, input: &TriggerInput<'_>) -> Option<TriggerMatch> {
    let TriggerDefinition::Error { error_ref } = trigger else {
        return None;
    };
    input
        .context
        .error_records()
        .iter()
        .enumerate()
        .find(|(_, record)| {
            !is_handled(record)
                && match error_ref {
                    Some(wanted) => error_code(record) == Some(wanted.as_str()),
                    None => true,
                }
        })
        .map(|(index, record)| TriggerMatch {
            kind: TriggerKind::Error,
            consumed: ConsumedTrigger::Error { index },
            payload: record.clone(),
        })
}

fn evaluate_escalation(
    trigger: &TriggerDefinition,
    input: &TriggerInput<'_>,
) -> Option<TriggerMatch> {
    let TriggerDefinition::Escalation { escalation_ref } = trigger else {
        return None;
    };
    input
        .context
        .events
        .fired
        .iter()
        .find(|f| {
            f.kind == FiredEventKind::Escalation
                && f.consumed_by.is_none()
                && match escalation_ref {
                    Some(wanted) => f.code() == Some(wanted.as_str()),
                    None => true,
                }
        })
        .map(|f| TriggerMatch {
            kind: TriggerKind::Escalation,
            consumed: ConsumedTrigger::Escalation {
                fired_id: f.id.clone(),
            },
            payload: f.payload.clone(),
        })
}

fn evaluate_conditional(
    trigger: &TriggerDefinition,
    input: &TriggerInput<'_>,
) -> Option<TriggerMatch> {
    let TriggerDefinition::Conditional(condition) = trigger else {
        return None;
    };
    condition
        .evaluate(&input.context.variables)
        .then(|| TriggerMatch {
            kind: TriggerKind::Conditional,
            consumed: ConsumedTrigger::Condition,
            payload: json!({ "condition": condition.source() }),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FiredEvent, MessageEvent, TimerEntry, TimerKind};
    use crate::model::ProcessModel;
    use chrono::{Duration, TimeZone};

    fn model() -> ProcessModel {
        ProcessModel::from_yaml_str(
            r#"
id: triggers
event_subprocesses:
  - id: OnTimer
    nodes:
      - { kind: StartEvent, id: TimerStart, trigger: { type: timer, duration: PT1M } }
      - { kind: EndEvent, id: TimerEnd }
  - id: OnError
    nodes:
      - { kind: StartEvent, id: ErrorStart, trigger: { type: error, error_ref: E42 } }
      - { kind: EndEvent, id: ErrorEnd }
  - id: OnAnyError
    nodes:
      - { kind: StartEvent, id: AnyErrorStart, trigger: { type: error } }
      - { kind: EndEvent, id: AnyErrorEnd }
  - id: OnEscalation
    nodes:
      - { kind: StartEvent, id: EscStart, trigger: { type: escalation, escalation_ref: LATE } }
      - { kind: EndEvent, id: EscEnd }
  - id: OnMessage
    nodes:
      - { kind: StartEvent, id: MsgStart, trigger: { type: message, message_ref: Ping } }
      - { kind: EndEvent, id: MsgEnd }
  - id: OnCondition
    nodes:
      - { kind: StartEvent, id: CondStart, trigger: { type: conditional, condition: "risk > 7" } }
      - { kind: EndEvent, id: CondEnd }
"#,
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn eval(m: &ProcessModel, sub: &str, ctx: &ExecutionContext) -> Option<TriggerMatch> {
        let input = TriggerInput {
            context: ctx,
            subprocess: m.event_subprocess(sub).unwrap(),
            now: now(),
        };
        TriggerRegistry::default().evaluate(&input)
    }

    #[test]
    fn test_timer_fires_only_when_expired() {
        let m = model();
        let mut ctx = ExecutionContext::new();
        ctx.events.timers.push(TimerEntry {
            id: "t-future".to_string(),
            event_id: "TimerStart".to_string(),
            expires_at: now() + Duration::seconds(1),
            kind: TimerKind::EventSubprocessStart,
        });
        assert!(eval(&m, "OnTimer", &ctx).is_none());

        ctx.events.timers.push(TimerEntry {
            id: "t-due".to_string(),
            event_id: "TimerStart".to_string(),
            expires_at: now(),
            kind: TimerKind::EventSubprocessStart,
        });
        let hit = eval(&m, "OnTimer", &ctx).unwrap();
        assert_eq!(
            hit.consumed,
            ConsumedTrigger::Timer {
                timer_id: "t-due".to_string()
            }
        );
        hit.consumed.consume(&mut ctx, "OnTimer");
        assert_eq!(ctx.events.timers.len(), 1);
        assert_eq!(ctx.events.timers[0].id, "t-future");
    }

    #[test]
    fn test_error_matching_by_code_and_catch_all() {
        let m = model();
        let mut ctx = ExecutionContext::new().with_variable(
            "errors",
            json!([{"code": "E1", "message": "boom"}, "E42"]),
        );
        let hit = eval(&m, "OnError", &ctx).unwrap();
        assert_eq!(hit.consumed, ConsumedTrigger::Error { index: 1 });
        hit.consumed.consume(&mut ctx, "OnError");
        assert_eq!(
            ctx.error_records()[1],
            json!({"code": "E42", "handled": true, "handledBy": "OnError"})
        );
        assert!(eval(&m, "OnError", &ctx).is_none());

        let any = eval(&m, "OnAnyError", &ctx).unwrap();
        assert_eq!(any.consumed, ConsumedTrigger::Error { index: 0 });
    }

    #[test]
    fn test_escalation_is_marked_not_removed() {
        let m = model();
        let mut ctx = ExecutionContext::new();
        ctx.events.fired.push(FiredEvent {
            id: "f1".to_string(),
            event_id: "review".to_string(),
            kind: FiredEventKind::Escalation,
            payload: json!({"code": "LATE"}),
            fired_at: now(),
            source: "review".to_string(),
            consumed_by: None,
        });
        let hit = eval(&m, "OnEscalation", &ctx).unwrap();
        hit.consumed.consume(&mut ctx, "OnEscalation");
        assert_eq!(ctx.events.fired.len(), 1);
        assert_eq!(ctx.events.fired[0].consumed_by.as_deref(), Some("OnEscalation"));
        assert!(eval(&m, "OnEscalation", &ctx).is_none());
    }

    #[test]
    fn test_message_and_condition() {
        let m = model();
        let mut ctx = ExecutionContext::new().with_variable("risk", json!(9));
        ctx.external.message_events.push(MessageEvent {
            id: "msg-1".to_string(),
            message_ref: "Pong".to_string(),
            payload: Value::Null,
            received_at: None,
        });
        assert!(eval(&m, "OnMessage", &ctx).is_none());
        let cond = eval(&m, "OnCondition", &ctx).unwrap();
        assert_eq!(cond.kind, TriggerKind::Conditional);
        assert_eq!(cond.payload["condition"], "risk > 7");
    }

    #[test]
    fn test_registry_without_evaluator_never_fires() {
        let m = model();
        let ctx = ExecutionContext::new().with_variable("risk", json!(9));
        let registry = TriggerRegistry::empty();
        assert!(!registry.supports(TriggerKind::Conditional));
        let input = TriggerInput {
            context: &ctx,
            subprocess: m.event_subprocess("OnCondition").unwrap(),
            now: now(),
        };
        assert!(registry.evaluate(&input).is_none());
    }
}
