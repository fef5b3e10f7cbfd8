//! Event subprocess monitor
//!
//! Decides, on each navigation step, whether any event subprocess in scope
//! should start, and advances the ones already running. Every operation is
//! pure: it takes a context and returns an updated copy, so a pass can be
//! replayed against the same input and produce the same output.

pub mod evaluators;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{
    AbstractLocation, EventSubprocessState, ExecutionContext, SubprocessStatus, TimerEntry,
    TimerKind,
};
use crate::error::{EngineError, EngineResult};
use crate::model::{EventSubprocessDef, ProcessModel, TriggerDefinition, TriggerKind};
use evaluators::{TriggerInput, TriggerRegistry};

/// Metadata keys written onto locations produced by the monitor.
pub const STATE_ID_KEY: &str = "eventSubprocessStateId";
pub const TRIGGER_TYPE_KEY: &str = "triggerType";
pub const TRIGGER_PAYLOAD_KEY: &str = "triggerPayload";
pub const INTERRUPTING_KEY: &str = "interrupting";

/// One event subprocess started during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprocessActivation {
    pub subprocess_id: String,
    pub interrupting: bool,
    pub event_type: TriggerKind,
}

/// Outcome of a monitoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResult {
    pub next_locations: Vec<AbstractLocation>,
    pub subprocess_activations: Vec<SubprocessActivation>,
    /// Advisory. The orchestrator decides how to unwind the main flow.
    pub should_interrupt_main_process: bool,
    pub updated_context: ExecutionContext,
}

impl MonitoringResult {
    fn unchanged(ctx: &ExecutionContext) -> Self {
        Self {
            next_locations: Vec::new(),
            subprocess_activations: Vec::new(),
            should_interrupt_main_process: false,
            updated_context: ctx.clone(),
        }
    }
}

/// Outcome of advancing one running instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SubprocessStep {
    pub next_locations: Vec<AbstractLocation>,
    pub completed: bool,
    pub updated_context: ExecutionContext,
}

/// Counts over every recorded instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubprocessSummary {
    pub total: usize,
    pub monitoring: usize,
    pub active: usize,
    pub completed: usize,
    pub interrupting: usize,
    pub non_interrupting: usize,
    pub active_subprocess_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventSubprocessMonitor {
    registry: TriggerRegistry,
}

impl EventSubprocessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: TriggerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    /// Create `monitoring` records for the event subprocesses declared
    /// directly in `scope` (`None` is the main process) and schedule their
    /// start timers. Subprocesses that already have a record are left alone.
    pub fn initialize_monitoring(
        &self,
        model: &ProcessModel,
        scope: Option<&str>,
        context: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> ExecutionContext {
        let mut ctx = context.clone();
        for sub in model
            .event_subprocesses()
            .iter()
            .filter(|s| s.container.as_deref() == scope)
        {
            if ctx.event_subprocess_state(&sub.id).is_some() {
                continue;
            }
            ctx.subprocesses.event_subprocesses.push(EventSubprocessState {
                id: derived_id("state", &sub.id, now),
                subprocess_id: sub.id.clone(),
                trigger_event: sub.start_node.clone(),
                interrupting: sub.interrupting,
                status: SubprocessStatus::Monitoring,
                started_at: None,
                completed_at: None,
            });
            if !ctx.events.active.contains(&sub.start_node) {
                ctx.events.active.push(sub.start_node.clone());
            }
            if let TriggerDefinition::Timer(spec) = &sub.trigger {
                if !ctx.events.timers.iter().any(|t| t.event_id == sub.start_node) {
                    ctx.events.timers.push(TimerEntry {
                        id: derived_id("timer", &sub.id, now),
                        event_id: sub.start_node.clone(),
                        expires_at: spec.expires_at(now),
                        kind: TimerKind::EventSubprocessStart,
                    });
                }
            }
            debug!(
                subprocess_id = %sub.id,
                trigger = %sub.trigger.kind(),
                "Monitoring event subprocess"
            );
        }
        ctx
    }

    /// Run one monitoring pass at `location`.
    ///
    /// Candidates are the event subprocesses declared in the location's scope
    /// and every enclosing scope, in declaration order. Each is evaluated
    /// against the context as updated by the candidates before it, so a
    /// consumed message or timer is seen by at most one subprocess. When the
    /// location is inside a running instance and nothing interrupting fired,
    /// that instance is advanced too.
    pub fn check_event_subprocesses(
        &self,
        model: &ProcessModel,
        location: &AbstractLocation,
        context: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> EngineResult<MonitoringResult> {
        let scope = location.subprocess_id();
        if let Some(id) = scope {
            if model.event_subprocess(id).is_none() {
                return Err(EngineError::subprocess_not_found(id));
            }
        }
        let chain = model.scope_chain(scope);

        let mut ctx = context.clone();
        let mut next_locations = Vec::new();
        let mut activations = Vec::new();
        let mut interrupt = false;

        for sub in model
            .event_subprocesses()
            .iter()
            .filter(|s| chain.contains(&s.container))
        {
            if is_running_or_done(&ctx, &sub.id) {
                continue;
            }
            let matched = self.registry.evaluate(&TriggerInput {
                context: &ctx,
                subprocess: sub,
                now,
            });
            let Some(matched) = matched else {
                continue;
            };
            matched.consumed.consume(&mut ctx, &sub.id);
            next_locations.push(start_instance(
                &mut ctx,
                sub,
                &location.routine_id,
                now,
                matched.kind,
                matched.payload,
            ));
            activations.push(SubprocessActivation {
                subprocess_id: sub.id.clone(),
                interrupting: sub.interrupting,
                event_type: matched.kind,
            });
            interrupt |= sub.interrupting;
        }

        if let Some(id) = scope {
            if interrupt {
                debug!(subprocess_id = %id, "Interrupted; not advancing current instance");
            } else {
                let (advanced, _) = advance_instance(model, id, location, &mut ctx, now)?;
                next_locations.extend(advanced);
            }
        }

        Ok(MonitoringResult {
            next_locations,
            subprocess_activations: activations,
            should_interrupt_main_process: interrupt,
            updated_context: ctx,
        })
    }

    /// Start `subprocess_id` without evaluating its trigger. An instance that
    /// is already running or finished is not restarted.
    pub fn activate_subprocess(
        &self,
        model: &ProcessModel,
        subprocess_id: &str,
        routine_id: &str,
        context: &ExecutionContext,
        now: DateTime<Utc>,
        payload: Value,
    ) -> EngineResult<MonitoringResult> {
        let sub = model
            .event_subprocess(subprocess_id)
            .ok_or_else(|| EngineError::subprocess_not_found(subprocess_id))?;
        if is_running_or_done(context, subprocess_id) {
            debug!(subprocess_id, "Event subprocess already started");
            return Ok(MonitoringResult::unchanged(context));
        }

        let mut ctx = context.clone();
        let kind = sub.trigger.kind();
        let start = start_instance(&mut ctx, sub, routine_id, now, kind, payload);
        Ok(MonitoringResult {
            next_locations: vec![start],
            subprocess_activations: vec![SubprocessActivation {
                subprocess_id: sub.id.clone(),
                interrupting: sub.interrupting,
                event_type: kind,
            }],
            should_interrupt_main_process: sub.interrupting,
            updated_context: ctx,
        })
    }

    /// Advance a running instance from `location` by ordinary sequence-flow
    /// traversal inside its own nodes. A location on one of its end events
    /// completes the instance.
    pub fn advance_subprocess(
        &self,
        model: &ProcessModel,
        subprocess_id: &str,
        location: &AbstractLocation,
        context: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> EngineResult<SubprocessStep> {
        let mut ctx = context.clone();
        let (next_locations, completed) =
            advance_instance(model, subprocess_id, location, &mut ctx, now)?;
        Ok(SubprocessStep {
            next_locations,
            completed,
            updated_context: ctx,
        })
    }

    /// Mark the latest instance of `subprocess_id` completed.
    pub fn complete_subprocess(
        &self,
        subprocess_id: &str,
        context: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> EngineResult<ExecutionContext> {
        let mut ctx = context.clone();
        complete_instance(&mut ctx, subprocess_id, now)?;
        Ok(ctx)
    }

    /// Drop every instance of `subprocess_id` whatever its status, along with
    /// its bookkeeping entries and pending start timers.
    pub fn deactivate_subprocess(
        &self,
        subprocess_id: &str,
        context: &ExecutionContext,
    ) -> ExecutionContext {
        let mut ctx = context.clone();
        let start_events: Vec<String> = ctx
            .subprocesses
            .event_subprocesses
            .iter()
            .filter(|s| s.subprocess_id == subprocess_id)
            .map(|s| s.trigger_event.clone())
            .collect();

        ctx.subprocesses
            .event_subprocesses
            .retain(|s| s.subprocess_id != subprocess_id);
        ctx.subprocesses
            .active_subprocesses
            .retain(|s| s != subprocess_id);
        ctx.subprocesses
            .completed_subprocesses
            .retain(|s| s != subprocess_id);
        ctx.events.active.retain(|e| !start_events.contains(e));
        ctx.events.timers.retain(|t| {
            !(t.kind == TimerKind::EventSubprocessStart
                && (t.event_id == subprocess_id || start_events.contains(&t.event_id)))
        });

        if !start_events.is_empty() {
            info!(subprocess_id, "Deactivated event subprocess");
        }
        ctx
    }

    pub fn summary(&self, context: &ExecutionContext) -> EventSubprocessSummary {
        let mut summary = EventSubprocessSummary::default();
        for state in &context.subprocesses.event_subprocesses {
            summary.total += 1;
            match state.status {
                SubprocessStatus::Monitoring => summary.monitoring += 1,
                SubprocessStatus::Active => {
                    summary.active += 1;
                    summary.active_subprocess_ids.push(state.subprocess_id.clone());
                }
                SubprocessStatus::Completed => summary.completed += 1,
            }
            if state.interrupting {
                summary.interrupting += 1;
            } else {
                summary.non_interrupting += 1;
            }
        }
        summary
    }
}

// ─── Instance lifecycle ───────────────────────────────────────

fn derived_id(prefix: &str, subprocess_id: &str, at: DateTime<Utc>) -> String {
    let name = format!("{}:{}@{}", prefix, subprocess_id, at.timestamp_millis());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn is_running_or_done(ctx: &ExecutionContext, subprocess_id: &str) -> bool {
    matches!(
        ctx.event_subprocess_state(subprocess_id).map(|s| s.status),
        Some(SubprocessStatus::Active | SubprocessStatus::Completed)
    )
}

/// Move the instance to `active` (creating it if it was never monitored) and
/// return the location of its start event.
fn start_instance(
    ctx: &mut ExecutionContext,
    sub: &EventSubprocessDef,
    routine_id: &str,
    now: DateTime<Utc>,
    kind: TriggerKind,
    payload: Value,
) -> AbstractLocation {
    let state_id = match ctx.event_subprocess_state_mut(&sub.id) {
        Some(state) if state.status == SubprocessStatus::Monitoring => {
            state.status = SubprocessStatus::Active;
            state.started_at = Some(now);
            state.id.clone()
        }
        _ => {
            let id = derived_id("state", &sub.id, now);
            ctx.subprocesses.event_subprocesses.push(EventSubprocessState {
                id: id.clone(),
                subprocess_id: sub.id.clone(),
                trigger_event: sub.start_node.clone(),
                interrupting: sub.interrupting,
                status: SubprocessStatus::Active,
                started_at: Some(now),
                completed_at: None,
            });
            id
        }
    };

    if !ctx.subprocesses.active_subprocesses.contains(&sub.id) {
        ctx.subprocesses.active_subprocesses.push(sub.id.clone());
    }
    ctx.events.active.retain(|e| e != &sub.start_node);

    info!(
        subprocess_id = %sub.id,
        trigger = %kind,
        interrupting = sub.interrupting,
        "Event subprocess activated"
    );

    let mut location = AbstractLocation::in_subprocess(routine_id, &sub.start_node, &sub.id);
    location
        .metadata
        .insert(STATE_ID_KEY.to_string(), Value::String(state_id));
    location.metadata.insert(
        TRIGGER_TYPE_KEY.to_string(),
        Value::String(kind.as_str().to_string()),
    );
    location
        .metadata
        .insert(INTERRUPTING_KEY.to_string(), Value::Bool(sub.interrupting));
    if !payload.is_null() {
        location
            .metadata
            .insert(TRIGGER_PAYLOAD_KEY.to_string(), payload);
    }
    location
}

/// Returns the next locations and whether the instance completed.
fn advance_instance(
    model: &ProcessModel,
    subprocess_id: &str,
    location: &AbstractLocation,
    ctx: &mut ExecutionContext,
    now: DateTime<Utc>,
) -> EngineResult<(Vec<AbstractLocation>, bool)> {
    let sub = model
        .event_subprocess(subprocess_id)
        .ok_or_else(|| EngineError::subprocess_not_found(subprocess_id))?;
    let state = ctx
        .event_subprocess_state(subprocess_id)
        .ok_or_else(|| EngineError::state_not_found(subprocess_id))?;

    match state.status {
        SubprocessStatus::Active => {}
        SubprocessStatus::Completed => return Ok((Vec::new(), true)),
        SubprocessStatus::Monitoring => {
            debug!(subprocess_id, "Event subprocess not started; nothing to advance");
            return Ok((Vec::new(), false));
        }
    }
    let state_id = state.id.clone();

    if !sub.node_ids.contains(&location.node_id) {
        return Err(EngineError::node_not_found(&location.node_id));
    }
    if sub.end_nodes.contains(&location.node_id) {
        complete_instance(ctx, subprocess_id, now)?;
        return Ok((Vec::new(), true));
    }

    let next = model
        .next_nodes(&location.node_id, &ctx.variables)?
        .into_iter()
        .map(|node| {
            let mut next =
                AbstractLocation::in_subprocess(&location.routine_id, &node.id, subprocess_id);
            next.metadata
                .insert(STATE_ID_KEY.to_string(), Value::String(state_id.clone()));
            next
        })
        .collect();
    Ok((next, false))
}

fn complete_instance(
    ctx: &mut ExecutionContext,
    subprocess_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let state = ctx
        .event_subprocess_state_mut(subprocess_id)
        .ok_or_else(|| EngineError::state_not_found(subprocess_id))?;
    match state.status {
        SubprocessStatus::Completed => return Ok(()),
        SubprocessStatus::Monitoring => {
            warn!(subprocess_id, "Cannot complete an event subprocess that never started");
            return Ok(());
        }
        SubprocessStatus::Active => {
            state.status = SubprocessStatus::Completed;
            state.completed_at = Some(now);
        }
    }

    ctx.subprocesses
        .active_subprocesses
        .retain(|s| s != subprocess_id);
    if !ctx
        .subprocesses
        .completed_subprocesses
        .iter()
        .any(|s| s == subprocess_id)
    {
        ctx.subprocesses
            .completed_subprocesses
            .push(subprocess_id.to_string());
    }
    info!(subprocess_id, "Event subprocess completed");
    Ok(())
}
