//! Tiered workflow execution core
//!
//! Interprets a process graph (tasks, gateways, events and event
//! subprocesses) against an execution context, and allocates, tracks and
//! reclaims the resources delegated work may consume.
//!
//! Key concepts:
//! - `ProcessModel` - loaded, validated, read-only process graph
//! - `EventSubprocessMonitor` - decides which event subprocesses start, advance or complete
//! - `ResourceFlowProtocol` - turns a parent ceiling and a step into a grant, and reconciles usage
//! - `TierExecutionRequest` - the request shape handed to the next tier
//!
//! Every operation is synchronous and pure: it takes a context (or ceiling)
//! and returns an updated copy. Time is always supplied by the caller.
//!
//! # Example
//!
//! ```yaml
//! id: order
//! nodes:
//!   - { kind: StartEvent, id: start }
//!   - { kind: Task, id: review, task_type: llm }
//!   - { kind: EndEvent, id: end }
//! flows:
//!   - { from: start, to: review }
//!   - { from: review, to: end }
//! event_subprocesses:
//!   - id: TimeoutHandler
//!     nodes:
//!       - kind: StartEvent
//!         id: TimerStart
//!         trigger: { type: timer, duration: PT5M }
//!       - { kind: EndEvent, id: TimeoutEnd }
//!     flows:
//!       - { from: TimerStart, to: TimeoutEnd }
//! ```

pub mod condition;
pub mod context;
pub mod error;
pub mod model;
pub mod monitor;
pub mod request;
pub mod resource;
pub mod telemetry;

pub use condition::Condition;
pub use context::{AbstractLocation, EventSubprocessState, ExecutionContext, SubprocessStatus};
pub use error::{
    DefinitionError, EngineError, EngineResult, InsufficientResourcesError, ResourceDimension,
};
pub use model::{ProcessModel, TriggerDefinition, TriggerKind};
pub use monitor::{
    EventSubprocessMonitor, EventSubprocessSummary, MonitoringResult, SubprocessActivation,
};
pub use request::{RunInfo, TierExecutionRequest};
pub use resource::{
    AllocationLedger, AllocationRecord, Credits, ParentAllocation, ResourceAllocation,
    ResourceFlowConfig, ResourceFlowProtocol, StepDescription, StepKind,
};
