use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level DTO ──

/// Serialized process definition, as authored in YAML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinitionDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub flows: Vec<FlowDto>,
    #[serde(default, alias = "eventSubprocesses")]
    pub event_subprocesses: Vec<EventSubprocessDto>,
}

// ── Flow ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDto {
    /// Defaults to `<from>-><to>` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, alias = "isDefault", skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl FlowDto {
    pub fn effective_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.from, self.to))
    }
}

// ── Event subprocess ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubprocessDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "isInterrupting",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_interrupting: Option<bool>,
    #[serde(
        default,
        alias = "cancelActivity",
        skip_serializing_if = "Option::is_none"
    )]
    pub cancel_activity: Option<bool>,
    #[serde(default)]
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub flows: Vec<FlowDto>,
    #[serde(default, alias = "eventSubprocesses")]
    pub event_subprocesses: Vec<EventSubprocessDto>,
}

impl EventSubprocessDto {
    /// Interrupting unless explicitly marked otherwise by either flag.
    pub fn interrupting(&self) -> bool {
        self.is_interrupting != Some(false) && self.cancel_activity != Some(false)
    }
}

// ── Node (tagged enum) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeDto {
    StartEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<TriggerDto>,
    },
    EndEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Task {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, alias = "taskType", skip_serializing_if = "Option::is_none")]
        task_type: Option<String>,
    },
    ExclusiveGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ParallelGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    InclusiveGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    IntermediateEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl NodeDto {
    /// Returns the id regardless of variant.
    pub fn id(&self) -> &str {
        match self {
            NodeDto::StartEvent { id, .. } => id,
            NodeDto::EndEvent { id, .. } => id,
            NodeDto::Task { id, .. } => id,
            NodeDto::ExclusiveGateway { id, .. } => id,
            NodeDto::ParallelGateway { id, .. } => id,
            NodeDto::InclusiveGateway { id, .. } => id,
            NodeDto::IntermediateEvent { id, .. } => id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            NodeDto::StartEvent { name, .. }
            | NodeDto::EndEvent { name, .. }
            | NodeDto::Task { name, .. }
            | NodeDto::ExclusiveGateway { name, .. }
            | NodeDto::ParallelGateway { name, .. }
            | NodeDto::InclusiveGateway { name, .. }
            | NodeDto::IntermediateEvent { name, .. } => name.as_deref(),
        }
    }
}

// ── Trigger ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDto {
    Timer {
        /// ISO-8601 duration, e.g. `PT5M`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
        #[serde(default, alias = "durationMs", skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        /// RFC 3339 absolute deadline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
    },
    Message {
        #[serde(alias = "messageRef")]
        message_ref: String,
    },
    Signal {
        #[serde(alias = "signalRef")]
        signal_ref: String,
    },
    Error {
        #[serde(default, alias = "errorRef", skip_serializing_if = "Option::is_none")]
        error_ref: Option<String>,
    },
    Escalation {
        #[serde(
            default,
            alias = "escalationRef",
            skip_serializing_if = "Option::is_none"
        )]
        escalation_ref: Option<String>,
    },
    Conditional {
        condition: String,
    },
}
