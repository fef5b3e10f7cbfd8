use crate::condition::Condition;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::timer::TimerSpec;

/// The start trigger of an event subprocess. Closed set: adding a trigger
/// type means adding a variant here and an evaluator in the monitor registry.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDefinition {
    Timer(TimerSpec),
    Message { message_ref: String },
    Signal { signal_ref: String },
    /// `None` catches every error.
    Error { error_ref: Option<String> },
    /// `None` catches every escalation.
    Escalation { escalation_ref: Option<String> },
    Conditional(Condition),
}

impl TriggerDefinition {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerDefinition::Timer(_) => TriggerKind::Timer,
            TriggerDefinition::Message { .. } => TriggerKind::Message,
            TriggerDefinition::Signal { .. } => TriggerKind::Signal,
            TriggerDefinition::Error { .. } => TriggerKind::Error,
            TriggerDefinition::Escalation { .. } => TriggerKind::Escalation,
            TriggerDefinition::Conditional(_) => TriggerKind::Conditional,
        }
    }
}

/// Variant tag of a `TriggerDefinition`. Also the `eventType` reported on
/// activation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Timer,
    Message,
    Signal,
    Error,
    Escalation,
    Conditional,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 6] = [
        TriggerKind::Timer,
        TriggerKind::Message,
        TriggerKind::Signal,
        TriggerKind::Error,
        TriggerKind::Escalation,
        TriggerKind::Conditional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Timer => "timer",
            TriggerKind::Message => "message",
            TriggerKind::Signal => "signal",
            TriggerKind::Error => "error",
            TriggerKind::Escalation => "escalation",
            TriggerKind::Conditional => "conditional",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
