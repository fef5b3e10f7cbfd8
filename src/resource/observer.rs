//! Allocation observer
//!
//! Policy fallbacks (a degraded floor, a clamped estimate, a parent passing
//! junk ceiling fields, a step that used more than it was granted) are not
//! errors. They are reported here so the orchestrator can track them.

use std::fmt;

use crate::error::{EngineError, ResourceDimension};

/// Something the protocol did instead of failing.
#[derive(Debug)]
pub enum AllocationEvent {
    /// A zero ceiling was replaced by the configured floor.
    Degraded {
        step_id: String,
        dimensions: Vec<ResourceDimension>,
    },
    /// An estimate was cut down to the parent ceiling.
    Clamped {
        step_id: String,
        dimension: ResourceDimension,
        requested: String,
        granted: String,
    },
    /// Usage exceeded the grant; nothing below zero is returned.
    OverConsumed {
        allocation_id: String,
        dimension: ResourceDimension,
        allocated: String,
        used: String,
    },
    /// A ceiling field was unreadable and treated as zero. Always an
    /// `EngineError::InvalidAllocationInput`.
    InvalidInput(EngineError),
}

impl AllocationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AllocationEvent::Degraded { .. } => "degraded",
            AllocationEvent::Clamped { .. } => "clamped",
            AllocationEvent::OverConsumed { .. } => "over_consumed",
            AllocationEvent::InvalidInput(_) => "invalid_input",
        }
    }
}

impl fmt::Display for AllocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationEvent::Degraded {
                step_id,
                dimensions,
            } => {
                let dims: Vec<String> = dimensions.iter().map(|d| d.to_string()).collect();
                write!(
                    f,
                    "degraded allocation for step '{}': floor used for {}",
                    step_id,
                    dims.join(", ")
                )
            }
            AllocationEvent::Clamped {
                step_id,
                dimension,
                requested,
                granted,
            } => write!(
                f,
                "clamped {} for step '{}': requested {}, granted {}",
                dimension, step_id, requested, granted
            ),
            AllocationEvent::OverConsumed {
                allocation_id,
                dimension,
                allocated,
                used,
            } => write!(
                f,
                "allocation {} over-consumed {}: allocated {}, used {}",
                allocation_id, dimension, allocated, used
            ),
            AllocationEvent::InvalidInput(err) => write!(f, "{}", err),
        }
    }
}

/// Receives allocation events. Must not panic.
pub trait AllocationObserver: Send + Sync {
    fn observe(&self, event: &AllocationEvent);

    /// Name of this observer for logging
    fn observer_name(&self) -> &'static str {
        "custom"
    }
}

/// Default observer: writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl AllocationObserver for TracingObserver {
    fn observe(&self, event: &AllocationEvent) {
        match event {
            AllocationEvent::Clamped { step_id, dimension, .. } => {
                tracing::info!(step_id = %step_id, dimension = %dimension, "{}", event);
            }
            _ => {
                tracing::warn!(kind = event.kind(), "{}", event);
            }
        }
    }

    fn observer_name(&self) -> &'static str {
        "tracing"
    }
}
