//! Error taxonomy for the execution core
//!
//! All errors are synchronous and carry enough identifiers (subprocess id,
//! step id, limiting dimension) for the orchestrator to act on them. None of
//! them represent transient conditions, so nothing here is retried.

use serde::{Deserialize, Serialize};
use std::fmt;

use thiserror::Error;

/// Result type for execution-core operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Main error type for the execution core
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: NotFoundKind, id: String },

    #[error(transparent)]
    InsufficientResources(#[from] InsufficientResourcesError),

    #[error("invalid allocation input for {field}: {reason}")]
    InvalidAllocationInput { field: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn subprocess_not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: NotFoundKind::EventSubprocess,
            id: id.into(),
        }
    }

    pub fn state_not_found(subprocess_id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: NotFoundKind::EventSubprocessState,
            id: subprocess_id.into(),
        }
    }

    pub fn node_not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: NotFoundKind::Node,
            id: id.into(),
        }
    }

    pub fn allocation_not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: NotFoundKind::Allocation,
            id: id.into(),
        }
    }
}

/// What kind of identifier a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    EventSubprocess,
    EventSubprocessState,
    Node,
    Allocation,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotFoundKind::EventSubprocess => "event subprocess",
            NotFoundKind::EventSubprocessState => "event subprocess state for",
            NotFoundKind::Node => "node",
            NotFoundKind::Allocation => "allocation",
        };
        f.write_str(s)
    }
}

/// Failure to load a process definition. Loading is all-or-nothing.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("could not decode definition: {0}")]
    Syntax(String),

    #[error("definition failed validation:\n{}", format_issues(.0))]
    Invalid(Vec<ValidationIssue>),

    #[error("could not read definition file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<serde_yaml::Error> for DefinitionError {
    fn from(error: serde_yaml::Error) -> Self {
        DefinitionError::Syntax(error.to_string())
    }
}

impl From<serde_json::Error> for DefinitionError {
    fn from(error: serde_json::Error) -> Self {
        DefinitionError::Syntax(error.to_string())
    }
}

/// One broken validation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub rule: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// A resource dimension tracked by the allocation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceDimension {
    #[serde(rename = "credits")]
    Credits,
    #[serde(rename = "durationMs")]
    Duration,
    #[serde(rename = "memoryMB")]
    Memory,
    #[serde(rename = "concurrentSteps")]
    Concurrency,
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceDimension::Credits => "credits",
            ResourceDimension::Duration => "durationMs",
            ResourceDimension::Memory => "memoryMB",
            ResourceDimension::Concurrency => "concurrentSteps",
        };
        f.write_str(s)
    }
}

/// One dimension where a request exceeded what the parent can give.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitingDimension {
    pub dimension: ResourceDimension,
    /// Decimal string so credits keep full precision.
    pub requested: String,
    pub available: String,
}

/// An explicit allocation request that does not fit the parent's ceiling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("insufficient resources for step '{step_id}': {}", describe_limits(.limits))]
pub struct InsufficientResourcesError {
    pub step_id: String,
    pub limits: Vec<LimitingDimension>,
}

impl InsufficientResourcesError {
    pub fn dimensions(&self) -> Vec<ResourceDimension> {
        self.limits.iter().map(|l| l.dimension).collect()
    }
}

fn describe_limits(limits: &[LimitingDimension]) -> String {
    limits
        .iter()
        .map(|l| {
            format!(
                "{} (requested {}, available {})",
                l.dimension, l.requested, l.available
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
