//! Resource flow protocol
//!
//! Turns a parent's ceiling plus a step description into a concrete grant,
//! and reconciles actual usage back into what the parent gets returned.
//! Grants are computed from an immutable snapshot of the parent ceiling; the
//! orchestrator serializes concurrent requests against the same parent.

pub mod credits;
pub mod ledger;
pub mod observer;
pub mod strategy;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{
    EngineError, EngineResult, InsufficientResourcesError, LimitingDimension, ResourceDimension,
};
pub use credits::Credits;
pub use ledger::AllocationLedger;
pub use observer::{AllocationEvent, AllocationObserver, TracingObserver};
pub use strategy::{
    AllocationStrategy, MinimumAllocation, Multiplier, ResourceFlowConfig, StepKind,
};

/// Input size covered by one unit of estimated complexity.
pub const COMPLEXITY_BYTES: usize = 4_096;

fn is_false(v: &bool) -> bool {
    !v
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Budget ceiling handed down by a parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    pub max_credits: Credits,
    pub max_duration_ms: u64,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    pub max_concurrent_steps: u32,
}

impl ResourceAllocation {
    pub fn new(
        max_credits: impl Into<Credits>,
        max_duration_ms: u64,
        max_memory_mb: u64,
        max_concurrent_steps: u32,
    ) -> Self {
        Self {
            max_credits: max_credits.into(),
            max_duration_ms,
            max_memory_mb,
            max_concurrent_steps,
        }
    }

    /// Read a ceiling from loosely typed JSON. Numbers and decimal strings are
    /// accepted; missing, negative, fractional or non-numeric fields become 0
    /// and are returned as `InvalidAllocationInput` errors alongside the value.
    pub fn from_json_lenient(value: &Value) -> (ResourceAllocation, Vec<EngineError>) {
        let empty = Map::new();
        let obj = value.as_object().unwrap_or(&empty);
        let mut issues = Vec::new();

        let max_credits = lenient_field(obj, "maxCredits", "max_credits", &mut issues, |s| {
            s.parse::<Credits>().map_err(|e| e.reason)
        })
        .unwrap_or_default();
        let max_duration_ms =
            lenient_field(obj, "maxDurationMs", "max_duration_ms", &mut issues, parse_u64)
                .unwrap_or(0);
        let max_memory_mb =
            lenient_field(obj, "maxMemoryMB", "max_memory_mb", &mut issues, parse_u64)
                .unwrap_or(0);
        let max_concurrent_steps = lenient_field(
            obj,
            "maxConcurrentSteps",
            "max_concurrent_steps",
            &mut issues,
            parse_u64,
        )
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
        .unwrap_or(0);

        let allocation = ResourceAllocation {
            max_credits,
            max_duration_ms,
            max_memory_mb,
            max_concurrent_steps,
        };
        (allocation, issues)
    }
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    if trimmed.starts_with('-') {
        return Err("negative".to_string());
    }
    trimmed.parse::<u64>().map_err(|e| e.to_string())
}

fn lenient_field<T>(
    obj: &Map<String, Value>,
    name: &str,
    alias: &str,
    issues: &mut Vec<EngineError>,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Option<T>
where
    T: From<u64>,
{
    let parsed = match obj.get(name).or_else(|| obj.get(alias)) {
        None | Some(Value::Null) => Err("missing".to_string()),
        Some(Value::String(s)) => parse(s),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Ok(T::from(v)),
            None if n.is_i64() => Err("negative".to_string()),
            None => Err("not a whole number".to_string()),
        },
        Some(other) => Err(format!("expected a number, got {}", other)),
    };
    match parsed {
        Ok(v) => Some(v),
        Err(reason) => {
            issues.push(EngineError::InvalidAllocationInput {
                field: name.to_string(),
                reason,
            });
            None
        }
    }
}

/// A unit of work about to be delegated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDescription {
    pub step_id: String,
    pub step_type: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_concurrency: Option<u32>,
}

impl StepDescription {
    pub fn new(step_id: impl Into<String>, step_type: StepKind) -> Self {
        Self {
            step_id: step_id.into(),
            step_type,
            node_id: None,
            name: None,
            tool_name: None,
            inputs: None,
            estimated_complexity: None,
            requested_concurrency: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.estimated_complexity = Some(complexity);
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.requested_concurrency = Some(concurrency);
        self
    }
}

/// What a step would like, before the parent ceiling is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequirements {
    pub credits: Credits,
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub concurrent_executions: u32,
    pub complexity: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedResources {
    pub credits: Credits,
    pub timeout_ms: u64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    pub concurrent_executions: u32,
}

impl AllocatedResources {
    /// This grant as the ceiling for its own children.
    pub fn as_ceiling(&self) -> ResourceAllocation {
        ResourceAllocation {
            max_credits: self.credits,
            max_duration_ms: self.timeout_ms,
            max_memory_mb: self.memory_mb,
            max_concurrent_steps: self.concurrent_executions,
        }
    }

    pub fn saturating_add(&self, other: &AllocatedResources) -> AllocatedResources {
        AllocatedResources {
            credits: self.credits.saturating_add(other.credits),
            timeout_ms: self.timeout_ms.saturating_add(other.timeout_ms),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            concurrent_executions: self
                .concurrent_executions
                .saturating_add(other.concurrent_executions),
        }
    }

    fn from_values(values: [u128; 4]) -> Self {
        let [credits, timeout_ms, memory_mb, concurrent] = values;
        AllocatedResources {
            credits: Credits::new(credits),
            timeout_ms: u64::try_from(timeout_ms).unwrap_or(u64::MAX),
            memory_mb: u64::try_from(memory_mb).unwrap_or(u64::MAX),
            concurrent_executions: u32::try_from(concurrent).unwrap_or(u32::MAX),
        }
    }

    fn values(&self) -> [u128; 4] {
        [
            self.credits.get(),
            u128::from(self.timeout_ms),
            u128::from(self.memory_mb),
            u128::from(self.concurrent_executions),
        ]
    }
}

/// What a step actually consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceUsage {
    pub credits: Credits,
    pub duration_ms: u64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    pub concurrent_executions: u32,
}

impl ResourceUsage {
    fn values(&self) -> [u128; 4] {
        [
            self.credits.get(),
            u128::from(self.duration_ms),
            u128::from(self.memory_mb),
            u128::from(self.concurrent_executions),
        ]
    }
}

/// A grant, tied to its place in the delegation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    pub allocation_id: String,
    pub step_id: String,
    pub allocated: AllocatedResources,
    pub parent_allocation_id: String,
    /// Root first, this grant last.
    pub allocation_path: Vec<String>,
    /// At least one dimension used the configured floor.
    #[serde(default, skip_serializing_if = "is_false")]
    pub degraded: bool,
}

impl AllocationRecord {
    /// Whether `ancestor` appears above this grant in the delegation tree.
    pub fn descends_from(&self, ancestor: &str) -> bool {
        self.allocation_id != ancestor && self.allocation_path.iter().any(|id| id == ancestor)
    }
}

/// The grant a new allocation is carved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentAllocation {
    pub allocation_id: String,
    /// Root first, the parent itself last.
    pub allocation_path: Vec<String>,
    pub ceiling: ResourceAllocation,
}

impl ParentAllocation {
    pub fn root(allocation_id: impl Into<String>, ceiling: ResourceAllocation) -> Self {
        let allocation_id = allocation_id.into();
        Self {
            allocation_path: vec![allocation_id.clone()],
            allocation_id,
            ceiling,
        }
    }

    /// Delegate further from an existing grant.
    pub fn from_record(record: &AllocationRecord) -> Self {
        Self {
            allocation_id: record.allocation_id.clone(),
            allocation_path: record.allocation_path.clone(),
            ceiling: record.allocated.as_ceiling(),
        }
    }
}

/// Result of reconciling usage against a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    pub allocation_id: String,
    pub parent_allocation_id: String,
    /// `allocated - used` per dimension, never below zero.
    pub returned_to_parent: AllocatedResources,
    /// Dimensions where usage exceeded the grant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub over_consumed: Vec<ResourceDimension>,
}

const DIMENSIONS: [ResourceDimension; 4] = [
    ResourceDimension::Credits,
    ResourceDimension::Duration,
    ResourceDimension::Memory,
    ResourceDimension::Concurrency,
];

// ---------------------------------------------------------------------------
// ResourceFlowProtocol
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ResourceFlowProtocol {
    config: ResourceFlowConfig,
    observer: Arc<dyn AllocationObserver>,
}

impl fmt::Debug for ResourceFlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceFlowProtocol")
            .field("config", &self.config)
            .field("observer", &self.observer.observer_name())
            .finish()
    }
}

impl Default for ResourceFlowProtocol {
    fn default() -> Self {
        Self {
            config: ResourceFlowConfig::default(),
            observer: Arc::new(TracingObserver),
        }
    }
}

impl ResourceFlowProtocol {
    pub fn new(config: ResourceFlowConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observer: Arc::new(TracingObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn AllocationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ResourceFlowConfig {
        &self.config
    }

    /// Read a parent ceiling leniently, reporting every unreadable field.
    pub fn parse_ceiling(&self, value: &Value) -> ResourceAllocation {
        let (ceiling, issues) = ResourceAllocation::from_json_lenient(value);
        for issue in issues {
            self.observer.observe(&AllocationEvent::InvalidInput(issue));
        }
        ceiling
    }

    /// Estimated complexity: the explicit estimate, or 1 per started
    /// `COMPLEXITY_BYTES` of serialized input, within `1..=max_complexity`.
    pub fn complexity(&self, step: &StepDescription) -> u32 {
        let raw = step.estimated_complexity.unwrap_or_else(|| {
            let bytes = step
                .inputs
                .as_ref()
                .and_then(|v| serde_json::to_vec(v).ok())
                .map_or(0, |b| b.len());
            u32::try_from(bytes / COMPLEXITY_BYTES)
                .unwrap_or(u32::MAX)
                .saturating_add(1)
        });
        raw.max(1).min(self.config.max_complexity.max(1))
    }

    /// Base cost for the step kind, scaled by complexity and the kind's strategy.
    pub fn estimate_requirements(&self, step: &StepDescription) -> ResourceRequirements {
        let base = step.step_type.base_cost();
        let strategy = self.config.strategy_for(step.step_type);
        let complexity = self.complexity(step);

        let credits = strategy
            .credit_multiplier
            .apply(base.credits.get().saturating_mul(u128::from(complexity)));
        let timeout_ms = strategy
            .timeout_multiplier
            .apply_u64(base.timeout_ms.saturating_mul(u64::from(complexity)));
        let memory_mb = strategy.memory_multiplier.apply_u64(base.memory_mb);

        ResourceRequirements {
            credits: Credits::new(credits),
            timeout_ms,
            memory_mb,
            concurrent_executions: step.requested_concurrency.unwrap_or(1).max(1),
            complexity,
        }
    }

    /// Estimation fallback: never fails. Each dimension is cut down to the
    /// parent ceiling, and a zero ceiling gets the configured floor.
    pub fn compute_allocation(
        &self,
        step: &StepDescription,
        parent: &ParentAllocation,
    ) -> AllocationRecord {
        let requested = requirement_values(&self.estimate_requirements(step));
        let ceiling = ceiling_values(&parent.ceiling);
        let floor = self.floor_values();

        let mut degraded = Vec::new();
        let values: [u128; 4] = std::array::from_fn(|i| {
            let (dimension, wanted, limit) = (DIMENSIONS[i], requested[i], ceiling[i]);
            if limit == 0 {
                degraded.push(dimension);
                floor[i]
            } else if wanted > limit {
                self.observer.observe(&AllocationEvent::Clamped {
                    step_id: step.step_id.clone(),
                    dimension,
                    requested: wanted.to_string(),
                    granted: limit.to_string(),
                });
                limit
            } else {
                wanted
            }
        });
        self.grant(step, parent, values, degraded)
    }

    /// Explicit hierarchical allocation. Fails with `InsufficientResources`
    /// naming every dimension the estimate does not fit; never clamps. A zero
    /// ceiling still gets the configured floor.
    pub fn allocate(
        &self,
        step: &StepDescription,
        parent: &ParentAllocation,
    ) -> EngineResult<AllocationRecord> {
        let requested = requirement_values(&self.estimate_requirements(step));
        let ceiling = ceiling_values(&parent.ceiling);
        let floor = self.floor_values();

        let limits: Vec<LimitingDimension> = DIMENSIONS
            .iter()
            .zip(requested.iter().zip(ceiling.iter()))
            .filter(|(_, (wanted, limit))| **limit != 0 && **wanted > **limit)
            .map(|(&dimension, (wanted, limit))| LimitingDimension {
                dimension,
                requested: wanted.to_string(),
                available: limit.to_string(),
            })
            .collect();
        if !limits.is_empty() {
            let err = InsufficientResourcesError {
                step_id: step.step_id.clone(),
                limits,
            };
            warn!(
                step_id = %step.step_id,
                parent = %parent.allocation_id,
                error = %err,
                "Allocation refused"
            );
            return Err(err.into());
        }

        let mut degraded = Vec::new();
        let values: [u128; 4] = std::array::from_fn(|i| {
            if ceiling[i] == 0 {
                degraded.push(DIMENSIONS[i]);
                floor[i]
            } else {
                requested[i]
            }
        });
        Ok(self.grant(step, parent, values, degraded))
    }

    /// Reconcile usage: return `allocated - used` per dimension, reporting
    /// (not subtracting past zero) any over-consumption.
    pub fn release(&self, record: &AllocationRecord, usage: &ResourceUsage) -> ReleaseOutcome {
        let allocated = record.allocated.values();
        let used = usage.values();

        let mut over_consumed = Vec::new();
        let returned: [u128; 4] = std::array::from_fn(|i| {
            let (dimension, granted, spent) = (DIMENSIONS[i], allocated[i], used[i]);
            if spent > granted {
                over_consumed.push(dimension);
                self.observer.observe(&AllocationEvent::OverConsumed {
                    allocation_id: record.allocation_id.clone(),
                    dimension,
                    allocated: granted.to_string(),
                    used: spent.to_string(),
                });
            }
            granted.saturating_sub(spent)
        });

        debug!(
            allocation_id = %record.allocation_id,
            returned_credits = %Credits::new(returned[0]),
            "Allocation released"
        );
        ReleaseOutcome {
            allocation_id: record.allocation_id.clone(),
            parent_allocation_id: record.parent_allocation_id.clone(),
            returned_to_parent: AllocatedResources::from_values(returned),
            over_consumed,
        }
    }

    fn floor_values(&self) -> [u128; 4] {
        let floor = &self.config.minimum_allocation;
        [
            floor.credits.get(),
            u128::from(floor.timeout_ms),
            u128::from(floor.memory_mb),
            u128::from(floor.concurrent_executions),
        ]
    }

    fn grant(
        &self,
        step: &StepDescription,
        parent: &ParentAllocation,
        values: [u128; 4],
        degraded: Vec<ResourceDimension>,
    ) -> AllocationRecord {
        let allocation_id = Uuid::now_v7().to_string();
        let mut allocation_path = if parent.allocation_path.is_empty() {
            vec![parent.allocation_id.clone()]
        } else {
            parent.allocation_path.clone()
        };
        allocation_path.push(allocation_id.clone());

        let is_degraded = !degraded.is_empty();
        if is_degraded {
            self.observer.observe(&AllocationEvent::Degraded {
                step_id: step.step_id.clone(),
                dimensions: degraded,
            });
        }

        let record = AllocationRecord {
            allocation_id,
            step_id: step.step_id.clone(),
            allocated: AllocatedResources::from_values(values),
            parent_allocation_id: parent.allocation_id.clone(),
            allocation_path,
            degraded: is_degraded,
        };
        debug!(
            allocation_id = %record.allocation_id,
            step_id = %record.step_id,
            step_type = %step.step_type,
            credits = %record.allocated.credits,
            depth = record.allocation_path.len(),
            "Allocation granted"
        );
        record
    }
}

fn requirement_values(req: &ResourceRequirements) -> [u128; 4] {
    [
        req.credits.get(),
        u128::from(req.timeout_ms),
        u128::from(req.memory_mb),
        u128::from(req.concurrent_executions),
    ]
}

fn ceiling_values(ceiling: &ResourceAllocation) -> [u128; 4] {
    [
        ceiling.max_credits.get(),
        u128::from(ceiling.max_duration_ms),
        u128::from(ceiling.max_memory_mb),
        u128::from(ceiling.max_concurrent_steps),
    ]
}
