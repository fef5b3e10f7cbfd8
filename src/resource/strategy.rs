//! Allocation strategy configuration — step kinds, multipliers, floors.
//!
//! The strategy table is data, supplied by the caller and loadable from YAML
//! or JSON, so an outside tuning process can adjust allocations without code
//! changes. Multipliers are exact decimals applied to integer amounts as a
//! scaled rational, rounding up.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::credits::Credits;
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

/// Kind of a delegated unit of work. Unrecognized kinds map to `Unknown` and
/// use the default strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    Data,
    Validation,
    Transform,
    Tool,
    Routine,
    Llm,
    Agent,
    Unknown,
}

impl StepKind {
    pub fn parse(s: &str) -> StepKind {
        match s.trim().to_ascii_lowercase().as_str() {
            "data" => StepKind::Data,
            "validation" | "validate" => StepKind::Validation,
            "transform" | "transformation" => StepKind::Transform,
            "tool" | "api" => StepKind::Tool,
            "routine" | "subroutine" => StepKind::Routine,
            "llm" => StepKind::Llm,
            "agent" => StepKind::Agent,
            _ => StepKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Data => "data",
            StepKind::Validation => "validation",
            StepKind::Transform => "transform",
            StepKind::Tool => "tool",
            StepKind::Routine => "routine",
            StepKind::Llm => "llm",
            StepKind::Agent => "agent",
            StepKind::Unknown => "unknown",
        }
    }

    /// Base cost before complexity and strategy adjustments.
    pub fn base_cost(&self) -> BaseCost {
        let (credits, timeout_ms, memory_mb) = match self {
            StepKind::Data | StepKind::Validation => (100, 5_000, 64),
            StepKind::Transform => (250, 10_000, 128),
            StepKind::Tool => (1_000, 30_000, 256),
            StepKind::Routine => (2_500, 60_000, 256),
            StepKind::Llm => (5_000, 60_000, 512),
            StepKind::Agent => (10_000, 300_000, 1_024),
            StepKind::Unknown => (500, 30_000, 128),
        };
        BaseCost {
            credits: Credits::new(credits),
            timeout_ms,
            memory_mb,
        }
    }
}

impl From<String> for StepKind {
    fn from(s: String) -> Self {
        StepKind::parse(&s)
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseCost {
    pub credits: Credits,
    pub timeout_ms: u64,
    pub memory_mb: u64,
}

// ---------------------------------------------------------------------------
// Multiplier
// ---------------------------------------------------------------------------

/// Upper bound on any configured multiplier.
pub const MAX_MULTIPLIER: u32 = 1_000;

/// Exact decimal factor, e.g. `"1.5"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(Decimal);

impl Default for Multiplier {
    fn default() -> Self {
        Multiplier::ONE
    }
}

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(Decimal::ONE);

    pub fn new(value: Decimal) -> Self {
        Multiplier(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// `ceil(amount * self)`, computed as `amount * mantissa / 10^scale`.
    /// Saturates at `u128::MAX`; non-positive multipliers yield 0.
    pub fn apply(&self, amount: u128) -> u128 {
        let d = self.0.normalize();
        if d.is_sign_negative() || d.is_zero() {
            return 0;
        }
        let mantissa = d.mantissa().unsigned_abs();
        let denominator = 10u128.pow(d.scale());
        match amount.checked_mul(mantissa) {
            Some(n) => n / denominator + u128::from(n % denominator != 0),
            None => u128::MAX,
        }
    }

    /// `apply` for `u64` quantities, saturating at `u64::MAX`.
    pub fn apply_u64(&self, amount: u64) -> u64 {
        u64::try_from(self.apply(u128::from(amount))).unwrap_or(u64::MAX)
    }

    fn check(&self, field: &str) -> EngineResult<()> {
        if self.0 <= Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "{} must be positive, got {}",
                field, self.0
            )));
        }
        if self.0 > Decimal::from(MAX_MULTIPLIER) {
            return Err(EngineError::Config(format!(
                "{} must be at most {}, got {}",
                field, MAX_MULTIPLIER, self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// AllocationStrategy / MinimumAllocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationStrategy {
    #[serde(alias = "creditMultiplier")]
    pub credit_multiplier: Multiplier,
    #[serde(alias = "timeoutMultiplier")]
    pub timeout_multiplier: Multiplier,
    #[serde(alias = "memoryMultiplier")]
    pub memory_multiplier: Multiplier,
}

impl AllocationStrategy {
    pub fn uniform(multiplier: Decimal) -> Self {
        let m = Multiplier::new(multiplier);
        Self {
            credit_multiplier: m,
            timeout_multiplier: m,
            memory_multiplier: m,
        }
    }

    fn validate(&self, label: &str) -> EngineResult<()> {
        self.credit_multiplier
            .check(&format!("{}.credit_multiplier", label))?;
        self.timeout_multiplier
            .check(&format!("{}.timeout_multiplier", label))?;
        self.memory_multiplier
            .check(&format!("{}.memory_multiplier", label))
    }
}

/// Floor substituted for a dimension whose parent ceiling is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimumAllocation {
    pub credits: Credits,
    #[serde(alias = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(alias = "memoryMB")]
    pub memory_mb: u64,
    #[serde(alias = "concurrentExecutions")]
    pub concurrent_executions: u32,
}

impl Default for MinimumAllocation {
    fn default() -> Self {
        Self {
            credits: Credits::new(1),
            timeout_ms: 1_000,
            memory_mb: 16,
            concurrent_executions: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceFlowConfig
// ---------------------------------------------------------------------------

/// Strategy table and floors for the resource flow protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceFlowConfig {
    /// Multipliers per step kind.
    #[serde(alias = "allocationStrategies")]
    pub allocation_strategies: BTreeMap<StepKind, AllocationStrategy>,
    /// Used for kinds missing from the table.
    #[serde(alias = "defaultStrategy")]
    pub default_strategy: AllocationStrategy,
    #[serde(alias = "minimumAllocation")]
    pub minimum_allocation: MinimumAllocation,
    /// Upper bound for estimated payload complexity.
    #[serde(alias = "maxComplexity")]
    pub max_complexity: u32,
}

impl Default for ResourceFlowConfig {
    fn default() -> Self {
        Self {
            allocation_strategies: BTreeMap::new(),
            default_strategy: AllocationStrategy::default(),
            minimum_allocation: MinimumAllocation::default(),
            max_complexity: 100,
        }
    }
}

impl ResourceFlowConfig {
    pub fn from_yaml_str(yaml: &str) -> EngineResult<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML or JSON file (by extension).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let config = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        };
        config.with_context(|| format!("Parsing {}", path.display()))
    }

    /// Replace the strategy for one step kind.
    pub fn with_strategy(mut self, kind: StepKind, strategy: AllocationStrategy) -> Self {
        self.allocation_strategies.insert(kind, strategy);
        self
    }

    pub fn strategy_for(&self, kind: StepKind) -> &AllocationStrategy {
        self.allocation_strategies
            .get(&kind)
            .unwrap_or(&self.default_strategy)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.default_strategy.validate("default_strategy")?;
        for (kind, strategy) in &self.allocation_strategies {
            strategy.validate(&format!("allocation_strategies.{}", kind))?;
        }

        let floor = &self.minimum_allocation;
        if floor.credits.is_zero()
            || floor.timeout_ms == 0
            || floor.memory_mb == 0
            || floor.concurrent_executions == 0
        {
            return Err(EngineError::Config(
                "minimum_allocation fields must all be greater than zero".to_string(),
            ));
        }
        if self.max_complexity == 0 {
            return Err(EngineError::Config(
                "max_complexity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
