//! Tier execution request
//!
//! The boundary artifact handed to the downstream tier executor. Its shape is
//! a stable contract: exactly `context`, `input`, `allocation` and `options`
//! at the top level, with `maxCredits` as a decimal string.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::EngineResult;
use crate::resource::{
    AllocationRecord, ParentAllocation, ResourceAllocation, ResourceFlowProtocol, StepDescription,
    StepKind,
};

/// Identifies the run a step belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: String,
    pub routine_version_id: String,
    pub user_id: String,
    pub organization_id: String,
}

/// Execution context excerpt: run identity plus whatever else the caller
/// chose to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(flatten)]
    pub run: RunInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Step input excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
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
}

impl From<&StepDescription> for StepInput {
    fn from(step: &StepDescription) -> Self {
        Self {
            step_id: step.step_id.clone(),
            step_type: step.step_type,
            node_id: step.node_id.clone(),
            name: step.name.clone(),
            tool_name: step.tool_name.clone(),
            inputs: step.inputs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierExecutionRequest {
    pub context: RequestContext,
    pub input: StepInput,
    pub allocation: ResourceAllocation,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Key under which the process variables travel in the context excerpt.
pub const VARIABLES_KEY: &str = "variables";

impl ResourceFlowProtocol {
    /// Allocate for `step` under `parent` and shape the request for the next
    /// tier. The grant is returned too, so the caller can record and later
    /// release it. Fails exactly when `allocate` fails.
    pub fn build_tier_request(
        &self,
        run: &RunInfo,
        context: &ExecutionContext,
        step: &StepDescription,
        parent: &ParentAllocation,
        options: Map<String, Value>,
    ) -> EngineResult<(TierExecutionRequest, AllocationRecord)> {
        let record = self.allocate(step, parent)?;

        let mut extra = Map::new();
        if !context.variables.is_empty() {
            let variables: Map<String, Value> = context
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            extra.insert(VARIABLES_KEY.to_string(), Value::Object(variables));
        }

        let request = TierExecutionRequest {
            context: RequestContext {
                run: run.clone(),
                extra,
            },
            input: StepInput::from(step),
            allocation: record.allocated.as_ceiling(),
            options,
        };
        debug!(
            run_id = %run.run_id,
            step_id = %step.step_id,
            allocation_id = %record.allocation_id,
            "Built tier execution request"
        );
        Ok((request, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::resource::Credits;
    use serde_json::json;

    fn run() -> RunInfo {
        RunInfo {
            run_id: "run-42".to_string(),
            routine_version_id: "rv-7".to_string(),
            user_id: "u-1".to_string(),
            organization_id: "org-9".to_string(),
        }
    }

    fn parent() -> ParentAllocation {
        ParentAllocation::root(
            "root",
            ResourceAllocation::new(
                Credits::new(900_000_000_000_000_000_000),
                600_000,
                2_048,
                4,
            ),
        )
    }

    #[test]
    fn test_request_has_exactly_four_parts() {
        let protocol = ResourceFlowProtocol::default();
        let ctx = ExecutionContext::new().with_variable("orderId", json!("o-1"));
        let step = StepDescription::new("fetch", StepKind::Tool)
            .with_node("review")
            .with_tool("http_get")
            .with_inputs(json!({"url": "https://example.test"}));
        let mut options = Map::new();
        options.insert("priority".to_string(), json!("high"));

        let (request, record) = protocol
            .build_tier_request(&run(), &ctx, &step, &parent(), options)
            .unwrap();
        let value = serde_json::to_value(&request).unwrap();

        let mut keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["allocation", "context", "input", "options"]);
        assert_eq!(value["context"]["runId"], "run-42");
        assert_eq!(value["context"]["organizationId"], "org-9");
        assert_eq!(value["context"]["variables"]["orderId"], "o-1");
        assert_eq!(value["input"]["stepType"], "tool");
        assert_eq!(value["input"]["toolName"], "http_get");
        assert!(value["input"].get("estimatedComplexity").is_none());
        assert_eq!(value["allocation"]["maxCredits"], json!("1000"));
        assert_eq!(value["allocation"]["maxDurationMs"], json!(30_000));
        assert_eq!(value["allocation"]["maxMemoryMB"], json!(256));
        assert_eq!(value["allocation"]["maxConcurrentSteps"], json!(1));
        assert_eq!(value["options"]["priority"], "high");
        assert_eq!(record.parent_allocation_id, "root");

        let back: TierExecutionRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_unknown_top_level_part_is_rejected() {
        let raw = json!({
            "context": {
                "runId": "r",
                "routineVersionId": "v",
                "userId": "u",
                "organizationId": "o"
            },
            "input": {"stepId": "s", "stepType": "data"},
            "allocation": {
                "maxCredits": "10",
                "maxDurationMs": 1,
                "maxMemoryMB": 1,
                "maxConcurrentSteps": 1
            },
            "options": {},
            "extra": true
        });
        assert!(serde_json::from_value::<TierExecutionRequest>(raw).is_err());
    }

    #[test]
    fn test_failed_allocation_builds_nothing() {
        let protocol = ResourceFlowProtocol::default();
        let small = ParentAllocation::root("root", ResourceAllocation::new(100u64, 5_000, 64, 1));
        let step = StepDescription::new("think", StepKind::Llm);
        let err = protocol
            .build_tier_request(&run(), &ExecutionContext::new(), &step, &small, Map::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientResources(_)));
    }
}
