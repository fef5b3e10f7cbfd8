//! Process Model
//!
//! Loads a process definition (YAML, JSON, or an already-decoded DTO) into an
//! addressable graph and answers the structural queries the monitor and the
//! orchestrator need: element lookup, incoming/outgoing flows, event
//! subprocess membership, trigger extraction and interruption semantics.
//!
//! Loading is all-or-nothing: a definition that fails validation produces a
//! `DefinitionError` and no model.

pub mod dto;
pub mod timer;
pub mod trigger;
pub mod validate;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::condition::Condition;
use crate::error::{DefinitionError, EngineError, EngineResult, ValidationIssue};
use dto::{EventSubprocessDto, FlowDto, NodeDto, ProcessDefinitionDto, TriggerDto};
use timer::{parse_iso8601_duration, parse_timer_date, TimerSpec};
pub use trigger::{TriggerDefinition, TriggerKind};
use validate::validate_definition;

// ─── Graph elements ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    Task { task_type: Option<String> },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    IntermediateEvent,
}

#[derive(Debug, Clone)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Enclosing event subprocess; `None` for the main process.
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SequenceFlow {
    pub id: String,
    pub from: String,
    pub to: String,
    pub condition: Option<Condition>,
    pub is_default: bool,
    pub scope: Option<String>,
}

impl SequenceFlow {
    fn holds(&self, variables: &BTreeMap<String, Value>) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |c| c.evaluate(variables))
    }
}

/// A nested flow that starts only when its trigger fires.
#[derive(Debug, Clone)]
pub struct EventSubprocessDef {
    pub id: String,
    pub name: Option<String>,
    /// Enclosing event subprocess; `None` when attached to the main process.
    pub container: Option<String>,
    pub interrupting: bool,
    pub start_node: String,
    pub trigger: TriggerDefinition,
    pub end_nodes: Vec<String>,
    pub node_ids: Vec<String>,
}

/// Any addressable element of the definition.
#[derive(Debug, Clone, Copy)]
pub enum Element<'a> {
    Node(&'a FlowNode),
    Flow(&'a SequenceFlow),
    EventSubprocess(&'a EventSubprocessDef),
}

// ─── Process model ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProcessModel {
    id: String,
    name: Option<String>,
    nodes: Vec<FlowNode>,
    flows: Vec<SequenceFlow>,
    /// Depth-first declaration order.
    subprocesses: Vec<EventSubprocessDef>,
    graph: DiGraph<usize, usize>,
    node_index: HashMap<String, NodeIndex>,
    flow_index: HashMap<String, usize>,
    subprocess_index: HashMap<String, usize>,
}

impl ProcessModel {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DefinitionError> {
        let dto: ProcessDefinitionDto = serde_yaml::from_str(yaml)?;
        Self::from_dto(&dto)
    }

    pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
        let dto: ProcessDefinitionDto = serde_json::from_str(json)?;
        Self::from_dto(&dto)
    }

    pub fn from_json_value(value: Value) -> Result<Self, DefinitionError> {
        let dto: ProcessDefinitionDto = serde_json::from_value(value)?;
        Self::from_dto(&dto)
    }

    /// Load from a file; `.json` is decoded as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    /// Validate and build the graph.
    pub fn from_dto(dto: &ProcessDefinitionDto) -> Result<Self, DefinitionError> {
        let issues = validate_definition(dto);
        if !issues.is_empty() {
            return Err(DefinitionError::Invalid(issues));
        }

        let mut model = ProcessModel {
            id: dto.id.clone(),
            name: dto.name.clone(),
            nodes: Vec::new(),
            flows: Vec::new(),
            subprocesses: Vec::new(),
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            flow_index: HashMap::new(),
            subprocess_index: HashMap::new(),
        };

        model.add_scope(None, &dto.nodes, &dto.flows)?;
        for sub in &dto.event_subprocesses {
            model.add_event_subprocess(None, sub)?;
        }

        tracing::debug!(
            definition = %model.id,
            nodes = model.nodes.len(),
            flows = model.flows.len(),
            event_subprocesses = model.subprocesses.len(),
            "Loaded process model"
        );
        Ok(model)
    }

    fn add_scope(
        &mut self,
        scope: Option<&str>,
        nodes: &[NodeDto],
        flows: &[FlowDto],
    ) -> Result<(), DefinitionError> {
        for node in nodes {
            let kind = match node {
                NodeDto::StartEvent { .. } => NodeKind::StartEvent,
                NodeDto::EndEvent { .. } => NodeKind::EndEvent,
                NodeDto::Task { task_type, .. } => NodeKind::Task {
                    task_type: task_type.clone(),
                },
                NodeDto::ExclusiveGateway { .. } => NodeKind::ExclusiveGateway,
                NodeDto::ParallelGateway { .. } => NodeKind::ParallelGateway,
                NodeDto::InclusiveGateway { .. } => NodeKind::InclusiveGateway,
                NodeDto::IntermediateEvent { .. } => NodeKind::IntermediateEvent,
            };
            let idx = self.graph.add_node(self.nodes.len());
            self.node_index.insert(node.id().to_string(), idx);
            self.nodes.push(FlowNode {
                id: node.id().to_string(),
                name: node.name().map(str::to_string),
                kind,
                scope: scope.map(str::to_string),
            });
        }

        for flow in flows {
            let id = flow.effective_id();
            let condition = flow
                .condition
                .as_deref()
                .map(Condition::parse)
                .transpose()
                .map_err(|e| invalid("V9", format!("flow {}: {}", id, e)))?;
            let (from, to) = match (
                self.node_index.get(&flow.from),
                self.node_index.get(&flow.to),
            ) {
                (Some(f), Some(t)) => (*f, *t),
                _ => return Err(invalid("V3", format!("flow {} has a dangling endpoint", id))),
            };
            self.graph.add_edge(from, to, self.flows.len());
            self.flow_index.insert(id.clone(), self.flows.len());
            self.flows.push(SequenceFlow {
                id,
                from: flow.from.clone(),
                to: flow.to.clone(),
                condition,
                is_default: flow.is_default,
                scope: scope.map(str::to_string),
            });
        }
        Ok(())
    }

    fn add_event_subprocess(
        &mut self,
        container: Option<&str>,
        sub: &EventSubprocessDto,
    ) -> Result<(), DefinitionError> {
        self.add_scope(Some(&sub.id), &sub.nodes, &sub.flows)?;

        let (start_node, trigger_dto) = sub
            .nodes
            .iter()
            .find_map(|n| match n {
                NodeDto::StartEvent {
                    id,
                    trigger: Some(t),
                    ..
                } => Some((id.clone(), t)),
                _ => None,
            })
            .ok_or_else(|| invalid("V5", format!("event subprocess {} has no trigger", sub.id)))?;
        let trigger = trigger_from_dto(&start_node, trigger_dto)?;

        let end_nodes = sub
            .nodes
            .iter()
            .filter(|n| matches!(n, NodeDto::EndEvent { .. }))
            .map(|n| n.id().to_string())
            .collect();

        self.subprocess_index
            .insert(sub.id.clone(), self.subprocesses.len());
        self.subprocesses.push(EventSubprocessDef {
            id: sub.id.clone(),
            name: sub.name.clone(),
            container: container.map(str::to_string),
            interrupting: sub.interrupting(),
            start_node,
            trigger,
            end_nodes,
            node_ids: sub.nodes.iter().map(|n| n.id().to_string()).collect(),
        });

        for nested in &sub.event_subprocesses {
            self.add_event_subprocess(Some(&sub.id), nested)?;
        }
        Ok(())
    }

    // ── Queries ──

    /// Definition id; used as the routine id of produced locations.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Look up any element (node, flow, event subprocess) by id.
    pub fn element(&self, id: &str) -> Option<Element<'_>> {
        if let Some(node) = self.node(id) {
            return Some(Element::Node(node));
        }
        if let Some(flow) = self.flow(id) {
            return Some(Element::Flow(flow));
        }
        self.event_subprocess(id).map(Element::EventSubprocess)
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.node_index
            .get(id)
            .map(|idx| &self.nodes[self.graph[*idx]])
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flow_index.get(id).map(|i| &self.flows[*i])
    }

    /// Outgoing flows of a node, in declaration order.
    pub fn outgoing_flows(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows_directed(node_id, Direction::Outgoing)
    }

    /// Incoming flows of a node, in declaration order.
    pub fn incoming_flows(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows_directed(node_id, Direction::Incoming)
    }

    fn flows_directed(&self, node_id: &str, direction: Direction) -> Vec<&SequenceFlow> {
        let Some(idx) = self.node_index.get(node_id) else {
            return Vec::new();
        };
        let mut indices: Vec<usize> = self
            .graph
            .edges_directed(*idx, direction)
            .map(|e| *e.weight())
            .collect();
        indices.sort_unstable();
        indices.into_iter().map(|i| &self.flows[i]).collect()
    }

    /// All event subprocesses, depth-first in declaration order.
    pub fn event_subprocesses(&self) -> &[EventSubprocessDef] {
        &self.subprocesses
    }

    pub fn event_subprocess(&self, id: &str) -> Option<&EventSubprocessDef> {
        self.subprocess_index.get(id).map(|i| &self.subprocesses[*i])
    }

    /// Event subprocess a node belongs to; `None` for main-process nodes and
    /// unknown ids.
    pub fn subprocess_of(&self, node_id: &str) -> Option<&str> {
        self.node(node_id).and_then(|n| n.scope.as_deref())
    }

    /// `scope` followed by each enclosing scope, ending with the main process.
    pub fn scope_chain(&self, scope: Option<&str>) -> Vec<Option<String>> {
        let mut chain = vec![scope.map(str::to_string)];
        let mut current = scope.and_then(|s| self.event_subprocess(s));
        while let Some(sub) = current {
            chain.push(sub.container.clone());
            current = sub.container.as_deref().and_then(|c| self.event_subprocess(c));
        }
        chain
    }

    pub fn trigger_definition(&self, subprocess_id: &str) -> EngineResult<&TriggerDefinition> {
        self.event_subprocess(subprocess_id)
            .map(|s| &s.trigger)
            .ok_or_else(|| EngineError::subprocess_not_found(subprocess_id))
    }

    pub fn is_interrupting(&self, subprocess_id: &str) -> EngineResult<bool> {
        self.event_subprocess(subprocess_id)
            .map(|s| s.interrupting)
            .ok_or_else(|| EngineError::subprocess_not_found(subprocess_id))
    }

    pub fn is_end_event(&self, node_id: &str) -> bool {
        self.node(node_id)
            .is_some_and(|n| n.kind == NodeKind::EndEvent)
    }

    /// Ordinary sequence-flow traversal from `node_id`, staying inside the
    /// node's own scope.
    ///
    /// Exclusive gateways take the first satisfied flow, else the default.
    /// Parallel gateways take every flow. Everything else takes every
    /// satisfied flow, falling back to the default when none is satisfied.
    pub fn next_nodes(
        &self,
        node_id: &str,
        variables: &BTreeMap<String, Value>,
    ) -> EngineResult<Vec<&FlowNode>> {
        let node = self
            .node(node_id)
            .ok_or_else(|| EngineError::node_not_found(node_id))?;
        let outgoing = self.outgoing_flows(node_id);
        let default = outgoing.iter().find(|f| f.is_default).copied();

        let taken: Vec<&SequenceFlow> = match node.kind {
            NodeKind::ParallelGateway => outgoing,
            NodeKind::ExclusiveGateway => outgoing
                .iter()
                .find(|f| !f.is_default && f.holds(variables))
                .copied()
                .or(default)
                .into_iter()
                .collect(),
            _ => {
                let satisfied: Vec<&SequenceFlow> = outgoing
                    .iter()
                    .filter(|f| !f.is_default && f.holds(variables))
                    .copied()
                    .collect();
                if satisfied.is_empty() {
                    default.into_iter().collect()
                } else {
                    satisfied
                }
            }
        };

        Ok(taken
            .into_iter()
            .filter(|f| f.scope == node.scope)
            .filter_map(|f| self.node(&f.to))
            .collect())
    }
}

fn invalid(rule: &'static str, message: String) -> DefinitionError {
    DefinitionError::Invalid(vec![ValidationIssue { rule, message }])
}

fn trigger_from_dto(node_id: &str, dto: &TriggerDto) -> Result<TriggerDefinition, DefinitionError> {
    Ok(match dto {
        TriggerDto::Timer {
            duration,
            duration_ms,
            date,
        } => {
            let spec = match (duration, duration_ms, date) {
                (Some(d), None, None) => TimerSpec::Duration {
                    ms: parse_iso8601_duration(d).map_err(|e| invalid("V8", e))?,
                },
                (None, Some(ms), None) => TimerSpec::Duration { ms: *ms },
                (None, None, Some(d)) => {
                    TimerSpec::Date(parse_timer_date(d).map_err(|e| invalid("V8", e))?)
                }
                _ => {
                    return Err(invalid(
                        "V8",
                        format!("start event {} has an ambiguous timer", node_id),
                    ))
                }
            };
            TriggerDefinition::Timer(spec)
        }
        TriggerDto::Message { message_ref } => TriggerDefinition::Message {
            message_ref: message_ref.clone(),
        },
        TriggerDto::Signal { signal_ref } => TriggerDefinition::Signal {
            signal_ref: signal_ref.clone(),
        },
        TriggerDto::Error { error_ref } => TriggerDefinition::Error {
            error_ref: error_ref.clone(),
        },
        TriggerDto::Escalation { escalation_ref } => TriggerDefinition::Escalation {
            escalation_ref: escalation_ref.clone(),
        },
        TriggerDto::Conditional { condition } => TriggerDefinition::Conditional(
            Condition::parse(condition)
                .map_err(|e| invalid("V9", format!("start event {}: {}", node_id, e)))?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_PROCESS: &str = r#"
id: order-process
name: Order handling
nodes:
  - { kind: StartEvent, id: start }
  - { kind: Task, id: review, task_type: llm }
  - { kind: ExclusiveGateway, id: decide }
  - { kind: Task, id: ship }
  - { kind: Task, id: reject }
  - { kind: EndEvent, id: end }
flows:
  - { id: f1, from: start, to: review }
  - { id: f2, from: review, to: decide }
  - { id: f3, from: decide, to: ship, condition: "approved == true" }
  - { id: f4, from: decide, to: reject, is_default: true }
  - { id: f5, from: ship, to: end }
  - { id: f6, from: reject, to: end }
event_subprocesses:
  - id: TimeoutHandler
    nodes:
      - kind: StartEvent
        id: TimerStart
        trigger: { type: timer, duration: PT5M }
      - { kind: Task, id: notify }
      - { kind: EndEvent, id: TimeoutEnd }
    flows:
      - { from: TimerStart, to: notify }
      - { from: notify, to: TimeoutEnd }
  - id: CancelHandler
    cancelActivity: false
    nodes:
      - kind: StartEvent
        id: CancelStart
        trigger: { type: message, messageRef: OrderCancelled }
      - { kind: EndEvent, id: CancelEnd }
    flows:
      - { from: CancelStart, to: CancelEnd }
    event_subprocesses:
      - id: AuditHandler
        nodes:
          - kind: StartEvent
            id: AuditStart
            trigger: { type: signal, signal_ref: audit }
          - { kind: EndEvent, id: AuditEnd }
        flows:
          - { from: AuditStart, to: AuditEnd }
"#;

    fn model() -> ProcessModel {
        ProcessModel::from_yaml_str(ORDER_PROCESS).unwrap()
    }

    #[test]
    fn test_element_lookup() {
        let m = model();
        assert_eq!(m.id(), "order-process");
        assert!(matches!(m.element("review"), Some(Element::Node(_))));
        assert!(matches!(m.element("f3"), Some(Element::Flow(_))));
        assert!(matches!(
            m.element("TimeoutHandler"),
            Some(Element::EventSubprocess(_))
        ));
        assert!(m.element("nope").is_none());
        assert!(matches!(
            m.node("review").map(|n| &n.kind),
            Some(NodeKind::Task { task_type: Some(t) }) if t == "llm"
        ));
    }

    #[test]
    fn test_flow_lookup_in_declaration_order() {
        let m = model();
        let out: Vec<&str> = m.outgoing_flows("decide").iter().map(|f| f.id.as_str()).collect();
        assert_eq!(out, vec!["f3", "f4"]);
        let inc: Vec<&str> = m.incoming_flows("end").iter().map(|f| f.id.as_str()).collect();
        assert_eq!(inc, vec!["f5", "f6"]);
        assert!(m.outgoing_flows("missing").is_empty());
    }

    #[test]
    fn test_membership_and_scope_chain() {
        let m = model();
        assert_eq!(m.subprocess_of("notify"), Some("TimeoutHandler"));
        assert_eq!(m.subprocess_of("review"), None);
        assert_eq!(m.subprocess_of("AuditEnd"), Some("AuditHandler"));
        assert_eq!(
            m.scope_chain(Some("AuditHandler")),
            vec![
                Some("AuditHandler".to_string()),
                Some("CancelHandler".to_string()),
                None
            ]
        );
        let order: Vec<&str> = m.event_subprocesses().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["TimeoutHandler", "CancelHandler", "AuditHandler"]);
    }

    #[test]
    fn test_trigger_extraction_and_interruption() {
        let m = model();
        assert_eq!(
            m.trigger_definition("TimeoutHandler").unwrap(),
            &TriggerDefinition::Timer(TimerSpec::Duration { ms: 300_000 })
        );
        assert_eq!(
            m.trigger_definition("CancelHandler").unwrap().kind(),
            TriggerKind::Message
        );
        assert!(m.is_interrupting("TimeoutHandler").unwrap());
        assert!(!m.is_interrupting("CancelHandler").unwrap());
        assert!(m.is_interrupting("AuditHandler").unwrap());
        assert!(matches!(
            m.trigger_definition("Nope"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_exclusive_gateway_traversal() {
        let m = model();
        let approved: BTreeMap<String, Value> = [("approved".to_string(), json!(true))].into();
        let next: Vec<&str> = m
            .next_nodes("decide", &approved)
            .unwrap()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(next, vec!["ship"]);

        let next: Vec<&str> = m
            .next_nodes("decide", &BTreeMap::new())
            .unwrap()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(next, vec!["reject"]);
        assert!(m.next_nodes("end", &BTreeMap::new()).unwrap().is_empty());
        assert!(m.next_nodes("ghost", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_parallel_and_inclusive_traversal() {
        let m = ProcessModel::from_yaml_str(
            r#"
id: fork
nodes:
  - { kind: ParallelGateway, id: split }
  - { kind: InclusiveGateway, id: maybe }
  - { kind: Task, id: a }
  - { kind: Task, id: b }
  - { kind: Task, id: c }
flows:
  - { from: split, to: a }
  - { from: split, to: b, condition: "false" }
  - { from: maybe, to: a, condition: "x > 1" }
  - { from: maybe, to: b, condition: "x > 2" }
  - { from: maybe, to: c, is_default: true }
"#,
        )
        .unwrap();
        let ids = |nodes: Vec<&FlowNode>| nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(m.next_nodes("split", &BTreeMap::new()).unwrap()), vec!["a", "b"]);
        let x3: BTreeMap<String, Value> = [("x".to_string(), json!(3))].into();
        assert_eq!(ids(m.next_nodes("maybe", &x3).unwrap()), vec!["a", "b"]);
        let x0: BTreeMap<String, Value> = [("x".to_string(), json!(0))].into();
        assert_eq!(ids(m.next_nodes("maybe", &x0).unwrap()), vec!["c"]);
    }

    #[test]
    fn test_malformed_definition_is_rejected() {
        let err = ProcessModel::from_yaml_str("id: x\nnodes: [ { kind: Bogus, id: a } ]\n")
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Syntax(_)));

        let err = ProcessModel::from_yaml_str(
            r#"
id: x
event_subprocesses:
  - id: esp
    nodes:
      - { kind: StartEvent, id: s }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::Invalid(ref issues) if issues.len() == 2));
    }

    #[test]
    fn test_json_and_file_loading() {
        let m = ProcessModel::from_json_value(json!({
            "id": "json-def",
            "nodes": [{"kind": "StartEvent", "id": "s"}, {"kind": "EndEvent", "id": "e"}],
            "flows": [{"from": "s", "to": "e"}]
        }))
        .unwrap();
        assert_eq!(m.outgoing_flows("s")[0].id, "s->e");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.yaml");
        std::fs::write(&path, ORDER_PROCESS).unwrap();
        assert_eq!(ProcessModel::from_file(&path).unwrap().id(), "order-process");

        let missing = ProcessModel::from_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, DefinitionError::Io { .. }));
    }
}
