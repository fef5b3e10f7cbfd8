use super::dto::*;
use super::timer::{parse_iso8601_duration, parse_timer_date};
use crate::condition::Condition;
use crate::error::ValidationIssue;
use std::collections::HashSet;

/// Validate a ProcessDefinitionDto before graph construction. Returns all
/// issues found, across every nesting level.
pub fn validate_definition(dto: &ProcessDefinitionDto) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    // V1: Definition id must be present
    if dto.id.trim().is_empty() {
        issues.push(issue("V1", "Definition id is empty".to_string()));
    }

    validate_scope(
        "process",
        &dto.nodes,
        &dto.flows,
        &mut seen_ids,
        &mut issues,
    );

    for sub in &dto.event_subprocesses {
        validate_event_subprocess(sub, &mut seen_ids, &mut issues);
    }

    issues
}

fn issue(rule: &'static str, message: String) -> ValidationIssue {
    ValidationIssue { rule, message }
}

fn validate_event_subprocess(
    sub: &EventSubprocessDto,
    seen_ids: &mut HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    if sub.id.trim().is_empty() {
        issues.push(issue("V1", "Event subprocess id is empty".to_string()));
    }
    claim_id(&sub.id, seen_ids, issues);

    let scope = format!("event subprocess {}", sub.id);
    validate_scope(&scope, &sub.nodes, &sub.flows, seen_ids, issues);

    // V4: Exactly one start event
    let starts: Vec<&NodeDto> = sub
        .nodes
        .iter()
        .filter(|n| matches!(n, NodeDto::StartEvent { .. }))
        .collect();
    if starts.len() != 1 {
        issues.push(issue(
            "V4",
            format!(
                "Event subprocess {}: expected exactly one start event, found {}",
                sub.id,
                starts.len()
            ),
        ));
    }

    // V5: The start event carries a trigger
    for start in &starts {
        if let NodeDto::StartEvent { id, trigger, .. } = start {
            match trigger {
                Some(t) => validate_trigger(id, t, issues),
                None => issues.push(issue(
                    "V5",
                    format!(
                        "Event subprocess {}: start event {} has no trigger",
                        sub.id, id
                    ),
                )),
            }
        }
    }

    // V6: At least one end event
    if !sub
        .nodes
        .iter()
        .any(|n| matches!(n, NodeDto::EndEvent { .. }))
    {
        issues.push(issue(
            "V6",
            format!("Event subprocess {}: no end event", sub.id),
        ));
    }

    for nested in &sub.event_subprocesses {
        validate_event_subprocess(nested, seen_ids, issues);
    }
}

fn claim_id(id: &str, seen_ids: &mut HashSet<String>, issues: &mut Vec<ValidationIssue>) {
    // V2: Ids are unique across the whole definition
    if !seen_ids.insert(id.to_string()) {
        issues.push(issue("V2", format!("Duplicate element id: {}", id)));
    }
}

fn validate_scope(
    scope: &str,
    nodes: &[NodeDto],
    flows: &[FlowDto],
    seen_ids: &mut HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut local: HashSet<&str> = HashSet::new();
    for node in nodes {
        if node.id().trim().is_empty() {
            issues.push(issue("V1", format!("{}: node with empty id", scope)));
        }
        claim_id(node.id(), seen_ids, issues);
        local.insert(node.id());
    }

    for flow in flows {
        let flow_id = flow.effective_id();
        claim_id(&flow_id, seen_ids, issues);

        // V3: Flow endpoints live in the same scope
        for (end, target) in [("from", &flow.from), ("to", &flow.to)] {
            if !local.contains(target.as_str()) {
                issues.push(issue(
                    "V3",
                    format!(
                        "{}: flow {} {} '{}' is not a node of this scope",
                        scope, flow_id, end, target
                    ),
                ));
            }
        }

        // V9: Flow conditions parse
        if let Some(cond) = &flow.condition {
            if let Err(e) = Condition::parse(cond) {
                issues.push(issue("V9", format!("{}: flow {}: {}", scope, flow_id, e)));
            }
        }
    }
}

fn validate_trigger(node_id: &str, trigger: &TriggerDto, issues: &mut Vec<ValidationIssue>) {
    match trigger {
        TriggerDto::Timer {
            duration,
            duration_ms,
            date,
        } => {
            // V8: Exactly one timer form, and it parses
            let forms = [duration.is_some(), duration_ms.is_some(), date.is_some()]
                .iter()
                .filter(|set| **set)
                .count();
            if forms != 1 {
                issues.push(issue(
                    "V8",
                    format!(
                        "Start event {}: timer needs one duration or date form, found {}",
                        node_id, forms
                    ),
                ));
            }
            if let Some(d) = duration {
                if let Err(e) = parse_iso8601_duration(d) {
                    issues.push(issue("V8", format!("Start event {}: {}", node_id, e)));
                }
            }
            if let Some(d) = date {
                if let Err(e) = parse_timer_date(d) {
                    issues.push(issue("V8", format!("Start event {}: {}", node_id, e)));
                }
            }
        }
        // V7: References are non-empty
        TriggerDto::Message { message_ref } => {
            require_ref(node_id, "message_ref", Some(message_ref), issues)
        }
        TriggerDto::Signal { signal_ref } => {
            require_ref(node_id, "signal_ref", Some(signal_ref), issues)
        }
        TriggerDto::Error { error_ref } => {
            if error_ref.is_some() {
                require_ref(node_id, "error_ref", error_ref.as_ref(), issues)
            }
        }
        TriggerDto::Escalation { escalation_ref } => {
            if escalation_ref.is_some() {
                require_ref(node_id, "escalation_ref", escalation_ref.as_ref(), issues)
            }
        }
        TriggerDto::Conditional { condition } => {
            // V9: Condition parses
            if let Err(e) = Condition::parse(condition) {
                issues.push(issue("V9", format!("Start event {}: {}", node_id, e)));
            }
        }
    }
}

fn require_ref(
    node_id: &str,
    field: &str,
    value: Option<&String>,
    issues: &mut Vec<ValidationIssue>,
) {
    if value.map_or(true, |v| v.trim().is_empty()) {
        issues.push(issue(
            "V7",
            format!("Start event {}: {} is empty", node_id, field),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ProcessDefinitionDto {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn rules(issues: &[ValidationIssue]) -> Vec<&'static str> {
        issues.iter().map(|i| i.rule).collect()
    }

    #[test]
    fn test_valid_definition_has_no_issues() {
        let dto = parse(
            r#"
id: order
nodes:
  - { kind: StartEvent, id: start }
  - { kind: Task, id: work }
  - { kind: EndEvent, id: end }
flows:
  - { from: start, to: work }
  - { from: work, to: end }
event_subprocesses:
  - id: TimeoutHandler
    nodes:
      - kind: StartEvent
        id: TimerStart
        trigger: { type: timer, duration: PT5M }
      - { kind: EndEvent, id: TimeoutEnd }
    flows:
      - { from: TimerStart, to: TimeoutEnd }
"#,
        );
        assert!(validate_definition(&dto).is_empty());
    }

    #[test]
    fn test_duplicate_ids_across_scopes() {
        let dto = parse(
            r#"
id: dup
nodes:
  - { kind: StartEvent, id: start }
event_subprocesses:
  - id: esp
    nodes:
      - kind: StartEvent
        id: start
        trigger: { type: signal, signal_ref: go }
      - { kind: EndEvent, id: esp_end }
"#,
        );
        assert_eq!(rules(&validate_definition(&dto)), vec!["V2"]);
    }

    #[test]
    fn test_flow_cannot_cross_scope() {
        let dto = parse(
            r#"
id: cross
nodes:
  - { kind: Task, id: main_task }
event_subprocesses:
  - id: esp
    nodes:
      - kind: StartEvent
        id: esp_start
        trigger: { type: message, message_ref: m }
      - { kind: EndEvent, id: esp_end }
    flows:
      - { from: esp_start, to: main_task }
"#,
        );
        assert_eq!(rules(&validate_definition(&dto)), vec!["V3"]);
    }

    #[test]
    fn test_subprocess_structure_rules() {
        let dto = parse(
            r#"
id: broken
event_subprocesses:
  - id: no_trigger
    nodes:
      - { kind: StartEvent, id: s1 }
      - { kind: EndEvent, id: e1 }
  - id: no_end
    nodes:
      - kind: StartEvent
        id: s2
        trigger: { type: message, message_ref: "" }
  - id: no_start
    nodes:
      - { kind: EndEvent, id: e3 }
"#,
        );
        let found = rules(&validate_definition(&dto));
        assert!(found.contains(&"V4"));
        assert!(found.contains(&"V5"));
        assert!(found.contains(&"V6"));
        assert!(found.contains(&"V7"));
    }

    #[test]
    fn test_timer_and_condition_rules() {
        let dto = parse(
            r#"
id: timers
nodes:
  - { kind: StartEvent, id: start }
  - { kind: EndEvent, id: end }
flows:
  - { from: start, to: end, condition: "a ==" }
event_subprocesses:
  - id: t
    nodes:
      - kind: StartEvent
        id: ts
        trigger: { type: timer, duration: "five minutes" }
      - { kind: EndEvent, id: te }
  - id: both
    nodes:
      - kind: StartEvent
        id: bs
        trigger: { type: timer, duration: PT1M, duration_ms: 60000 }
      - { kind: EndEvent, id: be }
  - id: c
    nodes:
      - kind: StartEvent
        id: cs
        trigger: { type: conditional, condition: "&&" }
      - { kind: EndEvent, id: ce }
"#,
        );
        let found = rules(&validate_definition(&dto));
        assert_eq!(found.iter().filter(|r| **r == "V8").count(), 2);
        assert_eq!(found.iter().filter(|r| **r == "V9").count(), 2);
    }

    #[test]
    fn test_empty_definition_id() {
        let dto = parse("id: \"\"\n");
        assert_eq!(rules(&validate_definition(&dto)), vec!["V1"]);
    }
}
