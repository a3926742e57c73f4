//! The fixed tool catalog and system directive.
//!
//! The catalog is part of the observable contract: the model is
//! prompted to choose among exactly these five tools, and the turn loop
//! dispatches on their names.

use serde_json::{json, Value};

/// Strategic breakdown and coordination.
pub const CONSULT_PLANNER: &str = "consult-planner";

/// Analysis over existing code snapshots.
pub const CONSULT_RESEARCHER: &str = "consult-researcher";

/// Hand off an implementation job to a worker.
pub const ASSIGN_TASK: &str = "assign-task";

/// Liveness query against the status registry.
pub const CHECK_AGENT_STATUS: &str = "check-agent-status";

/// Request a user decision.
pub const ESCALATE_TO_HUMAN: &str = "escalate-to-human";

/// The agent a consultation tool targets, if the tool is one.
pub fn consult_target(tool: &str) -> Option<&'static str> {
    match tool {
        CONSULT_PLANNER => Some("planner"),
        CONSULT_RESEARCHER => Some("researcher"),
        _ => None,
    }
}

/// System directive for every turn: role, workflow, tools, style, and
/// error stance.
pub const SYSTEM_PROMPT: &str = "\
You are the coordinator of a team of specialist agents working on a software \
project. You talk to the human operator and delegate to your team over a \
message bus.

Workflow principles:
- Understand the request before acting. Ask the researcher before assuming \
what exists in the codebase, and the planner before breaking down large work.
- Assign implementation work to the frontend or backend worker with a \
complete, self-contained command document; workers run unattended.
- One concern per tool call. Collect what you need, then answer.
- When a decision genuinely belongs to the human, escalate instead of \
guessing.

Tools available: consult-planner, consult-researcher, assign-task, \
check-agent-status, escalate-to-human.

Communication style: concise and concrete. Report what you did, what you \
found, and what happens next. Do not invent results for work you have not \
delegated or observed.

Errors: tool results marked as errors describe a failure (an agent timing \
out, a worker being busy). Summarize the failure for the operator and \
suggest the obvious next step rather than retrying silently.";

/// The five tool definitions, in the provider's schema format.
pub fn tool_catalog() -> Vec<Value> {
    vec![
        json!({
            "name": CONSULT_PLANNER,
            "description": "Ask the planner agent for strategic breakdown and coordination of work.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "question": {"type": "string", "description": "What to ask the planner"},
                    "context": {"type": "string", "description": "Relevant background"},
                    "priority": {"type": "string", "enum": ["low", "medium", "high"]}
                },
                "required": ["question"]
            }
        }),
        json!({
            "name": CONSULT_RESEARCHER,
            "description": "Ask the researcher agent to analyze existing code snapshots.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "question": {"type": "string", "description": "What to investigate"},
                    "repos": {"type": "string", "enum": ["frontend", "backend", "both"]},
                    "focus_areas": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Specific areas to inspect"
                    }
                },
                "required": ["question", "repos"]
            }
        }),
        json!({
            "name": ASSIGN_TASK,
            "description": "Hand an implementation job to a worker agent. Returns immediately; the worker reports progress and completion over the bus.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "agent": {"type": "string", "enum": ["frontend", "backend"]},
                    "command_file": {
                        "type": "string",
                        "description": "Complete command document the worker executes"
                    },
                    "priority": {"type": "string", "enum": ["low", "medium", "high"]},
                    "estimated_duration": {"type": "string"}
                },
                "required": ["agent", "command_file"]
            }
        }),
        json!({
            "name": CHECK_AGENT_STATUS,
            "description": "Check whether an agent is alive and what it is doing.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "agent": {"type": "string", "description": "Agent name to check"}
                },
                "required": ["agent"]
            }
        }),
        json!({
            "name": ESCALATE_TO_HUMAN,
            "description": "Put a decision in front of the human operator.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "context": {"type": "string"},
                    "options": {"type": "array", "items": {"type": "string"}},
                    "recommendation": {"type": "string"}
                },
                "required": ["question", "context"]
            }
        }),
    ]
}

/// Render an escalation into the structured string handed back to the
/// model as the tool result.
pub fn format_escalation(input: &Value) -> String {
    let question = input.get("question").and_then(|v| v.as_str()).unwrap_or("");
    let context = input.get("context").and_then(|v| v.as_str()).unwrap_or("");

    let mut out = String::from("DECISION NEEDED FROM HUMAN\n");
    out.push_str(&format!("Question: {question}\n"));
    out.push_str(&format!("Context: {context}\n"));

    if let Some(options) = input.get("options").and_then(|v| v.as_array()) {
        out.push_str("Options:\n");
        for (i, option) in options.iter().enumerate() {
            let text = option.as_str().unwrap_or("");
            out.push_str(&format!("  {}. {text}\n", i + 1));
        }
    }
    if let Some(rec) = input.get("recommendation").and_then(|v| v.as_str()) {
        out.push_str(&format!("Recommendation: {rec}\n"));
    }
    out.push_str("Present this to the user and wait for their decision.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_exactly_five_tools() {
        let catalog = tool_catalog();
        let names: Vec<&str> = catalog
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                CONSULT_PLANNER,
                CONSULT_RESEARCHER,
                ASSIGN_TASK,
                CHECK_AGENT_STATUS,
                ESCALATE_TO_HUMAN,
            ]
        );
    }

    #[test]
    fn every_tool_has_schema_and_required_fields() {
        for tool in tool_catalog() {
            assert!(tool["description"].as_str().is_some());
            assert_eq!(tool["input_schema"]["type"], "object");
            assert!(tool["input_schema"]["required"].as_array().is_some());
        }
    }

    #[test]
    fn consult_targets() {
        assert_eq!(consult_target(CONSULT_PLANNER), Some("planner"));
        assert_eq!(consult_target(CONSULT_RESEARCHER), Some("researcher"));
        assert_eq!(consult_target(ASSIGN_TASK), None);
        assert_eq!(consult_target("bogus"), None);
    }

    #[test]
    fn escalation_formats_all_parts() {
        let input = serde_json::json!({
            "question": "Which database?",
            "context": "Both fit the workload.",
            "options": ["postgres", "sqlite"],
            "recommendation": "postgres"
        });
        let text = format_escalation(&input);
        assert!(text.contains("Question: Which database?"));
        assert!(text.contains("Context: Both fit the workload."));
        assert!(text.contains("1. postgres"));
        assert!(text.contains("2. sqlite"));
        assert!(text.contains("Recommendation: postgres"));
    }

    #[test]
    fn escalation_without_options_omits_section() {
        let input = serde_json::json!({"question": "q", "context": "c"});
        let text = format_escalation(&input);
        assert!(!text.contains("Options:"));
        assert!(!text.contains("Recommendation:"));
    }
}
