//! Model-facing text: the session system prompt, the corrective messages
//! the orchestrator injects, and the schemas of the conventional tools
//! it inspects itself.

use redraft_core::{Chunk, Phase, TaskFamily, ToolDefinition};
use serde_json::json;

pub const TOOL_UPDATE_PHASE: &str = "update_phase";
pub const TOOL_SUBMIT_ITEM: &str = "submit_item";
pub const TOOL_SET_TITLE: &str = "set_title";

/// How many missing ids a corrective prompt lists before eliding.
const MISSING_ID_PREVIEW: usize = 20;

fn family_goal(family: TaskFamily) -> &'static str {
    match family {
        TaskFamily::Translate => "translate every numbered item faithfully",
        TaskFamily::Proofread => "proofread the items and correct only those that need changes",
        TaskFamily::Summarize => "summarize the salient items of this slice",
    }
}

/// Session opener: the lifecycle contract, the conventional tools, and
/// the chunk itself.
#[must_use]
pub fn system_prompt(family: TaskFamily, chunk: &Chunk, planning_digest: Option<&str>) -> String {
    let phases = if family.has_review() {
        "planning -> working -> reviewing -> done"
    } else {
        "planning -> working -> done"
    };
    let mut prompt = format!(
        "You are processing one slice of a document. Your goal: {goal}.\n\
         \n\
         Lifecycle: {phases}. You start in 'planning'. Move between phases with the \
         '{update}' tool; only the listed order is legal. Submit each item's result with \
         the '{submit}' tool, using the item's id (or its position in this slice). \
         Resubmitting an id replaces the earlier result.\n\
         When narrating instead of calling tools, announce a phase on its own line as \
         '@@phase <name>' and introduce item content with '@@item <id>'. Never place item \
         content before entering the 'working' phase.\n\
         \n\
         The slice ({count} items):\n\n{text}",
        goal = family_goal(family),
        phases = phases,
        update = TOOL_UPDATE_PHASE,
        submit = TOOL_SUBMIT_ITEM,
        count = chunk.item_ids.len(),
        text = chunk.text,
    );
    if let Some(digest) = planning_digest {
        prompt.push_str(&format!(
            "\n\nPlanning notes from an earlier slice of the same document:\n{digest}"
        ));
    }
    prompt
}

#[must_use]
pub fn illegal_transition(requested: Phase, suggested: Phase) -> String {
    format!(
        "The move to '{requested}' is not allowed from the current phase. \
         The only legal next phase is '{suggested}'. Request that instead."
    )
}

#[must_use]
pub fn leave_planning(consecutive: u32) -> String {
    format!(
        "You have spent {consecutive} turns planning without starting the work. \
         Stop planning now: move to the 'working' phase immediately and begin \
         submitting item results."
    )
}

#[must_use]
pub fn produce_output(consecutive: u32) -> String {
    format!(
        "You have spent {consecutive} turns in 'working' without submitting a single \
         item. Produce output now: submit results for the items of this slice, \
         starting with the first one."
    )
}

#[must_use]
pub fn continue_missing(missing: &[String]) -> String {
    let shown: Vec<&str> = missing
        .iter()
        .take(MISSING_ID_PREVIEW)
        .map(String::as_str)
        .collect();
    let suffix = if missing.len() > shown.len() {
        format!(" and {} more", missing.len() - shown.len())
    } else {
        String::new()
    };
    format!(
        "Results are still missing for {} item(s): {}{}. Continue submitting them.",
        missing.len(),
        shown.join(", "),
        suffix
    )
}

#[must_use]
pub fn advance_to(next: Phase) -> String {
    format!(
        "All items of this slice are covered. If you have nothing to add, move to the \
         '{next}' phase now."
    )
}

#[must_use]
pub fn finish_review() -> String {
    "Review the submitted results. Resubmit any item that needs correction, then move \
     to 'done'."
        .to_string()
}

#[must_use]
pub fn degeneration_notice() -> String {
    "Your previous output degenerated into repetition and was discarded. Respond again, \
     concisely, without repeating characters or phrases."
        .to_string()
}

#[must_use]
pub fn protocol_notice(detail: &str) -> String {
    format!(
        "Your previous output was discarded: {detail}. Follow the lifecycle contract \
         and try again."
    )
}

/// Schemas for the three tools the orchestrator inspects itself. The
/// caller appends its own domain tools to these.
#[must_use]
pub fn conventional_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::function(
            TOOL_UPDATE_PHASE,
            "Move the session to the named lifecycle phase.",
            json!({
                "type": "object",
                "properties": {
                    "phase": {
                        "type": "string",
                        "enum": ["planning", "working", "reviewing", "done"],
                        "description": "Target phase."
                    }
                },
                "required": ["phase"]
            }),
        ),
        ToolDefinition::function(
            TOOL_SUBMIT_ITEM,
            "Submit the result for one item of the slice. Resubmitting an id replaces the earlier result.",
            json!({
                "type": "object",
                "properties": {
                    "id": {
                        "type": "string",
                        "description": "The item's id as shown in the slice."
                    },
                    "index": {
                        "type": "integer",
                        "description": "Alternative to id: the item's 1-based position within this slice."
                    },
                    "content": {
                        "type": "string",
                        "description": "The produced text for this item."
                    }
                },
                "required": ["content"]
            }),
        ),
        ToolDefinition::function(
            TOOL_SET_TITLE,
            "Record a short title for this slice of the document.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" }
                },
                "required": ["title"]
            }),
        ),
    ]
}
