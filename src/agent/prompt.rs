//! Prompt text and the structured reply contract
//!
//! The model answers every turn with a JSON object:
//!
//! ```json
//! {"thoughts": "...", "code": "...", "final_answer": false}
//! ```

use serde_json::Value as Json;

use crate::llm::json::strip_code_fences;
use crate::output::{cell_text, Bindings, DataTable, Value};

/// Longest return value echoed back to the model
pub const MAX_OBSERVATION_CHARS: usize = 4000;

/// Rows shown when a table is echoed back
const OBSERVATION_TABLE_ROWS: usize = 5;

/// Sample values listed per column in the context description
const SAMPLE_VALUES: usize = 3;

pub const NO_CODE_INSTRUCTION: &str = "You didn't generate any code. If you need to generate code to complete the task, \
please do so. Otherwise, if the task is complete, set final_answer to true.";

/// System prompt for a backend's language and capabilities
pub fn system_prompt(language: &str, capabilities: &str) -> String {
    let mut prompt = format!(
        r#"You are a {language} coding assistant that solves data questions iteratively.

Each turn you reason about what is known, write {language} code for the next step, and
decide whether the task is finished. You do not need to finish in one turn.

Set "final_answer" to false while exploration, verification or error fixing is still needed.
Set it to true only when the result is correct and nothing else must be computed.

Always reply with one JSON object with exactly these fields:
- "thoughts": short reasoning for this step
- "code": {language} code to run for this step (may be empty when you are done)
- "final_answer": true or false

Example:
{{"thoughts": "Inspect the data first.", "code": "df.head(5)", "final_answer": false}}

Execution environment:
- Variables listed under Context are already defined
- Variables you define stay available in later turns
- The value of the last expression is returned as the result
- Printed output is captured and shown to you
"#
    );
    if !capabilities.is_empty() {
        prompt.push_str("\nAvailable in this environment:\n");
        prompt.push_str(capabilities);
        prompt.push('\n');
    }
    prompt
}

/// First user turn: the request, a description of the bindings and the reply format
pub fn initial_prompt(user_prompt: &str, bindings: &Bindings, has_history: bool) -> String {
    let mut parts = vec![user_prompt.to_string()];

    if !bindings.is_empty() {
        parts.push("\nContext:".to_string());
        for (name, value) in bindings {
            parts.push(describe_binding(name, value));
        }
    }

    if has_history {
        parts.push(
            "\n\nReview the conversation history above. If relevant prior results exist, \
             use them directly instead of recomputing. Then address this request."
                .to_string(),
        );
    } else {
        parts.push("\n\nPlease think through the problem and generate code to solve it.".to_string());
    }

    parts.push("Return your response as JSON with these fields:".to_string());
    parts.push("- 'thoughts': Your reasoning about the problem".to_string());
    parts.push("- 'code': Code to execute".to_string());
    parts.push(
        "- 'final_answer': Set to true when the task is complete, false if you need more iterations".to_string(),
    );
    parts.join("\n")
}

/// One `- name: ...` line of the context description
pub fn describe_binding(name: &str, value: &Value) -> String {
    match value {
        v if v.is_scalar() => format!("- {}: {}", name, v),
        Value::Function(function) => format!("- {}: function {}", name, function),
        Value::Table(table) => format!("- {}: {}", name, describe_table(table)),
        Value::Series(series) => format!(
            "- {}: Series '{}' with {} values",
            name,
            series.display_name(),
            series.len()
        ),
        other => format!("- {}: <{} object>", name, other.type_name()),
    }
}

fn describe_table(table: &DataTable) -> String {
    let mut lines = vec![format!(
        "Table with {} rows and {} columns.",
        table.row_count(),
        table.column_count()
    )];
    lines.push("Columns:".to_string());
    for column in table.columns() {
        let sample: Vec<String> = column
            .values
            .iter()
            .take(SAMPLE_VALUES)
            .map(cell_text)
            .collect();
        lines.push(format!(
            "- {}: {}, Sample Data: [{}]",
            column.name,
            column.dtype.as_str(),
            sample.join(", ")
        ));
    }
    lines.join("\n")
}

/// Summary of a successful execution fed back to the model
pub fn success_observation(logs: &[String], output: &Value) -> String {
    let mut parts = vec!["Code executed successfully.".to_string()];
    if !logs.is_empty() {
        parts.push(format!("Stdout:\n{}", logs.join("\n")));
    }
    if !output.is_null() {
        parts.push(format!("Return Value:\n{}", render_output(output)));
    } else if logs.is_empty() {
        parts.push("No output or return value.".to_string());
    }
    parts.join("\n")
}

/// Summary of a failed execution fed back to the model
pub fn failure_observation(logs: &[String], error: &str) -> String {
    let mut parts = vec!["Code execution failed.".to_string()];
    if !logs.is_empty() {
        parts.push(format!("Stdout:\n{}", logs.join("\n")));
    }
    parts.push(format!("Error:\n{}", error));
    parts.join("\n")
}

/// Follow-up after a successful but unfinished step
pub fn success_followup(observation: &str) -> String {
    format!(
        "Observation: {}\n\nThe code executed successfully. If the task is complete, set final_answer to true. \
         Otherwise, continue refining the solution.",
        observation
    )
}

/// Follow-up asking the model to fix a failed step
pub fn failure_followup(observation: &str) -> String {
    format!(
        "Observation: {}\n\nPlease fix the error and try again. Return JSON with thoughts, code, and final_answer.",
        observation
    )
}

/// Assistant turn replayed into the conversation after a step
pub fn assistant_turn(thoughts: &str, language: &str, code: &str, final_answer: Option<bool>) -> String {
    let mut turn = format!("Thoughts: {}", thoughts);
    if !code.is_empty() {
        turn.push_str(&format!("\nCode:\n```{}\n{}\n```", language, code));
    }
    if let Some(done) = final_answer {
        turn.push_str(&format!("\nFinal Answer: {}", if done { "True" } else { "False" }));
    }
    turn
}

/// Return value as prompt text, tables as a markdown head
fn render_output(output: &Value) -> String {
    let text = match output {
        Value::Table(table) => table.to_markdown(OBSERVATION_TABLE_ROWS),
        other => other.to_string(),
    };
    truncate_chars(&text, MAX_OBSERVATION_CHARS)
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

/// Parsed model reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub thoughts: String,
    pub code: String,
    pub final_answer: bool,
}

impl ModelReply {
    /// Read the reply fields, accepting common aliases
    pub fn from_json(value: &Json) -> Self {
        let thoughts = first_field(value, &["thoughts", "reasoning", "thought"])
            .map(text_of)
            .unwrap_or_default();
        let code = value
            .get("code")
            .map(text_of)
            .map(|c| strip_code_fences(&c))
            .unwrap_or_default();
        let final_answer = first_field(value, &["final_answer", "complete", "done"])
            .map(truthy)
            .unwrap_or(false);
        Self {
            thoughts,
            code,
            final_answer,
        }
    }

    pub fn has_code(&self) -> bool {
        !self.code.trim().is_empty()
    }
}

fn first_field<'a>(value: &'a Json, names: &[&str]) -> Option<&'a Json> {
    names.iter().find_map(|name| value.get(*name).filter(|v| !v.is_null()))
}

fn text_of(value: &Json) -> String {
    match value {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Json::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        _ => false,
    }
}
