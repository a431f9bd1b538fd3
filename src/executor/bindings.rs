//! Source-level binding assignments for the remote sandbox
//!
//! The sandbox runs Python, so every transferable binding becomes a line of
//! the form `name = <python literal>` prepended to the submitted code.

use crate::output::{Bindings, DataTable, Series, Value};

/// Render bindings as Python assignments, one per line
///
/// Names that are not valid identifiers are skipped. Values with no literal
/// form (images, callables, opaque objects) leave a comment instead.
pub fn render_assignments(bindings: &Bindings) -> String {
    let mut out = String::new();
    for (name, value) in bindings {
        if !is_identifier(name) {
            tracing::warn!(name = %name, "Skipping binding with invalid identifier");
            continue;
        }
        match python_literal(value) {
            Some(literal) => {
                out.push_str(name);
                out.push_str(" = ");
                out.push_str(&literal);
                out.push('\n');
            }
            None => {
                out.push_str(&format!("# {}: {} is not transferable\n", name, value.type_name()));
            }
        }
    }
    out
}

/// Bindings followed by the code body
pub fn prepend_assignments(bindings: &Bindings, code: &str) -> String {
    let header = render_assignments(bindings);
    if header.is_empty() {
        return code.to_string();
    }
    format!("{}\n{}", header, code)
}

/// Reserved words that cannot be assignment targets
const PYTHON_KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in",
    "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

fn is_identifier(name: &str) -> bool {
    if PYTHON_KEYWORDS.contains(&name) {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn python_literal(value: &Value) -> Option<String> {
    Some(match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(x) if x.is_nan() => "float('nan')".to_string(),
        Value::Float(x) if x.is_infinite() => {
            if *x > 0.0 { "float('inf')" } else { "float('-inf')" }.to_string()
        }
        Value::Float(x) => format!("{:?}", x),
        Value::Text(s) => string_literal(s),
        Value::List(items) => {
            let parts: Option<Vec<String>> = items.iter().map(python_literal).collect();
            format!("[{}]", parts?.join(", "))
        }
        Value::Map(map) => {
            let parts: Option<Vec<String>> = map
                .iter()
                .map(|(k, v)| python_literal(v).map(|lit| format!("{}: {}", string_literal(k), lit)))
                .collect();
            format!("{{{}}}", parts?.join(", "))
        }
        Value::Table(table) => table_literal(table)?,
        Value::Series(series) => series_literal(series)?,
        Value::Chart(chart) => python_literal(&Value::from_json(&chart.spec))?,
        Value::Typed(typed) => python_literal(&Value::from_json(&serde_json::to_value(typed).ok()?))?,
        Value::Image(_) | Value::Function(_) | Value::Opaque { .. } => return None,
    })
}

fn string_literal(s: &str) -> String {
    // A JSON string literal is a valid Python string literal
    serde_json::to_string(s).unwrap_or_else(|_| "''".to_string())
}

fn table_literal(table: &DataTable) -> Option<String> {
    let columns: Option<Vec<String>> = table
        .columns()
        .iter()
        .map(|c| {
            python_literal(&Value::List(c.values.clone()))
                .map(|values| format!("{}: {}", string_literal(&c.name), values))
        })
        .collect();
    Some(format!("__import__('pandas').DataFrame({{{}}})", columns?.join(", ")))
}

fn series_literal(series: &Series) -> Option<String> {
    let values = python_literal(&Value::List(series.values.clone()))?;
    let name = series
        .name
        .as_deref()
        .map(string_literal)
        .unwrap_or_else(|| "None".to_string());
    Some(format!("__import__('pandas').Series({}, name={})", values, name))
}
