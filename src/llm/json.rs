//! Lenient JSON extraction from model replies
//!
//! Models in JSON mode still wrap objects in prose or code fences, leave
//! trailing commas, emit raw newlines inside strings, or forget to escape
//! quotes inside a `"code"` value. Each repair pass below targets one of
//! those and they are tried in order, cheapest first.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)```").expect("valid fenced block pattern");
    static ref CODE_FENCE: Regex =
        Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*\r?\n?([\s\S]*?)```\s*$").expect("valid code fence pattern");
    static ref TRAILING_COMMA: Regex = Regex::new(r",\s*([}\]])").expect("valid trailing comma pattern");
    static ref CODE_FIELD: Regex = Regex::new(r#""code"\s*:\s*""#).expect("valid code field pattern");
    static ref NEXT_FIELD: Regex =
        Regex::new(r#""\s*,\s*"[A-Za-z_]+"\s*:"#).expect("valid next field pattern");
}

/// Parse a JSON value out of a model reply, repairing common damage
pub fn parse_json_reply(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(value) = parse_object(text) {
        return Some(value);
    }

    let mut candidates = Vec::new();
    if let Some(fenced) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        candidates.push(fenced.as_str().trim().to_string());
    }
    if let Some(object) = outermost_object(text) {
        candidates.push(object.to_string());
    }
    candidates.push(text.to_string());

    for candidate in &candidates {
        if let Some(value) = parse_object(candidate) {
            return Some(value);
        }
        let mut repaired = candidate.clone();
        for pass in [strip_trailing_commas, escape_raw_control_chars, escape_code_quotes] {
            repaired = pass(&repaired);
            if let Some(value) = parse_object(&repaired) {
                return Some(value);
            }
        }
    }
    None
}

/// Remove a surrounding markdown code fence, if present
pub fn strip_code_fences(code: &str) -> String {
    let trimmed = code.trim();
    if let Some(inner) = CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str().trim().to_string();
    }
    // Fence opened but never closed
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
        return body.trim().to_string();
    }
    trimmed.to_string()
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text).ok().filter(Value::is_object)
}

/// First balanced `{...}` span in the text
fn outermost_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if start.is_some() => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    // Unbalanced: take from the first brace to the last one
    let first = text.find('{')?;
    let last = text.rfind('}')?;
    (last > first).then(|| &text[first..=last])
}

fn strip_trailing_commas(text: &str) -> String {
    TRAILING_COMMA.replace_all(text, "$1").into_owned()
}

/// Escape literal newlines and tabs that appear inside string values
fn escape_raw_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// Escape bare double quotes inside the `"code"` value
fn escape_code_quotes(text: &str) -> String {
    let Some(marker) = CODE_FIELD.find(text) else {
        return text.to_string();
    };
    let value_start = marker.end();
    let remaining = &text[value_start..];

    // The value ends at the next `", "field":` or at the last quote before the closing brace
    let value_end = match NEXT_FIELD.find(remaining) {
        Some(m) => m.start(),
        None => {
            let close = remaining.rfind('}').unwrap_or(remaining.len());
            match remaining[..close].rfind('"') {
                Some(q) => q,
                None => return text.to_string(),
            }
        }
    };

    let content = &remaining[..value_end];
    let escaped = content
        .replace("\\\"", "\u{FFFF}")
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"");

    format!("{}{}{}", &text[..value_start], escaped, &remaining[value_end..])
}
