use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::ExtractError;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());

/// Pull the JSON object out of a free-text reply.
pub fn isolate_json(text: &str) -> Result<Value, ExtractError> {
    let span = json_span(text)?;
    serde_json::from_str(span).map_err(|e| ExtractError::Parse(e.to_string()))
}

/// The slice of `text` holding the reply's JSON object.
///
/// A fenced ```json block wins; otherwise the first balanced `{...}` that
/// parses as an object.
pub fn json_span(text: &str) -> Result<&str, ExtractError> {
    if !text.contains('{') {
        return Err(ExtractError::Parse("reply contains no '{'".into()));
    }

    if let Some(inner) = FENCED_RE.captures(text).and_then(|c| c.get(1)) {
        if let Some(span) = first_object(inner.as_str()) {
            return Ok(span);
        }
    }

    first_object(text).ok_or_else(|| ExtractError::Parse("no complete JSON object in reply".into()))
}

fn first_object(text: &str) -> Option<&str> {
    text.match_indices('{').find_map(|(start, _)| {
        let len = balanced_len(&text[start..])?;
        let candidate = &text[start..start + len];
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(_)) => Some(candidate),
            _ => None,
        }
    })
}

/// Byte length of the brace-balanced prefix of `s` (which starts with '{').
/// Braces inside string literals do not count.
fn balanced_len(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
