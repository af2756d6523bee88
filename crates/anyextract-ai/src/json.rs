//! Lenient JSON recovery from model output.

use serde_json::{Value, json};

/// Remove a surrounding markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse a model's JSON answer.
///
/// Tries the fence-stripped text as-is, then the outermost `{...}`, then the
/// outermost `[...]` (wrapped as `{"items": [...]}`). Anything else becomes
/// `{"raw": <content>, "_parse_error": true}`.
pub fn parse_json_response(content: &str) -> Value {
    let content = strip_code_fences(content);
    if let Ok(v) = serde_json::from_str::<Value>(content) {
        return v;
    }
    if let Some(v) = outermost(content, '{', '}') {
        return v;
    }
    if let Some(v) = outermost(content, '[', ']') {
        return json!({ "items": v });
    }
    json!({ "raw": content, "_parse_error": true })
}

/// Whether a value is the parse-failure sentinel.
pub fn is_parse_error(value: &Value) -> bool {
    value.get("_parse_error").and_then(Value::as_bool) == Some(true)
}

fn outermost(content: &str, open: char, close: char) -> Option<Value> {
    let start = content.find(open)?;
    let end = content.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_unwrapped() {
        let v = parse_json_response("```json\n{\"title\": \"Q3\"}\n```");
        assert_eq!(v, json!({"title": "Q3"}));
    }

    #[test]
    fn object_embedded_in_prose() {
        let v = parse_json_response("Sure! Here it is: {\"a\": [1, 2]} Hope that helps.");
        assert_eq!(v, json!({"a": [1, 2]}));
    }

    #[test]
    fn bare_array_is_wrapped() {
        let v = parse_json_response("The fields are [\"a\", \"b\"].");
        assert_eq!(v, json!({"items": ["a", "b"]}));
    }

    #[test]
    fn garbage_yields_sentinel() {
        let v = parse_json_response("no json here");
        assert!(is_parse_error(&v));
        assert_eq!(v["raw"], "no json here");
    }

    #[test]
    fn strip_fences_leaves_plain_text() {
        assert_eq!(strip_code_fences("  {\"x\":1} "), "{\"x\":1}");
        assert_eq!(strip_code_fences("```\nbody\n```"), "body");
    }
}
