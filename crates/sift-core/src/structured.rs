//! Structured-output parsing shared by every `LanguageModel` implementation.
//!
//! Models wrap JSON in prose or markdown fences often enough that the raw
//! text is first narrowed to the JSON payload, then checked against the
//! request schema. Only a subset of JSON Schema is understood: `type`,
//! `properties`, `required`, `items` and `enum`. Anything else is ignored.

use serde_json::Value;

use crate::error::{Result, SiftError};

/// Extract JSON from a response that may contain markdown code fences.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    match (span(trimmed, '{', '}'), span(trimmed, '[', ']')) {
        (Some((os, oe)), Some((as_, ae))) => {
            if as_ < os {
                &trimmed[as_..=ae]
            } else {
                &trimmed[os..=oe]
            }
        }
        (Some((s, e)), None) | (None, Some((s, e))) => &trimmed[s..=e],
        (None, None) => trimmed,
    }
}

fn span(text: &str, open: char, close: char) -> Option<(usize, usize)> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start < end).then_some((start, end))
}

/// Parse `raw` as JSON and check it against `schema`.
///
/// Fails with `LlmParse` when no JSON can be read and with `SchemaMismatch`
/// when the value does not conform. Never repairs or guesses.
pub fn parse_structured(raw: &str, schema: &Value) -> Result<Value> {
    let json_str = extract_json(raw);
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| SiftError::LlmParse(format!("{} (in {:.200})", e, json_str)))?;

    let mut issues = Vec::new();
    check(&value, schema, "$", &mut issues);
    if issues.is_empty() {
        Ok(value)
    } else {
        Err(SiftError::SchemaMismatch(issues.join("; ")))
    }
}

fn check(value: &Value, schema: &Value, path: &str, issues: &mut Vec<String>) {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        if !type_matches(value, expected) {
            issues.push(format!("{}: expected {}, got {}", path, expected, type_name(value)));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            issues.push(format!("{}: {} is not one of {}", path, value, Value::Array(allowed.clone())));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    issues.push(format!("{}: missing required key '{}'", path, key));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, sub_schema) in props {
                if let Some(sub_value) = obj.get(key) {
                    check(sub_value, sub_schema, &format!("{}.{}", path, key), issues);
                }
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{}[{}]", path, i), issues);
        }
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verdict_schema() -> Value {
        json!({
            "type": "object",
            "required": ["label", "score"],
            "properties": {
                "label": {"type": "string", "enum": ["high", "low"]},
                "score": {"type": "number"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    #[test]
    fn test_extract_json_code_fence() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json(text), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_prose_wrapped() {
        let text = "Sure! {\"a\": {\"b\": 2}} hope that helps";
        assert_eq!(extract_json(text), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_extract_json_top_level_array() {
        assert_eq!(extract_json("result: [{\"id\": 1}]"), "[{\"id\": 1}]");
    }

    #[test]
    fn test_parse_structured_accepts_conforming() {
        let value = parse_structured(r#"{"label": "high", "score": 0.9, "tags": ["x"]}"#, &verdict_schema())
            .unwrap();
        assert_eq!(value["label"], "high");
    }

    #[test]
    fn test_parse_structured_missing_key() {
        let err = parse_structured(r#"{"label": "high"}"#, &verdict_schema()).unwrap_err();
        match err {
            SiftError::SchemaMismatch(msg) => assert!(msg.contains("missing required key 'score'")),
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_structured_wrong_enum_and_item_type() {
        let err = parse_structured(
            r#"{"label": "medium", "score": 1, "tags": [3]}"#,
            &verdict_schema(),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("$.label"));
        assert!(msg.contains("$.tags[0]: expected string"));
    }

    #[test]
    fn test_parse_structured_not_json() {
        let err = parse_structured("I could not decide.", &verdict_schema()).unwrap_err();
        assert!(matches!(err, SiftError::LlmParse(_)));
    }
}
