//! Schema-constrained responses.

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Pull a JSON document out of text that may wrap it in markdown fences or
/// surrounding prose.
pub fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + "```json".len();
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let json_start = start + 3;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if !trimmed.starts_with('{')
        && let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return &trimmed[start..=end];
    }

    trimmed
}

/// Parse `raw` as JSON and validate it against `schema`.
pub fn parse_structured(raw: &str, schema: &Value) -> Result<Value> {
    let json = extract_json_block(raw);
    let value: Value = serde_json::from_str(json).map_err(|e| AgentError::StructuredOutput {
        reason: format!("response is not JSON: {e}"),
    })?;
    validate(&value, schema)?;
    Ok(value)
}

/// Validate `value` against `schema` (draft 7).
pub fn validate(value: &Value, schema: &Value) -> Result<()> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| AgentError::StructuredOutput {
            reason: format!("invalid schema: {e}"),
        })?;

    if let Err(errors) = compiled.validate(value) {
        let messages: Vec<String> = errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        return Err(AgentError::StructuredOutput {
            reason: messages.join(", "),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["verified"],
            "properties": { "verified": { "type": "boolean" } }
        })
    }

    #[test]
    fn extract_from_fenced_block() {
        let text = "Here it is:\n```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_block(text), "{\"a\": 1}");
    }

    #[test]
    fn extract_from_bare_fences() {
        assert_eq!(extract_json_block("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn extract_from_prose() {
        assert_eq!(
            extract_json_block("Sure! {\"a\": {\"b\": 2}} hope that helps"),
            "{\"a\": {\"b\": 2}}"
        );
    }

    #[test]
    fn valid_response_parses() {
        let v = parse_structured("{\"verified\": true}", &schema()).unwrap();
        assert_eq!(v["verified"], true);
    }

    #[test]
    fn schema_violation_is_reported() {
        let err = parse_structured("{\"verified\": \"yes\"}", &schema()).unwrap_err();
        assert!(matches!(err, AgentError::StructuredOutput { .. }));
        assert!(parse_structured("not json", &schema()).is_err());
    }
}
