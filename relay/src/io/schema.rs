//! Embedded JSON Schemas for persisted records.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::fsutil::read_optional;

pub const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan.schema.json"
));
pub const DISPATCH_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/dispatch.schema.json"
));
pub const MESSAGES_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/messages.schema.json"
));

/// Validate `value` against `schema`; `label` names the record in errors.
pub fn validate_schema(schema: &str, label: &str, value: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(schema).with_context(|| format!("parse {label} schema"))?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid {label} schema: {err}"))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "{label} schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Read, schema-check, and deserialize a record. A missing file is `None`.
pub fn load_record<T: DeserializeOwned>(path: &Path, schema: &str, label: &str) -> Result<Option<T>> {
    let Some(contents) = read_optional(path)? else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {label} {}", path.display()))?;
    validate_schema(schema, label, &value)
        .with_context(|| format!("validate {label} {}", path.display()))?;
    let record = serde_json::from_value(value)
        .with_context(|| format!("deserialize {label} {}", path.display()))?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_compile() {
        for schema in [PLAN_SCHEMA, DISPATCH_SCHEMA, MESSAGES_SCHEMA] {
            let value: Value = serde_json::from_str(schema).expect("parse schema");
            validator_for(&value).expect("compile schema");
        }
    }

    #[test]
    fn plan_schema_rejects_unknown_status() {
        let plan = json!({"version": 1, "status": "paused", "tasks": []});
        let err = validate_schema(PLAN_SCHEMA, "plan", &plan).unwrap_err();
        assert!(err.to_string().contains("plan schema validation failed"));
    }

    #[test]
    fn message_schema_accepts_text_and_document_payloads() {
        let queue = json!({"messages": [
            {"id": 1, "timestamp": "2025-01-01T00:00:00Z", "origin": "user",
             "payload": "hi", "read": false, "sent": false},
            {"id": 2, "timestamp": "2025-01-01T00:00:01Z", "origin": "agent",
             "payload": {"type": "document", "path": "out.md"}, "read": false, "sent": true}
        ]});
        validate_schema(MESSAGES_SCHEMA, "messages", &queue).expect("valid");
    }
}
