//! Fixed tool-call JSON schemas (§4.4).
//!
//! Structured agent output goes through named tool calls, never prose
//! parsing: the LLM is handed a schema and must call the tool with
//! arguments that validate against it. This module owns the three
//! schemas the pipeline uses and the validation of a tool call's
//! arguments against its declared schema.

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::types::ToolDefinition;

fn record_analysis_with_work_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "scores": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "properties": {
                        "raw": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                        "salience": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                        "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                    },
                    "required": ["raw", "salience", "confidence"]
                }
            },
            "derived_metrics": {
                "type": "object",
                "additionalProperties": {"type": "number"}
            },
            "evidence": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "dimension": {"type": "string"},
                        "quote": {"type": "string"},
                        "source": {"type": "string"}
                    },
                    "required": ["dimension", "quote", "source"]
                }
            },
            "work": {
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "claimed_output": {"type": "string"}
                },
                "required": ["code", "claimed_output"]
            }
        },
        "required": ["scores", "derived_metrics", "evidence", "work"]
    })
}

fn record_attestation_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "success": {"type": "boolean"},
            "reasoning": {"type": "string"},
            "re_execution_output": {
                "type": "object",
                "additionalProperties": {"type": "number"}
            }
        },
        "required": ["success", "reasoning"]
    })
}

fn generate_queries_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "queries": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 1,
                "maxItems": 8
            }
        },
        "required": ["queries"]
    })
}

/// Look up a named tool schema, or `None` if the name isn't recognized.
pub fn schema_for(tool_name: &str) -> Option<Value> {
    match tool_name {
        "record_analysis_with_work" => Some(record_analysis_with_work_schema()),
        "record_attestation" => Some(record_attestation_schema()),
        "generate_queries" => Some(generate_queries_schema()),
        _ => None,
    }
}

/// Build the [`ToolDefinition`] the Gateway attaches to a completion
/// request for one of the fixed tool names.
pub fn tool_definition(tool_name: &str) -> Option<ToolDefinition> {
    let schema = schema_for(tool_name)?;
    let description = match tool_name {
        "record_analysis_with_work" => {
            "Record per-dimension scores, supporting evidence and the claimed scoring work"
        }
        "record_attestation" => "Record an independent verification verdict on a prior analysis",
        "generate_queries" => "Generate retrieval queries for the current synthesis step",
        _ => return None,
    };
    Some(ToolDefinition {
        name: tool_name.to_string(),
        description: description.to_string(),
        parameters: schema,
    })
}

/// Validate a tool call's `arguments` against its declared schema. Callers
/// should treat a validation failure the same as a parse failure: retry
/// or fall back, never silently proceed with malformed structured output.
pub fn validate_tool_arguments(tool_name: &str, arguments: &Value) -> Result<()> {
    let schema = schema_for(tool_name)
        .ok_or_else(|| Error::SchemaValidation {
            schema: tool_name.to_string(),
            reason: "unknown tool name".to_string(),
        })?;

    let compiled = JSONSchema::compile(&schema).map_err(|e| Error::SchemaValidation {
        schema: tool_name.to_string(),
        reason: format!("schema failed to compile: {}", e),
    })?;

    let result = compiled.validate(arguments);
    if let Err(errors) = result {
        let reason = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(Error::SchemaValidation {
            schema: tool_name.to_string(),
            reason,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tool_has_schema() {
        assert!(schema_for("record_analysis_with_work").is_some());
        assert!(schema_for("record_attestation").is_some());
        assert!(schema_for("generate_queries").is_some());
        assert!(schema_for("not_a_tool").is_none());
    }

    #[test]
    fn test_valid_attestation_args_pass() {
        let args = serde_json::json!({"success": true, "reasoning": "re-derivation matched"});
        assert!(validate_tool_arguments("record_attestation", &args).is_ok());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let args = serde_json::json!({"success": true});
        assert!(validate_tool_arguments("record_attestation", &args).is_err());
    }

    #[test]
    fn test_scores_out_of_range_fail() {
        let args = serde_json::json!({
            "scores": {"populism": {"raw": 1.5, "salience": 0.5, "confidence": 0.5}},
            "derived_metrics": {},
            "evidence": [],
            "work": {"code": "x", "claimed_output": "y"}
        });
        assert!(validate_tool_arguments("record_analysis_with_work", &args).is_err());
    }
}
