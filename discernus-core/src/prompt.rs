//! Prompt template rendering (§4.4).
//!
//! Prompts are named Tera templates with explicit slots. Rendering refuses
//! to proceed if the caller left a declared slot unbound — a silently
//! empty slot in a scoring prompt is exactly the kind of thing that
//! produces a confidently wrong analysis, not an error.

use std::collections::HashMap;
use tera::Tera;

use crate::error::{Error, Result};

/// A compiled set of named prompt templates with their required slots.
pub struct PromptLibrary {
    tera: Tera,
    required_slots: HashMap<String, Vec<String>>,
}

impl PromptLibrary {
    /// Build an empty library; templates are registered with
    /// [`Self::register`].
    pub fn new() -> Self {
        Self {
            tera: Tera::default(),
            required_slots: HashMap::new(),
        }
    }

    /// Register a named template and the slot names it requires to be
    /// present (and non-empty) in the render context.
    pub fn register(
        &mut self,
        name: &str,
        template: &str,
        required_slots: Vec<&str>,
    ) -> Result<()> {
        self.tera
            .add_raw_template(name, template)
            .map_err(|e| Error::PromptRender(format!("template {} failed to compile: {}", name, e)))?;
        self.required_slots.insert(
            name.to_string(),
            required_slots.into_iter().map(String::from).collect(),
        );
        Ok(())
    }

    /// Render `name` against `context`, refusing if any required slot is
    /// missing or blank.
    pub fn render(&self, name: &str, context: &HashMap<String, String>) -> Result<String> {
        if let Some(required) = self.required_slots.get(name) {
            for slot in required {
                match context.get(slot) {
                    Some(value) if !value.trim().is_empty() => {}
                    _ => {
                        return Err(Error::PromptRender(format!(
                            "template {} missing required slot {}",
                            name, slot
                        )))
                    }
                }
            }
        }

        let mut tera_context = tera::Context::new();
        for (key, value) in context {
            tera_context.insert(key, value);
        }

        self.tera
            .render(name, &tera_context)
            .map_err(|e| Error::PromptRender(format!("template {} render failed: {}", name, e)))
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// Base64-encode a document body for embedding in a prompt payload that
/// must survive verbatim through the LLM wire transport (§4.4).
pub fn encode_document_payload(text: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
}

/// Inverse of [`encode_document_payload`].
pub fn decode_document_payload(encoded: &str) -> Result<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::PromptRender(format!("invalid base64 document payload: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::PromptRender(format!("document payload not utf8: {}", e)))
}

/// The standard analysis-scoring prompt template (§4.6), with named slots
/// for the framework definition, the document body and the question set.
pub fn analysis_prompt_template() -> &'static str {
    r#"You are scoring a document against the {{ framework_name }} framework.

Dimensions:
{{ dimensions }}

Document (base64):
{{ document_b64 }}

Research questions:
{{ questions }}

Call the record_analysis_with_work tool with your scores, salience, confidence,
the verbatim evidence quotes supporting each dimension, the code you executed
to compute any derived metrics from those scores, and that code's claimed
output."#
}

/// The verification re-execution prompt template (§4.7).
pub fn verification_prompt_template() -> &'static str {
    r#"A prior analysis scored the following document against {{ framework_name }}.

Claimed scores:
{{ claimed_scores }}

Claimed work:
{{ claimed_work }}

Document (base64):
{{ document_b64 }}

Independently re-derive the scores and call record_attestation with your
verdict on whether the claimed work is reproducible."#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_requires_declared_slot() {
        let mut lib = PromptLibrary::new();
        lib.register("t", "Hello {{ name }}", vec!["name"]).unwrap();
        let ctx = HashMap::new();
        assert!(lib.render("t", &ctx).is_err());
    }

    #[test]
    fn test_render_succeeds_with_slot_bound() {
        let mut lib = PromptLibrary::new();
        lib.register("t", "Hello {{ name }}", vec!["name"]).unwrap();
        let mut ctx = HashMap::new();
        ctx.insert("name".to_string(), "world".to_string());
        assert_eq!(lib.render("t", &ctx).unwrap(), "Hello world");
    }

    #[test]
    fn test_document_payload_roundtrip() {
        let text = "The senate voted on the measure today.";
        let encoded = encode_document_payload(text);
        assert_eq!(decode_document_payload(&encoded).unwrap(), text);
    }
}
