//! Response Parser fallback cascade (§4.5).
//!
//! Tool-call structured output (§4.4) is the primary path; this cascade
//! exists for the models or call sites where a tool call isn't available
//! and the score payload has to be recovered from free text. Four
//! strategies run in order, most to least strict, because Claude in
//! particular is prone to emitting valid JSON followed by unsolicited
//! commentary ("Extra data: line 45 column 1" in the source's words).

use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};

/// A parsed score set: one float per named dimension, already normalized
/// into `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScores {
    pub scores: HashMap<String, f64>,
    pub strategy: &'static str,
}

/// Run the fallback cascade against raw model output.
pub fn parse_response(content: &str, model_name: &str) -> Result<ParsedScores> {
    let strategies: [(&'static str, fn(&str) -> Option<HashMap<String, f64>>); 4] = [
        ("clean_json", parse_clean_json),
        ("markdown_blocks", parse_markdown_blocks),
        ("extra_content", parse_extra_content),
        ("text_fallback", parse_text_fallback),
    ];

    let mut attempts = Vec::new();
    for (name, strategy) in strategies {
        match strategy(content) {
            Some(scores) if validate_scores(&scores) => {
                debug!(model = %model_name, strategy = name, "response parsed");
                return Ok(ParsedScores { scores, strategy: name });
            }
            Some(_) => attempts.push(format!("{}: parsed but failed validation", name)),
            None => attempts.push(format!("{}: no match", name)),
        }
    }

    Err(Error::ParseFailure {
        model: model_name.to_string(),
        reason: attempts.join("; "),
    })
}

/// Strategy 1: the response is already clean JSON.
fn parse_clean_json(content: &str) -> Option<HashMap<String, f64>> {
    let value: serde_json::Value = serde_json::from_str(content.trim()).ok()?;
    extract_scores_object(&value)
}

/// Strategy 2: strip a leading/trailing markdown code fence, then parse.
fn parse_markdown_blocks(content: &str) -> Option<HashMap<String, f64>> {
    let mut cleaned = content.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    let value: serde_json::Value = serde_json::from_str(cleaned).ok()?;
    extract_scores_object(&value)
}

/// Strategy 3: scan for a brace-balanced JSON object embedded in
/// otherwise-unparseable text (the "extra content" fix).
fn parse_extra_content(content: &str) -> Option<HashMap<String, f64>> {
    let start = content.find('{')?;
    let mut depth = 0i32;
    let mut end = None;
    for (i, ch) in content[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    if depth != 0 {
        return None;
    }

    let slice = &content[start..end];
    let value: serde_json::Value = serde_json::from_str(slice).ok()?;
    extract_scores_object(&value)
}

/// Strategy 4: regex key:number extraction from unstructured text, with
/// 0-10 and 0-100 scale normalization.
fn parse_text_fallback(content: &str) -> Option<HashMap<String, f64>> {
    let patterns = [
        r#""(\w+)"\s*:\s*([0-9]*\.?[0-9]+)"#,
        r"(\w+)\s*:\s*([0-9]*\.?[0-9]+)",
        r"(\w+)\s*=\s*([0-9]*\.?[0-9]+)",
        r"(\w+)\s*-\s*([0-9]*\.?[0-9]+)",
    ];

    let mut scores = HashMap::new();
    for pattern in patterns {
        let re = Regex::new(pattern).unwrap();
        for cap in re.captures_iter(content) {
            let name = cap[1].to_string();
            let Ok(mut value) = cap[2].parse::<f64>() else {
                continue;
            };
            if value > 10.0 {
                value /= 100.0;
            } else if value > 1.0 {
                value /= 10.0;
            }
            scores.insert(capitalize(&name), (value * 1000.0).round() / 1000.0);
        }
    }

    if scores.is_empty() {
        None
    } else {
        Some(scores)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Pull a `scores` object out of a parsed JSON value, falling back to
/// treating the top-level object itself as the score map (mirrors the
/// source's "score-like keys" fallback in `_validate_parsed_response`).
fn extract_scores_object(value: &serde_json::Value) -> Option<HashMap<String, f64>> {
    let obj = value.as_object()?;

    let scores_value = obj.get("scores").and_then(|v| v.as_object());
    let candidate = scores_value.or(Some(obj))?;

    let mut scores = HashMap::new();
    for (key, val) in candidate {
        if key == "parsing_method" {
            continue;
        }
        let numeric = if let Some(n) = val.as_f64() {
            Some(n)
        } else if let Some(nested) = val.as_object() {
            nested.get("score").and_then(|s| s.as_f64())
        } else {
            None
        };
        if let Some(n) = numeric {
            scores.insert(key.clone(), n);
        }
    }

    if scores.is_empty() {
        None
    } else {
        Some(scores)
    }
}

/// Every score must be numeric and within `[0, 1]`, and there must be at
/// least one.
fn validate_scores(scores: &HashMap<String, f64>) -> bool {
    !scores.is_empty() && scores.values().all(|v| (0.0..=1.0).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json() {
        let content = r#"{"scores": {"populism": 0.7}}"#;
        let parsed = parse_response(content, "test-model").unwrap();
        assert_eq!(parsed.strategy, "clean_json");
        assert_eq!(parsed.scores["populism"], 0.7);
    }

    #[test]
    fn test_markdown_fenced_json() {
        let content = "```json\n{\"scores\": {\"care\": 0.8}}\n```";
        let parsed = parse_response(content, "test-model").unwrap();
        assert_eq!(parsed.strategy, "markdown_blocks");
    }

    #[test]
    fn test_json_followed_by_commentary() {
        let content = r#"{"scores": {"care": 0.6}} This shows a moderate emphasis on care."#;
        let parsed = parse_response(content, "test-model").unwrap();
        assert_eq!(parsed.strategy, "extra_content");
        assert_eq!(parsed.scores["care"], 0.6);
    }

    #[test]
    fn test_text_fallback_normalizes_scale() {
        let content = "Care: 8\nFairness: 95";
        let parsed = parse_response(content, "test-model").unwrap();
        assert_eq!(parsed.strategy, "text_fallback");
        assert!((parsed.scores["Care"] - 0.8).abs() < 1e-6);
        assert!((parsed.scores["Fairness"] - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_all_strategies_fail_on_garbage() {
        let content = "no numbers here at all just prose";
        let result = parse_response(content, "test-model");
        assert!(matches!(result, Err(Error::ParseFailure { .. })));
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let content = r#"{"scores": {"care": 1.5}}"#;
        let result = parse_response(content, "test-model");
        assert!(result.is_err());
    }
}
