//! Structured output exchanged with the agent CLI.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// JSON schema handed to the agent for analysis runs.
pub const ANALYSIS_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["findings"],
  "properties": {
    "findings": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["file", "line", "title", "description"],
        "properties": {
          "file": {"type": "string"},
          "line": {"type": "integer", "minimum": 1},
          "line_end": {"type": "integer", "minimum": 1},
          "title": {"type": "string"},
          "description": {"type": "string"},
          "scenario": {"type": "string"},
          "fix_plan": {"type": "string"},
          "fix_summary": {"type": "string"}
        }
      }
    },
    "follow_up": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["target"],
        "properties": {
          "target": {"type": "string"},
          "reason": {"type": "string"},
          "priority": {"type": "integer", "minimum": 1}
        }
      }
    }
  }
}"#;

/// JSON schema handed to the agent for fix runs.
pub const FIX_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["status"],
  "properties": {
    "status": {"type": "string", "enum": ["fixed", "failed"]},
    "file": {"type": "string"},
    "line": {"type": "integer", "minimum": 1},
    "summary": {"type": "string"},
    "error": {"type": "string"}
  }
}"#;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportedFinding {
    pub file: String,
    pub line: u32,
    pub line_end: Option<u32>,
    pub title: String,
    pub description: String,
    pub scenario: Option<String>,
    pub fix_plan: Option<String>,
    pub fix_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FollowUp {
    pub target: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AnalysisOutput {
    pub findings: Vec<ReportedFinding>,
    #[serde(default)]
    pub follow_up: Vec<FollowUp>,
    /// Taken from the envelope, not the payload.
    #[serde(skip)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Fixed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixOutput {
    pub status: FixStatus,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Pull the payload out of the CLI's JSON envelope: `structured_output` when
/// present, otherwise the `result` text.
pub fn extract_payload(stdout: &str) -> Result<Value> {
    let envelope: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| Error::Schema(format!("agent output is not a JSON envelope: {e}")))?;

    if envelope.get("is_error").and_then(Value::as_bool) == Some(true) {
        let msg = envelope
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::Agent(format!("agent reported an error: {msg}")));
    }

    if let Some(structured) = envelope.get("structured_output")
        && !structured.is_null()
    {
        return Ok(structured.clone());
    }

    match envelope.get("result") {
        Some(Value::String(text)) => Ok(Value::String(text.clone())),
        Some(other) if !other.is_null() => Ok(other.clone()),
        _ => Err(Error::Schema("agent envelope has neither structured_output nor result".into())),
    }
}

/// Decode a payload into `T`. String payloads are parsed as JSON after
/// stripping markdown fences.
fn decode<T: serde::de::DeserializeOwned>(payload: Value, what: &str) -> Result<T> {
    let value = match payload {
        Value::String(text) => serde_json::from_str(&strip_markdown_fences(&text))
            .map_err(|e| Error::Schema(format!("failed to parse {what} JSON: {e}")))?,
        other => other,
    };
    serde_json::from_value(value).map_err(|e| Error::Schema(format!("malformed {what}: {e}")))
}

pub fn parse_analysis_output(stdout: &str) -> Result<AnalysisOutput> {
    let mut output: AnalysisOutput = decode(extract_payload(stdout)?, "analysis output")?;
    output.cost_usd = envelope_cost(stdout);
    Ok(output)
}

/// `total_cost_usd` reported in the CLI envelope, if any.
pub fn envelope_cost(stdout: &str) -> Option<f64> {
    let envelope: Value = serde_json::from_str(stdout.trim()).ok()?;
    envelope
        .get("total_cost_usd")
        .and_then(Value::as_f64)
        .filter(|cost| cost.is_finite() && *cost >= 0.0)
}

static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?P<file>[\w./-]+\.[A-Za-z0-9]+):(?P<line>\d+)").expect("valid regex")
});

/// Parse a fix report. Free-text results that are not JSON count as
/// `fixed`; the first `path:line` reference in the text, if any, is taken as
/// the touched location.
pub fn parse_fix_output(stdout: &str) -> Result<FixOutput> {
    let payload = extract_payload(stdout)?;
    let text = match &payload {
        Value::String(text) => Some(text.clone()),
        _ => None,
    };
    match decode::<FixOutput>(payload, "fix output") {
        Ok(out) => Ok(out),
        Err(e) => {
            let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                return Err(e);
            };
            let location = LOCATION_RE.captures(&text);
            Ok(FixOutput {
                status: FixStatus::Fixed,
                file: location.as_ref().map(|c| c["file"].to_string()),
                line: location.and_then(|c| c["line"].parse().ok()),
                summary: text.lines().find(|l| !l.trim().is_empty()).map(|l| l.trim().to_string()),
                error: None,
            })
        }
    }
}

/// Remove markdown code fences from a string, returning the inner content.
/// Handles ` ```json `, ` ``` `, and bare JSON.
pub fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the optional language tag on the opening fence line
        let Some(pos) = rest.find('\n') else {
            return String::new();
        };
        let after_tag = &rest[pos + 1..];

        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }

    trimmed.to_string()
}
