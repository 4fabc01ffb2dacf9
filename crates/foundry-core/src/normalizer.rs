//! Response normalization: coerce free-form LLM output into one fixed schema
//!
//! Extraction tries, in order: the whole text as a JSON object, the first
//! fenced code block, then the first brace-delimited substring (one nesting
//! level). Text with no parseable object is wrapped as the summary and marked
//! invalid. Keys are accepted in English or Korean.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

const TITLE_MAX_CHARS: usize = 80;

const TITLE_KEYS: &[&str] = &["title", "제목"];
const SUMMARY_KEYS: &[&str] = &["summary", "요약", "description", "설명"];
const STEPS_KEYS: &[&str] = &["steps", "단계"];
const ARTIFACTS_KEYS: &[&str] = &["artifacts", "산출물"];
const RISKS_KEYS: &[&str] = &["risks", "위험"];
const NEXT_KEYS: &[&str] = &["next", "다음"];

const STEP_ACTION_KEYS: &[&str] = &["action", "name", "동작"];
const STEP_DETAILS_KEYS: &[&str] = &["details", "description", "detail", "상세"];
const ARTIFACT_TYPE_KEYS: &[&str] = &["type", "유형"];
const ARTIFACT_PATH_KEYS: &[&str] = &["path", "경로"];
const RISK_KEYS: &[&str] = &["risk", "위험"];
const MITIGATION_KEYS: &[&str] = &["mitigation", "대응", "완화"];

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(\{.*?\})\s*\n?```").expect("fenced block pattern")
});

static BRACED_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("braced object pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub step: u64,
    pub action: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    pub risk: String,
    pub mitigation: String,
}

/// The canonical structured reply. The six primary fields are always present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub title: String,
    pub summary: String,
    pub steps: Vec<Step>,
    pub artifacts: Vec<Artifact>,
    pub risks: Vec<Risk>,
    pub next: Vec<String>,
    #[serde(rename = "_raw")]
    pub raw: String,
    #[serde(rename = "_valid")]
    pub valid: bool,
    #[serde(rename = "_violations")]
    pub violations: Vec<String>,
}

impl NormalizedResponse {
    /// The six schema fields as a JSON object, without metadata
    pub fn to_canonical_json(&self) -> Value {
        serde_json::json!({
            "title": self.title,
            "summary": self.summary,
            "steps": self.steps,
            "artifacts": self.artifacts,
            "risks": self.risks,
            "next": self.next,
        })
    }

    /// Whether the six schema fields match, ignoring metadata
    pub fn same_content(&self, other: &Self) -> bool {
        self.title == other.title
            && self.summary == other.summary
            && self.steps == other.steps
            && self.artifacts == other.artifacts
            && self.risks == other.risks
            && self.next == other.next
    }
}

/// Normalize raw model output into the canonical schema
pub fn normalize(raw_text: &str) -> NormalizedResponse {
    let Some(extracted) = extract_json(raw_text) else {
        debug!("No JSON object found in reply, wrapping raw text as summary");
        let trimmed = raw_text.trim();
        return NormalizedResponse {
            title: trimmed.chars().take(TITLE_MAX_CHARS).collect(),
            summary: trimmed.to_string(),
            raw: raw_text.to_string(),
            valid: false,
            violations: vec!["no parseable JSON found".to_string()],
            ..Default::default()
        };
    };

    let violations = validate_schema(&extracted);
    let mut normalized = coerce(&extracted);
    normalized.raw = raw_text.to_string();
    normalized.valid = violations.is_empty();
    normalized.violations = violations;
    normalized
}

/// Locate and parse the first JSON object in `text`
pub fn extract_json(text: &str) -> Option<Map<String, Value>> {
    let as_object = |candidate: &str| match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    as_object(text.trim())
        .or_else(|| {
            FENCED_BLOCK
                .captures(text)
                .and_then(|c| c.get(1))
                .and_then(|m| as_object(m.as_str()))
        })
        .or_else(|| BRACED_OBJECT.find(text).and_then(|m| as_object(m.as_str())))
}

/// Check an extracted object against the schema. Returns the violations; empty means valid.
pub fn validate_schema(data: &Map<String, Value>) -> Vec<String> {
    let mut violations = Vec::new();

    let fields: [(&str, &[&str], bool); 6] = [
        ("title", TITLE_KEYS, false),
        ("summary", SUMMARY_KEYS, false),
        ("steps", STEPS_KEYS, true),
        ("artifacts", ARTIFACTS_KEYS, true),
        ("risks", RISKS_KEYS, true),
        ("next", NEXT_KEYS, true),
    ];

    for (name, keys, expect_list) in fields {
        match lookup(data, keys) {
            None => violations.push(format!("missing field: {}", name)),
            Some(value) => {
                let ok = if expect_list {
                    value.is_array()
                } else {
                    value.is_string()
                };
                if !ok {
                    violations.push(format!(
                        "type mismatch: {} (expected {}, got {})",
                        name,
                        if expect_list { "list" } else { "string" },
                        json_type_name(value)
                    ));
                }
            }
        }
    }

    if let Some(Value::Array(steps)) = lookup(data, STEPS_KEYS) {
        for (i, step) in steps.iter().enumerate() {
            match step {
                Value::Object(obj) if lookup(obj, STEP_ACTION_KEYS).is_some() => {}
                Value::Object(_) => violations.push(format!("steps[{}]: missing action", i)),
                _ => violations.push(format!("steps[{}]: not an object", i)),
            }
        }
    }

    violations
}

fn coerce(data: &Map<String, Value>) -> NormalizedResponse {
    let title = lookup(data, TITLE_KEYS).map(text_of).unwrap_or_default();
    let summary = lookup(data, SUMMARY_KEYS).map(text_of).unwrap_or_default();

    let steps = list_of(data, STEPS_KEYS)
        .iter()
        .enumerate()
        .filter_map(|(i, s)| {
            let ordinal = i as u64 + 1;
            match s {
                Value::Object(obj) => Some(Step {
                    step: obj.get("step").and_then(ordinal_of).unwrap_or(ordinal),
                    action: lookup(obj, STEP_ACTION_KEYS).map(text_of).unwrap_or_default(),
                    details: lookup(obj, STEP_DETAILS_KEYS).map(text_of).unwrap_or_default(),
                }),
                Value::String(action) => Some(Step {
                    step: ordinal,
                    action: action.clone(),
                    details: String::new(),
                }),
                _ => None,
            }
        })
        .collect();

    let artifacts = list_of(data, ARTIFACTS_KEYS)
        .iter()
        .filter_map(|a| match a {
            Value::Object(obj) => Some(Artifact {
                kind: lookup(obj, ARTIFACT_TYPE_KEYS)
                    .map(text_of)
                    .unwrap_or_else(|| "file".to_string()),
                path: lookup(obj, ARTIFACT_PATH_KEYS).map(text_of).unwrap_or_default(),
            }),
            Value::String(path) => Some(Artifact {
                kind: "file".to_string(),
                path: path.clone(),
            }),
            _ => None,
        })
        .collect();

    let risks = list_of(data, RISKS_KEYS)
        .iter()
        .filter_map(|r| match r {
            Value::Object(obj) => Some(Risk {
                risk: lookup(obj, RISK_KEYS).map(text_of).unwrap_or_default(),
                mitigation: lookup(obj, MITIGATION_KEYS).map(text_of).unwrap_or_default(),
            }),
            Value::String(risk) => Some(Risk {
                risk: risk.clone(),
                mitigation: String::new(),
            }),
            _ => None,
        })
        .collect();

    let next = match lookup(data, NEXT_KEYS) {
        Some(Value::Array(items)) => items.iter().map(text_of).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    NormalizedResponse {
        title,
        summary,
        steps,
        artifacts,
        risks,
        next,
        ..Default::default()
    }
}

/// The instruction asking a model to answer in the canonical schema
pub fn schema_instruction() -> &'static str {
    r#"Respond ONLY with a single JSON object in exactly this format. No other format is accepted.

```json
{
  "title": "Response title",
  "summary": "Core summary (1-3 sentences)",
  "steps": [
    {"step": 1, "action": "Action to perform", "details": "Details"}
  ],
  "artifacts": [
    {"type": "file|code|data", "path": "Path created or modified"}
  ],
  "risks": [
    {"risk": "Risk", "mitigation": "Mitigation"}
  ],
  "next": ["Recommended next action 1", "Recommended next action 2"]
}
```

Rules:
- Output pure JSON only. No explanatory text before or after the JSON.
- Always include every field, using [] or "" when empty.
- Keep code and paths verbatim."#
}

/// First value present under any of `keys`
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn list_of<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> &'a [Value] {
    match lookup(obj, keys) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn ordinal_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical() -> Value {
        serde_json::json!({
            "title": "Deploy plan",
            "summary": "Roll out the new router behind a flag.",
            "steps": [
                {"step": 1, "action": "Build", "details": "cargo build --release"},
                {"step": 2, "action": "Ship", "details": ""}
            ],
            "artifacts": [{"type": "file", "path": "config/llm_routing.toml"}],
            "risks": [{"risk": "Provider outage", "mitigation": "Failover chain"}],
            "next": ["Monitor usage log", "Tune budgets"]
        })
    }

    #[test]
    fn test_round_trip_canonical() {
        let input = canonical();
        let result = normalize(&input.to_string());
        assert!(result.valid, "violations: {:?}", result.violations);
        assert!(result.violations.is_empty());
        assert_eq!(result.to_canonical_json(), input);
    }

    #[test]
    fn test_plain_prose() {
        let text = "  The deployment went fine and nothing else needs doing today, although it would be nice to check again tomorrow.  ";
        let result = normalize(text);
        assert!(!result.valid);
        assert_eq!(result.summary, text.trim());
        assert_eq!(result.title, text.trim().chars().take(80).collect::<String>());
        assert_eq!(result.violations, vec!["no parseable JSON found"]);
        assert!(result.steps.is_empty() && result.artifacts.is_empty());
        assert!(result.risks.is_empty() && result.next.is_empty());
        assert_eq!(result.raw, text);
    }

    #[test]
    fn test_idempotent_on_canonical_form() {
        let first = normalize("Here you go:\n```json\n{\"title\": \"T\", \"summary\": \"S\", \"steps\": [\"do it\"], \"artifacts\": [\"a.txt\"], \"risks\": [\"none\"], \"next\": \"rest\"}\n```");
        let second = normalize(&first.to_canonical_json().to_string());
        assert!(first.same_content(&second));
        assert!(second.valid);
    }

    #[test]
    fn test_fenced_block_extraction() {
        let text = "Sure!\n```json\n{\"title\": \"Fenced\", \"summary\": \"s\", \"steps\": [], \"artifacts\": [], \"risks\": [], \"next\": []}\n```\nAnything else?";
        let result = normalize(text);
        assert_eq!(result.title, "Fenced");
        assert!(result.valid);
    }

    #[test]
    fn test_untagged_fence() {
        let text = "```\n{\"title\": \"Plain fence\"}\n```";
        assert_eq!(normalize(text).title, "Plain fence");
    }

    #[test]
    fn test_embedded_object_with_one_nesting_level() {
        let text = r#"Result: {"title": "Inline", "summary": "x", "steps": [{"action": "a"}], "artifacts": [], "risks": [], "next": []} trailing"#;
        let result = normalize(text);
        assert_eq!(result.title, "Inline");
        assert_eq!(result.steps[0].step, 1);
        assert!(result.valid);
    }

    #[test]
    fn test_korean_keys() {
        let text = serde_json::json!({
            "제목": "배포 계획",
            "요약": "새 라우터 배포",
            "단계": [{"action": "빌드", "설명": "ignored", "details": "릴리스 빌드"}],
            "산출물": [{"유형": "code", "경로": "src/router.rs"}],
            "위험": [{"위험": "장애", "대응": "페일오버"}],
            "다음": ["모니터링"]
        })
        .to_string();
        let result = normalize(&text);
        assert!(result.valid, "violations: {:?}", result.violations);
        assert_eq!(result.title, "배포 계획");
        assert_eq!(result.summary, "새 라우터 배포");
        assert_eq!(result.steps[0].details, "릴리스 빌드");
        assert_eq!(result.artifacts[0].kind, "code");
        assert_eq!(result.artifacts[0].path, "src/router.rs");
        assert_eq!(result.risks[0].mitigation, "페일오버");
        assert_eq!(result.next, vec!["모니터링"]);
    }

    #[test]
    fn test_string_shorthand_and_missing_fields() {
        let result = normalize(r#"{"title": "T", "steps": ["first", "second"], "risks": ["r"]}"#);
        assert!(!result.valid);
        assert_eq!(result.summary, "");
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[1].step, 2);
        assert_eq!(result.steps[1].action, "second");
        assert_eq!(result.risks[0].mitigation, "");
        assert!(result.violations.contains(&"missing field: summary".to_string()));
        assert!(result.violations.contains(&"steps[0]: not an object".to_string()));
        assert!(result.artifacts.is_empty());
    }

    #[test]
    fn test_type_mismatch_reported() {
        let result = normalize(
            r#"{"title": "T", "summary": "S", "steps": {}, "artifacts": [], "risks": [], "next": "later"}"#,
        );
        assert!(!result.valid);
        assert!(result
            .violations
            .contains(&"type mismatch: steps (expected list, got object)".to_string()));
        assert!(result
            .violations
            .contains(&"type mismatch: next (expected list, got string)".to_string()));
        assert_eq!(result.next, vec!["later"]);
    }

    #[test]
    fn test_step_without_action() {
        let result = normalize(
            r#"{"title": "T", "summary": "S", "steps": [{"details": "d"}], "artifacts": [], "risks": [], "next": []}"#,
        );
        assert_eq!(result.violations, vec!["steps[0]: missing action"]);
        assert_eq!(result.steps[0].action, "");
    }

    #[test]
    fn test_non_object_json_is_not_structured() {
        let result = normalize("[1, 2, 3]");
        assert!(!result.valid);
        assert_eq!(result.summary, "[1, 2, 3]");
    }

    #[test]
    fn test_title_truncates_on_char_boundary() {
        let text = "가".repeat(100);
        let result = normalize(&text);
        assert_eq!(result.title.chars().count(), 80);
    }

    #[test]
    fn test_schema_instruction_mentions_every_field() {
        let instruction = schema_instruction();
        for field in ["title", "summary", "steps", "artifacts", "risks", "next"] {
            assert!(instruction.contains(field));
        }
    }
}
