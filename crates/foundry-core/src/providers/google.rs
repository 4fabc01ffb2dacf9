//! Google Gemini `generateContent` wire format

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, ChatRole, Provider};

/// Build the request body.
///
/// System turns are folded into a single `systemInstruction`; the rest become
/// `contents` with the assistant role renamed to `model`.
pub fn build_request(provider: &Provider, messages: &[ChatMessage]) -> GeminiRequest {
    let mut system_text = String::new();
    let mut contents = Vec::new();

    for m in messages {
        match m.role {
            ChatRole::System => {
                system_text.push_str(&m.content);
                system_text.push('\n');
            }
            ChatRole::User | ChatRole::Assistant => {
                let role = if m.role == ChatRole::User { "user" } else { "model" };
                contents.push(GeminiContent {
                    role: role.to_string(),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                });
            }
        }
    }

    let system_text = system_text.trim();
    let system_instruction = (!system_text.is_empty()).then(|| GeminiSystemInstruction {
        parts: vec![GeminiPart {
            text: system_text.to_string(),
        }],
    });

    GeminiRequest {
        contents,
        system_instruction,
        generation_config: GeminiGenerationConfig {
            max_output_tokens: provider.max_tokens,
            temperature: provider.temperature,
        },
    }
}

/// Concatenate the text parts of the first candidate
pub fn parse_response(resp: GeminiResponse) -> Result<String> {
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("response had no candidates"))?;

    let content = candidate.content.ok_or_else(|| {
        anyhow!(
            "candidate had no content (finishReason={:?})",
            candidate.finish_reason
        )
    })?;

    let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
    if text.is_empty() {
        return Err(anyhow!("candidate had no text parts"));
    }
    Ok(text)
}

// ── Gemini wire types ──

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiSystemInstruction>,
    pub generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiSystemInstruction {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}
