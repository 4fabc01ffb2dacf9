//! OpenAI-style chat completion wire format (OpenAI, Groq, Together, OpenRouter, ...)

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, Provider};

/// Build the request body. Messages are passed through as-is, system turns included.
pub fn build_request(provider: &Provider, messages: &[ChatMessage]) -> OpenAiRequest {
    OpenAiRequest {
        model: provider.model.clone(),
        messages: messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            })
            .collect(),
        max_tokens: provider.max_tokens,
        temperature: provider.temperature,
    }
}

/// Extract the reply text from the first choice
pub fn parse_response(resp: OpenAiResponse) -> Result<String> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("response had no choices"))?;

    match choice.message.content {
        Some(content) if !content.is_empty() => Ok(content),
        _ => Err(anyhow!(
            "first choice had no content (finish_reason={:?})",
            choice.finish_reason
        )),
    }
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}
