//! Anthropic Messages API wire format

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, ChatRole, Provider};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build the request body. System turns are joined into the top-level `system` string.
pub fn build_request(provider: &Provider, messages: &[ChatMessage]) -> AnthropicRequest {
    let mut system_text = String::new();
    let mut api_messages = Vec::new();

    for m in messages {
        if m.role == ChatRole::System {
            system_text.push_str(&m.content);
            system_text.push('\n');
        } else {
            api_messages.push(AnthropicMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            });
        }
    }

    let system_text = system_text.trim();
    AnthropicRequest {
        model: provider.model.clone(),
        max_tokens: provider.max_tokens,
        messages: api_messages,
        system: (!system_text.is_empty()).then(|| system_text.to_string()),
    }
}

/// Return the first text block of the response
pub fn parse_response(resp: AnthropicResponse) -> Result<String> {
    resp.content
        .into_iter()
        .find_map(|block| match block {
            AnthropicBlock::Text { text } => Some(text),
            AnthropicBlock::Other => None,
        })
        .ok_or_else(|| anyhow!("response had no text block (stop_reason={:?})", resp.stop_reason))
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
