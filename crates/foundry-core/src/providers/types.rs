//! Provider-agnostic types shared by the registry, the wire formats and the router

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Provider-agnostic chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Cost class of a provider. Ordering follows escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    LowCost,
    Premium,
}

impl Tier {
    /// Position in the escalation order (free = 0)
    pub fn rank(self) -> usize {
        match self {
            Self::Free => 0,
            Self::LowCost => 1,
            Self::Premium => 2,
        }
    }

    /// Whether calls on this tier cost money and are budget-gated
    pub fn is_paid(self) -> bool {
        !matches!(self, Self::Free)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::LowCost => "low_cost",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "low_cost" => Ok(Self::LowCost),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Request/response shape a provider speaks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFormat {
    /// `messages` array chat completion (OpenAI, Groq, Together, OpenRouter, ...)
    OpenAi,
    /// `contents`/`parts` with a separate `systemInstruction`
    Gemini,
    /// `messages` plus a top-level `system` string
    Anthropic,
    /// Declared in configuration but not understood; calls fail
    Unsupported(String),
}

impl WireFormat {
    /// Parse a known format name
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
            Self::Unsupported(name) => name,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered LLM provider. Holds the *name* of the credential variable,
/// never the credential itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    pub name: String,
    pub format: WireFormat,
    /// Endpoint URL; may contain a `{model}` placeholder
    pub url: String,
    pub key_env: String,
    pub model: String,
    pub tier: Tier,
    pub max_tokens: u32,
    pub cost_per_1k_tokens: f64,
    pub temperature: f32,
    /// Overrides the router-wide per-call timeout
    pub timeout: Option<Duration>,
}

impl Provider {
    /// Endpoint with the `{model}` placeholder filled in
    pub fn endpoint(&self) -> String {
        self.url.replace("{model}", &self.model)
    }
}
