//! Multi-provider LLM abstraction layer
//!
//! Providers are configuration, not code: each declares a [`WireFormat`]
//! (OpenAI-style, Gemini, Anthropic) and the [`HttpProviderClient`] picks the
//! matching payload builder and response parser. The [`ProviderRegistry`]
//! merges the built-in free providers with configured overrides.

pub mod anthropic;
pub mod client;
pub mod google;
pub mod openai;
pub mod registry;
pub mod types;

pub use client::{HttpProviderClient, ProviderClient, ProviderError};
pub use registry::{ProviderRegistry, RegistryError};
pub use types::{ChatMessage, ChatRole, Provider, Tier, WireFormat};
