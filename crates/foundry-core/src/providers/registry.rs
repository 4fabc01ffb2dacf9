//! Provider registry: built-in free providers merged with configured overrides

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{Provider, Tier, WireFormat};
use crate::config::{ProviderConfig, RoutingConfig};

const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("provider '{name}' declares unknown wire format '{format}'")]
    UnknownFormat { name: String, format: String },
    #[error("provider '{name}' is missing required field '{field}'")]
    MissingField { name: String, field: &'static str },
}

/// Catalog of providers in deterministic order: built-ins first, then
/// configured additions in the order they were registered.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four free providers every installation starts with
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for provider in builtin_providers() {
            registry.insert(provider);
        }
        registry
    }

    /// Built-ins patched and extended by the `providers` section of `config`.
    ///
    /// Entries with an unrecognized format are kept (and fail when called);
    /// entries missing endpoint/credential/model are rejected.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::with_builtins();
        for (name, entry) in &config.providers {
            registry.upsert(name, entry, false)?;
        }
        debug!("Provider registry built with {} providers", registry.len());
        Ok(registry)
    }

    /// Idempotent upsert. Unknown formats are rejected.
    pub fn register(&mut self, name: &str, config: &ProviderConfig) -> Result<(), RegistryError> {
        self.upsert(name, config, true)
    }

    /// Look up a provider by name
    pub fn resolve(&self, name: &str) -> Option<&Provider> {
        self.index.get(name).map(|&i| &self.providers[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter()
    }

    /// Providers of a tier, in registry order
    pub fn by_tier(&self, tier: Tier) -> impl Iterator<Item = &Provider> {
        self.providers.iter().filter(move |p| p.tier == tier)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn insert(&mut self, provider: Provider) {
        match self.index.get(&provider.name) {
            Some(&i) => self.providers[i] = provider,
            None => {
                self.index.insert(provider.name.clone(), self.providers.len());
                self.providers.push(provider);
            }
        }
    }

    fn upsert(&mut self, name: &str, config: &ProviderConfig, strict: bool) -> Result<(), RegistryError> {
        let format = match config.format.as_deref() {
            None => None,
            Some(raw) => match WireFormat::parse(raw) {
                Some(format) => Some(format),
                None if strict => {
                    return Err(RegistryError::UnknownFormat {
                        name: name.to_string(),
                        format: raw.to_string(),
                    });
                }
                None => {
                    warn!(
                        "Provider '{}' declares unknown wire format '{}'; calls to it will fail",
                        name, raw
                    );
                    Some(WireFormat::Unsupported(raw.to_string()))
                }
            },
        };

        let mut provider = match self.resolve(name) {
            Some(existing) => existing.clone(),
            None => Provider {
                name: name.to_string(),
                format: WireFormat::OpenAi,
                url: required(name, "url", &config.url)?,
                key_env: required(name, "key_env", &config.key_env)?,
                model: required(name, "model", &config.model)?,
                tier: Tier::Free,
                max_tokens: DEFAULT_MAX_TOKENS,
                cost_per_1k_tokens: 0.0,
                temperature: DEFAULT_TEMPERATURE,
                timeout: None,
            },
        };

        if let Some(format) = format {
            provider.format = format;
        }
        if let Some(url) = &config.url {
            provider.url = url.clone();
        }
        if let Some(key_env) = &config.key_env {
            provider.key_env = key_env.clone();
        }
        if let Some(model) = &config.model {
            provider.model = model.clone();
        }
        if let Some(tier) = config.tier {
            provider.tier = tier;
        }
        if let Some(max_tokens) = config.max_tokens {
            provider.max_tokens = max_tokens;
        }
        if let Some(cost) = config.cost_per_1k_tokens {
            provider.cost_per_1k_tokens = cost.max(0.0);
        }
        if let Some(temperature) = config.temperature {
            provider.temperature = temperature;
        }
        if let Some(secs) = config.timeout_secs {
            provider.timeout = Some(Duration::from_secs(secs));
        }

        self.insert(provider);
        Ok(())
    }
}

fn required(
    name: &str,
    field: &'static str,
    value: &Option<String>,
) -> Result<String, RegistryError> {
    value
        .clone()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RegistryError::MissingField {
            name: name.to_string(),
            field,
        })
}

fn builtin_providers() -> Vec<Provider> {
    let free = |name: &str, format: WireFormat, url: &str, key_env: &str, model: &str| Provider {
        name: name.to_string(),
        format,
        url: url.to_string(),
        key_env: key_env.to_string(),
        model: model.to_string(),
        tier: Tier::Free,
        max_tokens: DEFAULT_MAX_TOKENS,
        cost_per_1k_tokens: 0.0,
        temperature: DEFAULT_TEMPERATURE,
        timeout: None,
    };

    vec![
        free(
            "groq",
            WireFormat::OpenAi,
            "https://api.groq.com/openai/v1/chat/completions",
            "GROQ_API_KEY",
            "llama-3.1-8b-instant",
        ),
        free(
            "gemini_flash",
            WireFormat::Gemini,
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent",
            "GEMINI_API_KEY",
            "gemini-2.0-flash",
        ),
        free(
            "together_free",
            WireFormat::OpenAi,
            "https://api.together.xyz/v1/chat/completions",
            "TOGETHER_API_KEY",
            "meta-llama/Llama-3.3-70B-Instruct-Turbo-Free",
        ),
        free(
            "openrouter_free",
            WireFormat::OpenAi,
            "https://openrouter.ai/api/v1/chat/completions",
            "OPENROUTER_API_KEY",
            "meta-llama/llama-3.1-8b-instruct:free",
        ),
    ]
}
