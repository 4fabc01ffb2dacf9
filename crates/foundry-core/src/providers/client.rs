//! Outbound provider calls
//!
//! [`ProviderClient`] is the seam between the router and the network. The
//! HTTP implementation picks a payload builder and response parser from the
//! provider's declared [`WireFormat`].

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::{ChatMessage, Provider, WireFormat};
use super::{anthropic, google, openai};

/// Longest slice of an error body kept in [`ProviderError::Http`]
const MAX_ERROR_BODY: usize = 300;

/// Why a single provider call failed. Every variant triggers failover.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} returned status {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("request to {provider} failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} timed out after {}s", .after.as_secs())]
    Timeout { provider: String, after: Duration },
    #[error("malformed response from {provider}: {message}")]
    MalformedResponse { provider: String, message: String },
    #[error("{provider} declares unsupported wire format '{format}'")]
    UnsupportedFormat { provider: String, format: String },
}

/// Performs one completion call against one provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send the full message list and return the reply text
    async fn complete(
        &self,
        provider: &Provider,
        api_key: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError>;
}

/// reqwest-backed client speaking every supported [`WireFormat`]
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    client: Client,
    default_timeout: Duration,
}

impl HttpProviderClient {
    /// `default_timeout` applies to providers without their own `timeout`.
    pub fn new(default_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    fn timeout_for(&self, provider: &Provider) -> Duration {
        provider.timeout.unwrap_or(self.default_timeout)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        provider: &Provider,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let after = self.timeout_for(provider);
        let response = request
            .timeout(after)
            .send()
            .await
            .map_err(|e| transport_error(provider, e, after))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Http {
                provider: provider.name.clone(),
                status: status.as_u16(),
                body: truncate_chars(&body, MAX_ERROR_BODY),
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                return transport_error(provider, e, after);
            }
            ProviderError::MalformedResponse {
                provider: provider.name.clone(),
                message: e.without_url().to_string(),
            }
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn complete(
        &self,
        provider: &Provider,
        api_key: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        debug!(
            "{} request: format={}, model={}, messages={}",
            provider.name,
            provider.format,
            provider.model,
            messages.len()
        );

        let parsed = match &provider.format {
            WireFormat::OpenAi => {
                let body = openai::build_request(provider, messages);
                let request = self
                    .client
                    .post(provider.endpoint())
                    .bearer_auth(api_key)
                    .json(&body);
                let resp: openai::OpenAiResponse = self.send(provider, request).await?;
                openai::parse_response(resp)
            }
            WireFormat::Gemini => {
                let body = google::build_request(provider, messages);
                let url = url::Url::parse_with_params(&provider.endpoint(), &[("key", api_key)])
                    .map_err(|e| ProviderError::Transport {
                        provider: provider.name.clone(),
                        message: format!("invalid endpoint: {}", e),
                    })?;
                let request = self.client.post(url).json(&body);
                let resp: google::GeminiResponse = self.send(provider, request).await?;
                google::parse_response(resp)
            }
            WireFormat::Anthropic => {
                let body = anthropic::build_request(provider, messages);
                let request = self
                    .client
                    .post(provider.endpoint())
                    .header("x-api-key", api_key)
                    .header("anthropic-version", anthropic::ANTHROPIC_VERSION)
                    .json(&body);
                let resp: anthropic::AnthropicResponse = self.send(provider, request).await?;
                anthropic::parse_response(resp)
            }
            WireFormat::Unsupported(format) => {
                return Err(ProviderError::UnsupportedFormat {
                    provider: provider.name.clone(),
                    format: format.clone(),
                });
            }
        };

        parsed.map_err(|e| ProviderError::MalformedResponse {
            provider: provider.name.clone(),
            message: e.to_string(),
        })
    }
}

/// reqwest errors print the request URL, which carries the Gemini key; strip it.
fn transport_error(provider: &Provider, e: reqwest::Error, after: Duration) -> ProviderError {
    if e.is_timeout() {
        return ProviderError::Timeout {
            provider: provider.name.clone(),
            after,
        };
    }
    ProviderError::Transport {
        provider: provider.name.clone(),
        message: e.without_url().to_string(),
    }
}

/// Truncate to at most `max` characters without splitting a UTF-8 sequence
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
