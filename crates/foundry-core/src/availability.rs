//! Provider availability: credential presence plus a flat failure cooldown
//!
//! A provider is available iff its credential variable is set (non-empty) and
//! it has no recorded failure, or its last failure is at least one cooldown
//! old. Success clears the record outright; there is no backoff or decay.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::providers::Provider;

/// Resolves a credential variable name to its value
pub trait CredentialSource: Send + Sync {
    /// `None` for unset or empty variables
    fn get(&self, key_env: &str) -> Option<String>;
}

/// Reads credentials from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, key_env: &str) -> Option<String> {
        if key_env.is_empty() {
            return None;
        }
        std::env::var(key_env).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed credential map, for embedding and tests
#[derive(Default, Clone)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key_env: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key_env.into(), value.into());
        self
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, key_env: &str) -> Option<String> {
        self.values.get(key_env).filter(|v| !v.is_empty()).cloned()
    }
}

pub struct AvailabilityTracker {
    /// provider name → last failure
    failures: Mutex<HashMap<String, DateTime<Utc>>>,
    cooldown_secs: AtomicU64,
    clock: Arc<dyn Clock>,
    credentials: Arc<dyn CredentialSource>,
}

impl AvailabilityTracker {
    pub fn new(
        cooldown: Duration,
        clock: Arc<dyn Clock>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            cooldown_secs: AtomicU64::new(cooldown.as_secs()),
            clock,
            credentials,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs.load(Ordering::Relaxed))
    }

    /// Applied on config reload; existing failure timestamps are kept
    pub fn set_cooldown(&self, cooldown: Duration) {
        self.cooldown_secs.store(cooldown.as_secs(), Ordering::Relaxed);
    }

    pub fn has_credential(&self, provider: &Provider) -> bool {
        self.credentials.get(&provider.key_env).is_some()
    }

    /// The credential value, for the outbound call only. Never log it.
    pub fn api_key(&self, provider: &Provider) -> Option<String> {
        self.credentials.get(&provider.key_env)
    }

    pub fn is_available(&self, provider: &Provider) -> bool {
        self.has_credential(provider) && self.cooldown_remaining(&provider.name).is_none()
    }

    /// Time left before a failed provider may be tried again, if any
    pub fn cooldown_remaining(&self, name: &str) -> Option<Duration> {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let failed_at = *failures.get(name)?;
        let elapsed = (self.clock.now() - failed_at).to_std().unwrap_or_default();
        self.cooldown().checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn mark_failed(&self, name: &str) {
        let now = self.clock.now();
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), now);
        debug!("Provider {} entered cooldown ({:?})", name, self.cooldown());
    }

    pub fn mark_succeeded(&self, name: &str) {
        let cleared = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        if cleared {
            debug!("Provider {} recovered, cooldown cleared", name);
        }
    }
}
