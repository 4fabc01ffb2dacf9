//! Routing configuration: provider overrides, chains, thresholds and budgets
//!
//! Read from TOML (or YAML when the file ends in `.yaml`/`.yml`). A missing
//! file yields the built-in defaults; an unparseable one is an error the
//! caller is expected to treat as fatal at startup.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::providers::Tier;
use crate::providers::registry::{ProviderRegistry, RegistryError};

/// Task class used when a request names an unknown one
pub const DEFAULT_CHAIN: [&str; 2] = ["groq", "gemini_flash"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid provider configuration: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Per-provider overrides or additions, keyed by provider name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default = "default_routing_chain")]
    pub routing_chain: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub structured: StructuredConfig,
    #[serde(default)]
    pub usage: UsageLogConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            routing_chain: default_routing_chain(),
            failover: FailoverConfig::default(),
            escalation: EscalationConfig::default(),
            budget: BudgetConfig::default(),
            structured: StructuredConfig::default(),
            usage: UsageLogConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

fn default_routing_chain() -> BTreeMap<String, Vec<String>> {
    let chain = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        (
            "light".to_string(),
            chain(&["groq", "gemini_flash", "openrouter_free"]),
        ),
        (
            "general".to_string(),
            chain(&["groq", "gemini_flash", "together_free", "openrouter_free"]),
        ),
        (
            "coding".to_string(),
            chain(&["together_free", "gemini_flash", "groq"]),
        ),
        (
            "high_precision".to_string(),
            chain(&["groq", "gemini_flash", "together_free"]),
        ),
    ])
}

/// Provider fields as written in configuration. Every field is optional so an
/// entry can patch a built-in provider (e.g. only `tier` and `cost_per_1k_tokens`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub cost_per_1k_tokens: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_cooldown_sec() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            cooldown_sec: default_cooldown_sec(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_schema_mismatch_threshold")]
    pub schema_mismatch_threshold: u32,
    #[serde(default = "default_consecutive_fail_threshold")]
    pub consecutive_fail_threshold: u32,
    #[serde(default = "default_escalate_to_tier")]
    pub auto_escalate_to_tier: Tier,
    /// Premium providers join the escalation list when it has at most this many entries
    #[serde(default = "default_premium_escalate_after")]
    pub premium_escalate_after: usize,
}

fn default_schema_mismatch_threshold() -> u32 {
    2
}
fn default_consecutive_fail_threshold() -> u32 {
    3
}
fn default_escalate_to_tier() -> Tier {
    Tier::LowCost
}
fn default_premium_escalate_after() -> usize {
    2
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            schema_mismatch_threshold: default_schema_mismatch_threshold(),
            consecutive_fail_threshold: default_consecutive_fail_threshold(),
            auto_escalate_to_tier: default_escalate_to_tier(),
            premium_escalate_after: default_premium_escalate_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit_usd: f64,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit_usd: f64,
    #[serde(default = "default_true")]
    pub block_on_exceed: bool,
    #[serde(default = "default_warn_at_percent")]
    pub warn_at_percent: f64,
}

fn default_daily_limit() -> f64 {
    1.0
}
fn default_monthly_limit() -> f64 {
    20.0
}
fn default_true() -> bool {
    true
}
fn default_warn_at_percent() -> f64 {
    80.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: default_daily_limit(),
            monthly_limit_usd: default_monthly_limit(),
            block_on_exceed: true,
            warn_at_percent: default_warn_at_percent(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredConfig {
    /// Prepend the schema instruction as a system message on structured requests
    #[serde(default)]
    pub inject_instruction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `~/.foundry/logs/llm_usage.jsonl`
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for UsageLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: None,
        }
    }
}

impl UsageLogConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| foundry_dir().join("logs").join("llm_usage.jsonl"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Directory holding one sub-directory per agent; defaults to `~/.foundry/agents`
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub default_agent: Option<String>,
}

impl AgentsConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| foundry_dir().join("agents"))
    }
}

/// `~/.foundry`
pub fn foundry_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".foundry")
}

impl RoutingConfig {
    /// Parse configuration text; `path` selects the format and labels errors.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );

        let parsed = if is_yaml {
            serde_yml::from_str(&expanded).map_err(|e| e.to_string())
        } else {
            toml::from_str(&expanded).map_err(|e| e.to_string())
        };

        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Chain for a task class; unknown classes get [`DEFAULT_CHAIN`]
    pub fn chain_for(&self, task_class: &str) -> Vec<String> {
        self.routing_chain
            .get(task_class)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHAIN.iter().map(|n| n.to_string()).collect())
    }
}

/// Where configuration is read from. `None` means built-in defaults only.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    path: Option<PathBuf>,
}

impl ConfigSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn defaults() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read and parse the source. Returns the config and whether a file was actually loaded.
    pub fn load(&self) -> Result<(RoutingConfig, bool), ConfigError> {
        let Some(path) = &self.path else {
            return Ok((RoutingConfig::default(), false));
        };

        if !path.is_file() {
            debug!("No routing config at {}, using defaults", path.display());
            return Ok((RoutingConfig::default(), false));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = RoutingConfig::parse(&content, path)?;
        debug!(
            "Loaded routing config from {} ({} provider entries, {} chains)",
            path.display(),
            config.providers.len(),
            config.routing_chain.len()
        );
        Ok((config, true))
    }
}

/// Immutable view of configuration + registry used for one request.
/// Reload builds a new one and swaps it in whole.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub config: RoutingConfig,
    pub registry: ProviderRegistry,
    pub config_loaded: bool,
}

impl RoutingSnapshot {
    pub fn build(config: RoutingConfig, config_loaded: bool) -> Result<Self, ConfigError> {
        let registry = ProviderRegistry::from_config(&config)?;
        Ok(Self {
            config,
            registry,
            config_loaded,
        })
    }

    pub fn load(source: &ConfigSource) -> Result<Self, ConfigError> {
        let (config, loaded) = source.load()?;
        Self::build(config, loaded)
    }
}

/// Environment variables that may be expanded as `${VAR}` in config files.
/// Credentials are referenced by variable *name* (`key_env`), never expanded.
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER", "FOUNDRY_HOME", "FOUNDRY_LOG_DIR"];

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern")
});

fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |caps: &Captures<'_>| {
            let name = &caps[1];
            if ALLOWED_ENV_VARS.contains(&name) {
                std::env::var(name).unwrap_or_default()
            } else {
                warn!("Leaving ${{{}}} unexpanded in config (not in allowlist)", name);
                caps[0].to_string()
            }
        })
        .into_owned()
}
