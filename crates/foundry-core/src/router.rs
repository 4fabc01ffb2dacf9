//! Routing engine: chain selection, failover, tier escalation and budget gating
//!
//! One request walks its candidate chain strictly in order, one call at a
//! time. Unavailable and budget-denied candidates are skipped without
//! counting as failovers. Hard failures and schema-invalid replies feed two
//! separate consecutive counters; either reaching its threshold appends an
//! escalation list of costlier providers that is tried after the base chain.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::agents::{AgentDirectory, FileAgentDirectory};
use crate::availability::{AvailabilityTracker, CredentialSource, EnvCredentials};
use crate::budget::{BudgetGuard, BudgetSnapshot, CharHeuristic, TokenEstimator, estimate_cost};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ConfigSource, EscalationConfig, RoutingSnapshot};
use crate::normalizer::{NormalizedResponse, normalize, schema_instruction};
use crate::providers::{
    ChatMessage, ChatRole, HttpProviderClient, Provider, ProviderClient, ProviderError,
    ProviderRegistry, Tier,
};
use crate::session::SessionStore;
use crate::usage::{UsageLog, UsageRecord};

/// Reported when a request never reached a provider
pub const NO_PROVIDER_AVAILABLE: &str = "no AI provider available";

/// Request urgency. `Critical` moves every premium provider to the front of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub task_class: String,
    pub messages: Vec<ChatMessage>,
    pub priority: Priority,
    pub agent_id: Option<String>,
    pub require_structured: bool,
}

impl RouteRequest {
    pub fn new(task_class: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            task_class: task_class.into(),
            messages,
            priority: Priority::Normal,
            agent_id: None,
            require_structured: false,
        }
    }

    /// Single prompt with an optional system prompt ahead of it
    pub fn from_prompt(
        task_class: impl Into<String>,
        prompt: impl Into<String>,
        system_prompt: Option<&str>,
    ) -> Self {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        Self::new(task_class, messages)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn structured(mut self, require: bool) -> Self {
        self.require_structured = require;
        self
    }
}

/// Outcome of one routing request. Exhaustion is a result with `error` set, never an `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingResult {
    pub request_id: String,
    pub reply: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tier: Option<Tier>,
    pub task_class: String,
    pub latency_ms: u64,
    pub retries: u32,
    pub failover_count: u32,
    /// Escalation was triggered during this request
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<NormalizedResponse>,
    pub error: Option<String>,
}

impl RoutingResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-provider line of [`RouterStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub model: String,
    pub tier: Tier,
    pub format: String,
    pub key_set: bool,
    pub available: bool,
    pub cooldown_remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub providers: Vec<ProviderStatus>,
    pub budget: BudgetSnapshot,
    pub config_loaded: bool,
    pub config_path: Option<PathBuf>,
    pub active_sessions: usize,
}

/// A schema-invalid reply held in case nothing better turns up
struct DegradedReply {
    reply: String,
    provider: Provider,
    latency_ms: u64,
    normalized: NormalizedResponse,
}

/// Mutable bookkeeping for one `route` call
#[derive(Default)]
struct Attempt {
    retries: u32,
    failover_count: u32,
    escalated: bool,
    consecutive_hard_failures: u32,
    consecutive_schema_failures: u32,
    last_error: Option<String>,
    degraded: Option<DegradedReply>,
}

pub struct Router {
    source: ConfigSource,
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    availability: AvailabilityTracker,
    budget: BudgetGuard,
    sessions: SessionStore,
    usage_log: Option<UsageLog>,
    agents: Arc<dyn AgentDirectory>,
    client: Arc<dyn ProviderClient>,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Current configuration snapshot. In-flight requests keep the one they captured.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn agents(&self) -> &Arc<dyn AgentDirectory> {
        &self.agents
    }

    pub fn usage_log(&self) -> Option<&UsageLog> {
        self.usage_log.as_ref()
    }

    pub fn budget_status(&self) -> BudgetSnapshot {
        self.budget.snapshot()
    }

    /// Configured chain for a task class, unresolved names included
    pub fn routing_chain(&self, task_class: &str) -> Vec<String> {
        self.snapshot().config.chain_for(task_class)
    }

    /// Re-read the configuration source and swap in a new snapshot.
    /// On error the current snapshot stays in place.
    pub fn reload_config(&self) -> Result<(), ConfigError> {
        let fresh = RoutingSnapshot::load(&self.source)?;
        self.availability
            .set_cooldown(Duration::from_secs(fresh.config.failover.cooldown_sec));
        self.budget.set_limits(fresh.config.budget.clone());
        info!(
            "Routing config reloaded ({} providers, loaded={})",
            fresh.registry.len(),
            fresh.config_loaded
        );
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(fresh);
        Ok(())
    }

    pub async fn router_status(&self) -> RouterStatus {
        let snapshot = self.snapshot();
        let providers = snapshot
            .registry
            .iter()
            .map(|p| {
                let key_set = self.availability.has_credential(p);
                ProviderStatus {
                    name: p.name.clone(),
                    model: p.model.clone(),
                    tier: p.tier,
                    format: p.format.to_string(),
                    key_set,
                    available: key_set && self.availability.is_available(p),
                    cooldown_remaining_secs: self
                        .availability
                        .cooldown_remaining(&p.name)
                        .map(|d| d.as_secs().max(1)),
                }
            })
            .collect();

        RouterStatus {
            providers,
            budget: self.budget.snapshot(),
            config_loaded: snapshot.config_loaded,
            config_path: self.source.path().map(|p| p.to_path_buf()),
            active_sessions: self.sessions.count().await,
        }
    }

    /// Conversational routing: records the user turn, routes the session
    /// history, and records the reply on success.
    ///
    /// Without an explicit system prompt, the agent's own prompt is looked up
    /// in the agent directory.
    pub async fn route_chat(
        &self,
        session_id: &str,
        user_message: &str,
        system_prompt: Option<&str>,
        task_class: &str,
        agent_id: Option<&str>,
    ) -> RoutingResult {
        let agent_prompt = match (system_prompt, agent_id) {
            (None, Some(id)) => match self.agents.system_prompt(id).await {
                Ok(prompt) => prompt,
                Err(e) => {
                    warn!("No system prompt for agent {}: {}", id, e);
                    None
                }
            },
            _ => None,
        };
        let system_prompt = system_prompt.or(agent_prompt.as_deref());

        self.sessions
            .add_message(session_id, ChatRole::User, user_message)
            .await;
        let messages = self.sessions.get_chat_messages(session_id, system_prompt).await;

        let mut request = RouteRequest::new(task_class, messages);
        request.agent_id = agent_id.map(str::to_string);
        let result = self.route(request).await;

        if result.is_success() && !result.reply.is_empty() {
            self.sessions
                .add_message(session_id, ChatRole::Assistant, result.reply.clone())
                .await;
        }
        result
    }

    /// Route one request to the first provider that gives a usable reply
    pub async fn route(&self, request: RouteRequest) -> RoutingResult {
        let snapshot = self.snapshot();
        let config = &snapshot.config;
        let started = Instant::now();
        let mut record = UsageRecord::new(self.clock.now(), request.task_class.clone());
        record.agent_id = request.agent_id.clone();

        let mut messages = request.messages.clone();
        if request.require_structured && config.structured.inject_instruction {
            messages.insert(0, ChatMessage::system(schema_instruction()));
        }
        let prompt_text = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut candidates = build_chain(
            &snapshot.registry,
            config.chain_for(&request.task_class),
            request.priority,
        );
        let base_len = candidates.len();
        let default_timeout = Duration::from_secs(config.failover.request_timeout_secs);
        let mut attempt = Attempt::default();

        debug!(
            "Routing {} request (priority {}, chain {:?})",
            request.task_class, request.priority, candidates
        );

        let mut idx = 0;
        while idx < candidates.len() {
            let name = candidates[idx].clone();
            let from_escalation = idx >= base_len;
            idx += 1;

            let Some(provider) = snapshot.registry.resolve(&name) else {
                debug!("Skipping unknown provider {}", name);
                continue;
            };
            if !self.availability.is_available(provider) {
                debug!("Skipping unavailable provider {}", name);
                continue;
            }
            let decision = self.budget.check(provider.tier);
            if !decision.allowed {
                info!("Skipping provider {} over budget: {}", name, decision.reason());
                continue;
            }
            let Some(api_key) = self.availability.api_key(provider) else {
                debug!("Skipping provider {} without credential", name);
                continue;
            };

            let call_started = Instant::now();
            let timeout = provider.timeout.unwrap_or(default_timeout);
            let outcome = match tokio::time::timeout(
                timeout,
                self.client.complete(provider, &api_key, &messages),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout {
                    provider: name.clone(),
                    after: timeout,
                }),
            };
            let latency_ms = call_started.elapsed().as_millis() as u64;

            let reply = match outcome {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Provider {} ({}) failed: {}", name, provider.model, e);
                    attempt.retries += 1;
                    attempt.failover_count += 1;
                    attempt.consecutive_hard_failures += 1;
                    attempt.last_error = Some(format!("[{}] {}", name, e));
                    self.availability.mark_failed(&name);

                    if attempt.consecutive_hard_failures >= config.escalation.consecutive_fail_threshold
                        && !attempt.escalated
                    {
                        self.escalate(&snapshot, &mut candidates, base_len, provider.tier, &mut attempt);
                    }
                    continue;
                }
            };

            self.availability.mark_succeeded(&name);
            attempt.consecutive_hard_failures = 0;

            if provider.tier.is_paid() {
                let tokens = self.estimator.estimate(&prompt_text, &reply);
                self.budget
                    .record_cost(estimate_cost(provider.cost_per_1k_tokens, tokens));
            }

            let normalized = request.require_structured.then(|| normalize(&reply));
            match normalized.as_ref() {
                Some(invalid) if !invalid.valid => {
                    attempt.consecutive_schema_failures += 1;
                    warn!(
                        "Provider {} returned a reply that does not match the schema ({} in a row): {}",
                        name,
                        attempt.consecutive_schema_failures,
                        invalid.violations.join("; ")
                    );
                }
                Some(_) => attempt.consecutive_schema_failures = 0,
                None => {}
            }

            // Below the threshold an invalid reply is still returned as is.
            let schema_mismatch = normalized.as_ref().is_some_and(|n| !n.valid);
            if schema_mismatch
                && attempt.consecutive_schema_failures >= config.escalation.schema_mismatch_threshold
            {
                if let Some(invalid) = normalized {
                    attempt.degraded = Some(DegradedReply {
                        reply,
                        provider: provider.clone(),
                        latency_ms,
                        normalized: invalid,
                    });
                }
                attempt.failover_count += 1;
                attempt.last_error = Some(format!(
                    "[{}] schema mismatch {} times in a row",
                    name, attempt.consecutive_schema_failures
                ));
                if !attempt.escalated {
                    self.escalate(&snapshot, &mut candidates, base_len, provider.tier, &mut attempt);
                }
                continue;
            }

            if from_escalation {
                info!("Request succeeded on escalated provider {} ({})", name, provider.model);
            } else if attempt.failover_count > 0 {
                info!("Request succeeded on failover provider {} ({})", name, provider.model);
            }

            let result = RoutingResult {
                request_id: record.request_id.clone(),
                reply,
                provider: Some(name),
                model: Some(provider.model.clone()),
                tier: Some(provider.tier),
                task_class: request.task_class.clone(),
                latency_ms,
                retries: attempt.retries,
                failover_count: attempt.failover_count,
                escalated: attempt.escalated,
                normalized,
                error: None,
            };
            self.log_usage(record, &result).await;
            return result;
        }

        let result = match attempt.degraded.take() {
            Some(degraded) => {
                info!(
                    "No schema-valid reply; returning degraded reply from {}",
                    degraded.provider.name
                );
                RoutingResult {
                    request_id: record.request_id.clone(),
                    reply: degraded.reply,
                    provider: Some(degraded.provider.name),
                    model: Some(degraded.provider.model),
                    tier: Some(degraded.provider.tier),
                    task_class: request.task_class.clone(),
                    latency_ms: degraded.latency_ms,
                    retries: attempt.retries,
                    failover_count: attempt.failover_count,
                    escalated: attempt.escalated,
                    normalized: Some(degraded.normalized),
                    error: None,
                }
            }
            None => {
                let error = attempt
                    .last_error
                    .take()
                    .unwrap_or_else(|| NO_PROVIDER_AVAILABLE.to_string());
                warn!("All providers exhausted for {} request: {}", request.task_class, error);
                RoutingResult {
                    request_id: record.request_id.clone(),
                    reply: String::new(),
                    provider: None,
                    model: None,
                    tier: None,
                    task_class: request.task_class.clone(),
                    latency_ms: started.elapsed().as_millis() as u64,
                    retries: attempt.retries,
                    failover_count: attempt.failover_count,
                    escalated: attempt.escalated,
                    normalized: None,
                    error: Some(error),
                }
            }
        };
        self.log_usage(record, &result).await;
        result
    }

    fn escalate(
        &self,
        snapshot: &RoutingSnapshot,
        candidates: &mut Vec<String>,
        base_len: usize,
        from_tier: Tier,
        attempt: &mut Attempt,
    ) {
        attempt.escalated = true;
        let additions = escalation_candidates(
            &snapshot.registry,
            &snapshot.config.escalation,
            from_tier,
            &candidates[..base_len],
            &candidates[base_len..],
        );
        if additions.is_empty() {
            info!("Escalation from {} tier found no eligible providers", from_tier);
        } else {
            info!("Escalating from {} tier to {:?}", from_tier, additions);
        }
        candidates.extend(additions);
    }

    async fn log_usage(&self, mut record: UsageRecord, result: &RoutingResult) {
        let Some(log) = &self.usage_log else {
            return;
        };
        record.provider = result.provider.clone();
        record.model = result.model.clone();
        record.tier = result.tier;
        record.success = result.is_success();
        record.latency_ms = result.latency_ms;
        record.retries = result.retries;
        record.failover_count = result.failover_count;
        record.escalated = result.escalated;
        if let Some(error) = &result.error {
            record.set_error(error);
        }
        if let Err(e) = log.append(&record).await {
            warn!("Failed to write usage record to {}: {}", log.path().display(), e);
        }
    }
}

/// Base chain for a request. Duplicates keep their first position.
fn build_chain(registry: &ProviderRegistry, configured: Vec<String>, priority: Priority) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(configured.len());
    let leading: Vec<String> = if priority == Priority::Critical {
        registry.by_tier(Tier::Premium).map(|p| p.name.clone()).collect()
    } else {
        Vec::new()
    };
    for name in leading.into_iter().chain(configured) {
        if !chain.contains(&name) {
            chain.push(name);
        }
    }
    chain
}

/// Providers to append when escalation triggers from `current` tier.
///
/// Takes every provider at or above `max(current + 1, target tier)` that is
/// neither in the base chain nor already queued, cheaper tiers first. When
/// that leaves at most `premium_escalate_after` entries, the remaining
/// premium providers are appended too.
fn escalation_candidates(
    registry: &ProviderRegistry,
    escalation: &EscalationConfig,
    current: Tier,
    base_chain: &[String],
    queued: &[String],
) -> Vec<String> {
    let min_rank = (current.rank() + 1).max(escalation.auto_escalate_to_tier.rank());
    let eligible = |p: &&Provider| !base_chain.contains(&p.name) && !queued.contains(&p.name);

    let mut picked: Vec<&Provider> = registry
        .iter()
        .filter(|p| p.tier.rank() >= min_rank)
        .filter(eligible)
        .collect();
    picked.sort_by_key(|p| p.tier.rank());
    let mut names: Vec<String> = picked.into_iter().map(|p| p.name.clone()).collect();

    if names.len() <= escalation.premium_escalate_after {
        for premium in registry.by_tier(Tier::Premium).filter(eligible) {
            if !names.contains(&premium.name) {
                names.push(premium.name.clone());
            }
        }
    }
    names
}

/// Assembles a [`Router`]. Anything not set falls back to production defaults.
#[derive(Default)]
pub struct RouterBuilder {
    source: Option<ConfigSource>,
    snapshot: Option<RoutingSnapshot>,
    client: Option<Arc<dyn ProviderClient>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    clock: Option<Arc<dyn Clock>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    agents: Option<Arc<dyn AgentDirectory>>,
    usage_log: Option<Option<PathBuf>>,
}

impl RouterBuilder {
    /// Where `reload_config` reads from
    pub fn source(mut self, source: ConfigSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Use an already built snapshot instead of loading the source at build time
    pub fn snapshot(mut self, snapshot: RoutingSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn agents(mut self, agents: Arc<dyn AgentDirectory>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Override the usage log location; `None` disables logging
    pub fn usage_log(mut self, path: Option<PathBuf>) -> Self {
        self.usage_log = Some(path);
        self
    }

    pub fn build(self) -> anyhow::Result<Router> {
        let source = self.source.unwrap_or_default();
        let snapshot = match self.snapshot {
            Some(snapshot) => snapshot,
            None => RoutingSnapshot::load(&source)?,
        };
        let config = &snapshot.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let client = match self.client {
            Some(client) => client,
            None => Arc::new(HttpProviderClient::new(Duration::from_secs(
                config.failover.request_timeout_secs,
            ))?),
        };
        let usage_path = match self.usage_log {
            Some(path) => path,
            None => config.usage.enabled.then(|| config.usage.resolved_path()),
        };
        let agents = self
            .agents
            .unwrap_or_else(|| Arc::new(FileAgentDirectory::new(config.agents.resolved_dir())));

        let availability = AvailabilityTracker::new(
            Duration::from_secs(config.failover.cooldown_sec),
            clock.clone(),
            self.credentials.unwrap_or_else(|| Arc::new(EnvCredentials)),
        );
        let budget = BudgetGuard::new(config.budget.clone(), clock.clone());

        info!(
            "Router ready: {} providers, {} task classes, usage log {}",
            snapshot.registry.len(),
            config.routing_chain.len(),
            usage_path
                .as_ref()
                .map_or_else(|| "disabled".to_string(), |p| p.display().to_string())
        );

        Ok(Router {
            source,
            snapshot: RwLock::new(Arc::new(snapshot)),
            availability,
            budget,
            sessions: SessionStore::with_clock(clock.clone()),
            usage_log: usage_path.map(UsageLog::new),
            agents,
            client,
            estimator: self.estimator.unwrap_or_else(|| Arc::new(CharHeuristic)),
            clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::StaticCredentials;
    use crate::clock::ManualClock;
    use crate::config::{ProviderConfig, RoutingConfig};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const GOOD_JSON: &str = r#"{"title": "T", "summary": "S", "steps": [{"step": 1, "action": "a", "details": ""}], "artifacts": [], "risks": [], "next": []}"#;

    #[derive(Clone)]
    enum Behavior {
        Reply(String),
        Fail,
        Hang,
    }

    /// Replies per provider name and records every call in order
    #[derive(Default)]
    struct ScriptedClient {
        behaviors: HashMap<String, Behavior>,
        calls: Mutex<Vec<String>>,
        seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedClient {
        fn new(script: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: script
                    .iter()
                    .map(|(name, b)| (name.to_string(), b.clone()))
                    .collect(),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn complete(
            &self,
            provider: &Provider,
            _api_key: &str,
            messages: &[ChatMessage],
        ) -> Result<String, ProviderError> {
            self.calls.lock().unwrap().push(provider.name.clone());
            self.seen_messages.lock().unwrap().push(messages.to_vec());
            match self.behaviors.get(&provider.name) {
                Some(Behavior::Reply(text)) => Ok(text.clone()),
                Some(Behavior::Hang) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("too late".to_string())
                }
                Some(Behavior::Fail) | None => Err(ProviderError::Http {
                    provider: provider.name.clone(),
                    status: 503,
                    body: "unavailable".to_string(),
                }),
            }
        }
    }

    fn provider_cfg(name: &str, tier: Tier, cost: f64) -> ProviderConfig {
        ProviderConfig {
            url: Some(format!("https://{}.example.test/v1/chat/completions", name)),
            key_env: Some(format!("{}_KEY", name.to_uppercase())),
            model: Some(format!("{}-model", name)),
            tier: Some(tier),
            cost_per_1k_tokens: Some(cost),
            ..Default::default()
        }
    }

    /// Free a/b/c, low-cost `cheap`, premium `opus` and `sonnet`; built-ins have no credentials
    fn test_config(chain: &[&str]) -> RoutingConfig {
        let mut config = RoutingConfig::default();
        for (name, tier, cost) in [
            ("a", Tier::Free, 0.0),
            ("b", Tier::Free, 0.0),
            ("c", Tier::Free, 0.0),
            ("cheap", Tier::LowCost, 0.5),
            ("opus", Tier::Premium, 10.0),
            ("sonnet", Tier::Premium, 3.0),
        ] {
            config.providers.insert(name.to_string(), provider_cfg(name, tier, cost));
        }
        config
            .routing_chain
            .insert("general".to_string(), chain.iter().map(|s| s.to_string()).collect());
        config
    }

    fn all_keys() -> StaticCredentials {
        ["A", "B", "C", "CHEAP", "OPUS", "SONNET"]
            .iter()
            .fold(StaticCredentials::new(), |c, k| c.with(format!("{}_KEY", k), "k"))
    }

    struct Harness {
        router: Router,
        client: Arc<ScriptedClient>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
        log_path: PathBuf,
    }

    fn harness(config: RoutingConfig, creds: StaticCredentials, client: Arc<ScriptedClient>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("llm_usage.jsonl");
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()));
        let router = Router::builder()
            .snapshot(RoutingSnapshot::build(config, true).unwrap())
            .client(client.clone())
            .credentials(Arc::new(creds))
            .clock(clock.clone())
            .usage_log(Some(log_path.clone()))
            .build()
            .unwrap();
        Harness {
            router,
            client,
            clock,
            _dir: dir,
            log_path,
        }
    }

    async fn log_records(h: &Harness) -> Vec<UsageRecord> {
        UsageLog::new(&h.log_path).read(None).await.unwrap()
    }

    #[tokio::test]
    async fn test_chain_order_skip_then_failover() {
        let creds = StaticCredentials::new().with("B_KEY", "k").with("C_KEY", "k");
        let client = ScriptedClient::new(&[("b", Behavior::Fail), ("c", Behavior::Reply("from c".into()))]);
        let h = harness(test_config(&["a", "b", "c"]), creds, client);

        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;

        assert!(result.is_success());
        assert_eq!(result.provider.as_deref(), Some("c"));
        assert_eq!(result.reply, "from c");
        assert_eq!(result.failover_count, 1);
        assert_eq!(result.retries, 1);
        assert!(!result.escalated);
        assert_eq!(h.client.calls(), vec!["b", "c"]);

        let records = log_records(&h).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].provider.as_deref(), Some("c"));
        assert_eq!(records[0].request_id, result.request_id);
    }

    #[tokio::test]
    async fn test_failed_provider_enters_cooldown() {
        let client = ScriptedClient::new(&[("a", Behavior::Fail), ("b", Behavior::Reply("ok".into()))]);
        let h = harness(test_config(&["a", "b"]), all_keys(), client);

        h.router.route(RouteRequest::from_prompt("general", "1", None)).await;
        h.router.route(RouteRequest::from_prompt("general", "2", None)).await;
        assert_eq!(h.client.calls(), vec!["a", "b", "b"]);

        h.clock.advance(chrono::Duration::seconds(60));
        h.router.route(RouteRequest::from_prompt("general", "3", None)).await;
        assert_eq!(h.client.calls(), vec!["a", "b", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_escalation_after_consecutive_failures() {
        let mut config = test_config(&["a", "b"]);
        config.escalation.consecutive_fail_threshold = 2;
        config.escalation.auto_escalate_to_tier = Tier::Premium;
        let client = ScriptedClient::new(&[
            ("a", Behavior::Fail),
            ("b", Behavior::Fail),
            ("opus", Behavior::Reply("premium answer".into())),
        ]);
        let h = harness(config, all_keys(), client);

        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;

        assert!(result.is_success());
        assert!(result.escalated);
        assert_eq!(result.provider.as_deref(), Some("opus"));
        assert_eq!(result.tier, Some(Tier::Premium));
        assert_eq!(result.failover_count, 2);
        assert_eq!(h.client.calls(), vec!["a", "b", "opus"]);
    }

    #[tokio::test]
    async fn test_escalation_never_retries_base_chain_provider() {
        let mut config = test_config(&["a", "b", "opus"]);
        config.escalation.consecutive_fail_threshold = 2;
        let client = ScriptedClient::new(&[("sonnet", Behavior::Reply("ok".into()))]);
        let h = harness(config, all_keys(), client);

        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;

        assert_eq!(result.provider.as_deref(), Some("sonnet"));
        assert!(result.escalated);
        let calls = h.client.calls();
        assert_eq!(calls.iter().filter(|c| *c == "opus").count(), 1);
        // opus stays in its base chain slot; escalation adds low-cost before premium
        assert_eq!(calls, vec!["a", "b", "opus", "cheap", "sonnet"]);
    }

    #[tokio::test]
    async fn test_escalation_without_eligible_candidates_is_plain_exhaustion() {
        let mut config = test_config(&["a", "b"]);
        config.escalation.consecutive_fail_threshold = 2;
        let creds = StaticCredentials::new().with("A_KEY", "k").with("B_KEY", "k");
        let h = harness(config, creds, ScriptedClient::new(&[]));

        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;

        assert!(!result.is_success());
        assert!(result.escalated);
        assert!(result.reply.is_empty());
        assert_eq!(result.retries, 2);
        assert!(result.error.as_deref().unwrap().starts_with("[b]"));
        let records = log_records(&h).await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].provider.is_none());
    }

    #[tokio::test]
    async fn test_premium_end_to_end_records_cost() {
        let mut config = test_config(&["groq", "gemini_flash", "together_free", "openrouter_free", "sonnet"]);
        config.providers.clear();
        let mut sonnet = provider_cfg("sonnet", Tier::Premium, 4.0);
        sonnet.format = Some("anthropic".to_string());
        config.providers.insert("sonnet".to_string(), sonnet);
        let creds = StaticCredentials::new().with("SONNET_KEY", "sk");
        let reply = "r".repeat(400);
        let h = harness(config, creds, ScriptedClient::new(&[("sonnet", Behavior::Reply(reply))]));

        let prompt = "p".repeat(600);
        let result = h.router.route(RouteRequest::from_prompt("general", prompt, None)).await;

        assert_eq!(result.provider.as_deref(), Some("sonnet"));
        assert_eq!(result.tier, Some(Tier::Premium));
        assert_eq!(result.failover_count, 0);
        // (600 + 400) / 4 = 250 tokens at $4 per 1K
        assert_eq!(h.router.budget_status().daily_spent, 1.0);
        assert_eq!(h.router.budget_status().monthly_spent, 1.0);
    }

    #[tokio::test]
    async fn test_free_calls_record_no_cost() {
        let client = ScriptedClient::new(&[("a", Behavior::Reply("x".repeat(1000)))]);
        let h = harness(test_config(&["a"]), all_keys(), client);
        h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;
        assert_eq!(h.router.budget_status().daily_spent, 0.0);
    }

    #[tokio::test]
    async fn test_budget_exceeded_skips_paid_provider() {
        let mut config = test_config(&["opus", "a"]);
        config.budget.daily_limit_usd = 0.0;
        let client = ScriptedClient::new(&[("opus", Behavior::Reply("no".into())), ("a", Behavior::Reply("free".into()))]);
        let h = harness(config, all_keys(), client);

        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;

        assert_eq!(result.provider.as_deref(), Some("a"));
        assert_eq!(result.failover_count, 0);
        assert_eq!(h.client.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_critical_priority_puts_premium_first() {
        let client = ScriptedClient::new(&[("sonnet", Behavior::Reply("fast".into()))]);
        let h = harness(test_config(&["a", "sonnet"]), all_keys(), client);

        let request = RouteRequest::from_prompt("general", "hi", None).with_priority(Priority::Critical);
        let result = h.router.route(request).await;

        assert_eq!(result.provider.as_deref(), Some("sonnet"));
        // opus fails first; sonnet is not tried twice
        assert_eq!(h.client.calls(), vec!["opus", "sonnet"]);
    }

    #[tokio::test]
    async fn test_invalid_reply_below_threshold_returned_immediately() {
        let client = ScriptedClient::new(&[
            ("a", Behavior::Reply("just prose".into())),
            ("b", Behavior::Reply(GOOD_JSON.into())),
        ]);
        let h = harness(test_config(&["a", "b"]), all_keys(), client);

        let result = h
            .router
            .route(RouteRequest::from_prompt("general", "plan", None).structured(true))
            .await;

        assert_eq!(h.client.calls(), vec!["a"]);
        assert_eq!(result.provider.as_deref(), Some("a"));
        assert!(result.error.is_none());
        assert_eq!(result.failover_count, 0);
        assert!(!result.escalated);
        assert!(!result.normalized.as_ref().unwrap().valid);
    }

    #[tokio::test]
    async fn test_schema_mismatch_escalates_and_prefers_valid_reply() {
        let mut config = test_config(&["a", "b"]);
        config.escalation.auto_escalate_to_tier = Tier::Premium;
        config.escalation.schema_mismatch_threshold = 1;
        let client = ScriptedClient::new(&[
            ("a", Behavior::Reply("just prose".into())),
            ("b", Behavior::Reply("more prose".into())),
            ("opus", Behavior::Reply(GOOD_JSON.into())),
        ]);
        let h = harness(config, all_keys(), client);

        let result = h
            .router
            .route(RouteRequest::from_prompt("general", "plan", None).structured(true))
            .await;

        assert_eq!(h.client.calls(), vec!["a", "b", "opus"]);
        assert_eq!(result.provider.as_deref(), Some("opus"));
        assert!(result.escalated);
        assert_eq!(result.failover_count, 2);
        assert_eq!(result.retries, 0);
        assert!(result.normalized.as_ref().unwrap().valid);
    }

    #[tokio::test]
    async fn test_degraded_reply_kept_after_threshold_exhaustion() {
        let mut config = test_config(&["a"]);
        config.escalation.schema_mismatch_threshold = 1;
        let creds = StaticCredentials::new().with("A_KEY", "k");
        let client = ScriptedClient::new(&[("a", Behavior::Reply("prose again".into()))]);
        let h = harness(config, creds, client);

        let result = h
            .router
            .route(RouteRequest::from_prompt("general", "plan", None).structured(true))
            .await;

        assert!(result.is_success());
        assert_eq!(result.reply, "prose again");
        assert_eq!(result.failover_count, 1);
        assert!(result.escalated);
        assert!(!result.normalized.unwrap().valid);
        assert_eq!(log_records(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_reply_returned_when_nothing_valid() {
        let creds = StaticCredentials::new().with("A_KEY", "k");
        let client = ScriptedClient::new(&[("a", Behavior::Reply("only prose here".into()))]);
        let h = harness(test_config(&["a"]), creds, client);

        let result = h
            .router
            .route(RouteRequest::from_prompt("general", "plan", None).structured(true))
            .await;

        assert!(result.is_success());
        assert_eq!(result.reply, "only prose here");
        let normalized = result.normalized.unwrap();
        assert!(!normalized.valid);
        assert_eq!(normalized.summary, "only prose here");
        assert_eq!(log_records(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn test_schema_instruction_injected_when_configured() {
        let mut config = test_config(&["a"]);
        config.structured.inject_instruction = true;
        let client = ScriptedClient::new(&[("a", Behavior::Reply(GOOD_JSON.into()))]);
        let h = harness(config, all_keys(), client);

        h.router
            .route(RouteRequest::from_prompt("general", "plan", Some("You plan.")).structured(true))
            .await;

        let seen = h.client.seen_messages.lock().unwrap().clone();
        assert_eq!(seen[0][0].role, ChatRole::System);
        assert_eq!(seen[0][0].content, schema_instruction());
        assert_eq!(seen[0][1].content, "You plan.");
    }

    #[tokio::test]
    async fn test_timeout_is_a_failover() {
        let mut config = test_config(&["a", "b"]);
        config.providers.get_mut("a").unwrap().timeout_secs = Some(1);
        let client = ScriptedClient::new(&[("a", Behavior::Hang), ("b", Behavior::Reply("ok".into()))]);
        let h = harness(config, all_keys(), client);

        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;
        assert_eq!(result.provider.as_deref(), Some("b"));
        assert_eq!(result.failover_count, 1);
    }

    #[tokio::test]
    async fn test_nothing_available() {
        let h = harness(test_config(&["a", "b"]), StaticCredentials::new(), ScriptedClient::new(&[]));
        let result = h.router.route(RouteRequest::from_prompt("general", "hi", None)).await;
        assert_eq!(result.error.as_deref(), Some(NO_PROVIDER_AVAILABLE));
        assert_eq!(result.failover_count, 0);
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_route_chat_keeps_history() {
        let client = ScriptedClient::new(&[("a", Behavior::Reply("hello back".into()))]);
        let h = harness(test_config(&["a"]), all_keys(), client);

        let result = h
            .router
            .route_chat("s1", "hello", Some("Be brief."), "general", Some("agent-1"))
            .await;
        assert!(result.is_success());

        let session = h.router.sessions().session("s1").await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "hello back");

        let seen = h.client.seen_messages.lock().unwrap().clone();
        assert_eq!(seen[0][0].content, "Be brief.");
        assert_eq!(log_records(&h).await[0].agent_id.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn test_route_chat_uses_agent_prompt() {
        let agents_dir = tempfile::tempdir().unwrap();
        let agent = agents_dir.path().join("planner");
        std::fs::create_dir_all(&agent).unwrap();
        std::fs::write(agent.join("profile.json"), r#"{"agent_id": "planner", "name": "Planner"}"#).unwrap();
        std::fs::write(agent.join("system_prompt.md"), "You are the planner.").unwrap();

        let client = ScriptedClient::new(&[("a", Behavior::Reply("ok".into()))]);
        let router = Router::builder()
            .snapshot(RoutingSnapshot::build(test_config(&["a"]), true).unwrap())
            .client(client.clone())
            .credentials(Arc::new(all_keys()))
            .agents(Arc::new(FileAgentDirectory::new(agents_dir.path())))
            .usage_log(None)
            .build()
            .unwrap();

        router.route_chat("s", "hi", None, "general", Some("planner")).await;
        let seen = client.seen_messages.lock().unwrap().clone();
        assert_eq!(seen[0][0].content, "You are the planner.");
    }

    #[tokio::test]
    async fn test_router_status() {
        let creds = StaticCredentials::new().with("A_KEY", "k");
        let client = ScriptedClient::new(&[("b", Behavior::Reply("ok".into()))]);
        let h = harness(test_config(&["a", "b"]), creds, client);
        h.router.route_chat("s", "hi", None, "general", None).await;

        let status = h.router.router_status().await;
        assert!(status.config_loaded);
        assert_eq!(status.active_sessions, 1);
        let a = status.providers.iter().find(|p| p.name == "a").unwrap();
        assert!(a.key_set);
        assert!(!a.available);
        assert_eq!(a.cooldown_remaining_secs, Some(60));
        let groq = status.providers.iter().find(|p| p.name == "groq").unwrap();
        assert!(!groq.key_set);
        assert_eq!(groq.format, "openai");
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_routing.toml");
        std::fs::write(&path, "[routing_chain]\ngeneral = [\"groq\"]\n").unwrap();

        let router = Router::builder()
            .source(ConfigSource::file(&path))
            .client(ScriptedClient::new(&[]))
            .credentials(Arc::new(StaticCredentials::new()))
            .usage_log(None)
            .build()
            .unwrap();
        let before = router.snapshot();
        assert_eq!(router.routing_chain("general"), vec!["groq"]);

        std::fs::write(
            &path,
            "[routing_chain]\ngeneral = [\"gemini_flash\", \"groq\"]\n\n[budget]\ndaily_limit_usd = 5.0\n",
        )
        .unwrap();
        router.reload_config().unwrap();

        assert_eq!(router.routing_chain("general"), vec!["gemini_flash", "groq"]);
        assert_eq!(router.budget_status().daily_limit, 5.0);
        // a captured snapshot is unaffected
        assert_eq!(before.config.chain_for("general"), vec!["groq"]);

        std::fs::write(&path, "routing_chain = 42").unwrap();
        assert!(router.reload_config().is_err());
        assert_eq!(router.routing_chain("general"), vec!["gemini_flash", "groq"]);
    }

    #[test]
    fn test_escalation_candidates_ordering() {
        let snapshot = RoutingSnapshot::build(test_config(&["a"]), true).unwrap();
        let esc = EscalationConfig::default();
        let base = vec!["a".to_string()];

        let from_free = escalation_candidates(&snapshot.registry, &esc, Tier::Free, &base, &[]);
        assert_eq!(from_free, vec!["cheap", "opus", "sonnet"]);

        let from_low = escalation_candidates(&snapshot.registry, &esc, Tier::LowCost, &base, &[]);
        assert_eq!(from_low, vec!["opus", "sonnet"]);

        let queued = vec!["opus".to_string()];
        let from_premium = escalation_candidates(&snapshot.registry, &esc, Tier::Premium, &base, &queued);
        assert_eq!(from_premium, vec!["sonnet"]);
    }

    #[test]
    fn test_build_chain_dedupes() {
        let snapshot = RoutingSnapshot::build(test_config(&["a"]), true).unwrap();
        let chain = build_chain(
            &snapshot.registry,
            vec!["a".into(), "sonnet".into(), "a".into()],
            Priority::Critical,
        );
        assert_eq!(chain, vec!["opus", "sonnet", "a"]);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
