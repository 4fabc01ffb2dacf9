//! foundry-core - LLM routing engine for the agent factory
//!
//! This crate provides:
//! - Provider registry with OpenAI-style, Gemini and Anthropic wire formats
//! - Availability tracking with a flat failure cooldown
//! - Daily/monthly budget guard for paid tiers
//! - Router with ordered failover and tier escalation
//! - Response normalization into one structured schema
//! - Sliding-window chat sessions and an NDJSON usage log

pub mod agents;
pub mod availability;
pub mod budget;
pub mod clock;
pub mod config;
pub mod normalizer;
pub mod providers;
pub mod router;
pub mod session;
pub mod usage;

// Re-export main types for convenience
pub use agents::{AgentDirectory, AgentError, AgentProfile, FileAgentDirectory};
pub use availability::{AvailabilityTracker, CredentialSource, EnvCredentials, StaticCredentials};
pub use budget::{BudgetGuard, BudgetSnapshot, BudgetStatus, CharHeuristic, TokenEstimator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigSource, RoutingConfig, RoutingSnapshot};
pub use normalizer::{NormalizedResponse, normalize};
pub use providers::{
    ChatMessage, ChatRole, HttpProviderClient, Provider, ProviderClient, ProviderError,
    ProviderRegistry, Tier, WireFormat,
};
pub use router::{Priority, RouteRequest, Router, RouterStatus, RoutingResult};
pub use session::SessionStore;
pub use usage::{UsageLog, UsageRecord, UsageReport, format_usage_report};
