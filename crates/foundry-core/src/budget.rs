//! Spend tracking and paid-tier gating
//!
//! Spend accumulates in two in-memory ledgers keyed by UTC calendar day
//! (`YYYY-MM-DD`) and month (`YYYY-MM`). A new period starts with a new key;
//! nothing is ever subtracted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BudgetConfig;
use crate::providers::Tier;

/// Estimates token counts for cost accounting
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, prompt: &str, reply: &str) -> f64;
}

/// Four characters per token over prompt + reply
#[derive(Debug, Clone, Copy, Default)]
pub struct CharHeuristic;

impl TokenEstimator for CharHeuristic {
    fn estimate(&self, prompt: &str, reply: &str) -> f64 {
        (prompt.chars().count() + reply.chars().count()) as f64 / 4.0
    }
}

/// USD cost of a call on a provider priced per 1K tokens
pub fn estimate_cost(cost_per_1k_tokens: f64, estimated_tokens: f64) -> f64 {
    cost_per_1k_tokens * estimated_tokens / 1000.0
}

/// Budget period a ceiling applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Budget check result
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetStatus {
    /// Under budget, all clear
    Ok,
    /// Approaching a ceiling
    Warning {
        period: BudgetPeriod,
        spent: f64,
        budget: f64,
        percent: f64,
    },
    /// At or over a ceiling
    Exceeded {
        period: BudgetPeriod,
        spent: f64,
        budget: f64,
    },
}

impl BudgetStatus {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded { .. })
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK, within budget"),
            Self::Warning {
                period,
                spent,
                budget,
                percent,
            } => write!(
                f,
                "Warning: {} budget at {:.0}% (${:.4} of ${:.2})",
                period, percent, spent, budget
            ),
            Self::Exceeded {
                period,
                spent,
                budget,
            } => write!(
                f,
                "{} budget exceeded (${:.4} of ${:.2})",
                period, spent, budget
            ),
        }
    }
}

/// Outcome of [`BudgetGuard::check`]
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub status: BudgetStatus,
}

impl BudgetDecision {
    /// Human-readable reason; empty when nothing noteworthy
    pub fn reason(&self) -> String {
        match self.status {
            BudgetStatus::Ok => String::new(),
            _ => self.status.to_string(),
        }
    }
}

/// Snapshot returned by `budget_status()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub daily_spent: f64,
    pub daily_limit: f64,
    pub monthly_spent: f64,
    pub monthly_limit: f64,
}

#[derive(Debug, Default)]
struct Ledger {
    daily: HashMap<String, f64>,
    monthly: HashMap<String, f64>,
}

pub struct BudgetGuard {
    ledger: Mutex<Ledger>,
    limits: RwLock<BudgetConfig>,
    clock: Arc<dyn Clock>,
}

impl BudgetGuard {
    pub fn new(limits: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            "Budget guard initialized (daily ${:.2}, monthly ${:.2}, block_on_exceed={})",
            limits.daily_limit_usd, limits.monthly_limit_usd, limits.block_on_exceed
        );
        Self {
            ledger: Mutex::new(Ledger::default()),
            limits: RwLock::new(limits),
            clock,
        }
    }

    /// Replace the ceilings (config reload). Accumulated spend is untouched.
    pub fn set_limits(&self, limits: BudgetConfig) {
        *self.limits.write().unwrap_or_else(|e| e.into_inner()) = limits;
    }

    fn period_keys(&self) -> (String, String) {
        let now = self.clock.now();
        (
            now.format("%Y-%m-%d").to_string(),
            now.format("%Y-%m").to_string(),
        )
    }

    fn current_spend(&self) -> (f64, f64) {
        let (day, month) = self.period_keys();
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        (
            ledger.daily.get(&day).copied().unwrap_or(0.0),
            ledger.monthly.get(&month).copied().unwrap_or(0.0),
        )
    }

    /// Current standing against the ceilings, daily first
    pub fn status(&self) -> BudgetStatus {
        let limits = self.limits.read().unwrap_or_else(|e| e.into_inner()).clone();
        let (daily, monthly) = self.current_spend();

        let mut warning = None;
        for (period, spent, budget) in [
            (BudgetPeriod::Daily, daily, limits.daily_limit_usd),
            (BudgetPeriod::Monthly, monthly, limits.monthly_limit_usd),
        ] {
            if spent >= budget {
                return BudgetStatus::Exceeded {
                    period,
                    spent,
                    budget,
                };
            }
            let percent = if budget > 0.0 { spent / budget * 100.0 } else { 0.0 };
            if warning.is_none() && percent >= limits.warn_at_percent {
                warning = Some(BudgetStatus::Warning {
                    period,
                    spent,
                    budget,
                    percent,
                });
            }
        }
        warning.unwrap_or(BudgetStatus::Ok)
    }

    /// May a call on `tier` proceed? Free tier always may.
    pub fn check(&self, tier: Tier) -> BudgetDecision {
        if !tier.is_paid() {
            return BudgetDecision {
                allowed: true,
                status: BudgetStatus::Ok,
            };
        }

        let status = self.status();
        let block = self
            .limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .block_on_exceed;

        if status.is_warning() {
            warn!("{}", status);
        }

        BudgetDecision {
            allowed: !(block && status.is_exceeded()),
            status,
        }
    }

    /// Add spend to today's and this month's ledgers
    pub fn record_cost(&self, amount: f64) {
        if !amount.is_finite() || amount <= 0.0 {
            return;
        }
        let (day, month) = self.period_keys();
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        *ledger.daily.entry(day).or_insert(0.0) += amount;
        *ledger.monthly.entry(month).or_insert(0.0) += amount;
        debug!("Recorded spend ${:.6}", amount);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let limits = self.limits.read().unwrap_or_else(|e| e.into_inner()).clone();
        let (daily, monthly) = self.current_spend();
        BudgetSnapshot {
            daily_spent: round6(daily),
            daily_limit: limits.daily_limit_usd,
            monthly_spent: round6(monthly),
            monthly_limit: limits.monthly_limit_usd,
        }
    }
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}
