//! Usage logging and reporting
//!
//! Every routing request appends exactly one [`UsageRecord`] to an NDJSON
//! file. [`UsageReport`] aggregates a slice of records for the `report`
//! command: call counts, success rate, latency percentiles, and breakdowns
//! by provider, model, tier, task class and day.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::providers::Tier;

/// Failure text kept in a record, in characters
pub const MAX_ERROR_CHARS: usize = 200;

const UNKNOWN: &str = "unknown";

/// One line of the usage log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tier: Option<Tier>,
    pub task_class: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub failover_count: u32,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsageRecord {
    /// A record stamped at `now` (second precision) with a fresh request id
    pub fn new(now: DateTime<Utc>, task_class: impl Into<String>) -> Self {
        Self {
            timestamp: now.trunc_subsecs(0),
            request_id: uuid::Uuid::new_v4().to_string(),
            agent_id: None,
            provider: None,
            model: None,
            tier: None,
            task_class: task_class.into(),
            success: false,
            latency_ms: 0,
            retries: 0,
            failover_count: 0,
            escalated: false,
            error: None,
        }
    }

    /// Store a failure message, truncated
    pub fn set_error(&mut self, error: &str) {
        self.error = Some(error.chars().take(MAX_ERROR_CHARS).collect());
    }
}

/// Append-only NDJSON usage log. Appends through one handle are serialized.
#[derive(Debug)]
pub struct UsageLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl UsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &UsageRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Usage record {} appended to {}", record.request_id, self.path.display());
        Ok(())
    }

    /// Records at or after `since`. Malformed lines are skipped; a missing file is empty.
    pub async fn read(&self, since: Option<DateTime<Utc>>) -> std::io::Result<Vec<UsageRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) if since.is_none_or(|s| record.timestamp >= s) => records.push(record),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} malformed lines in {}", skipped, self.path.display());
        }
        Ok(records)
    }
}

/// A labelled call count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountRow {
    pub key: String,
    pub count: u64,
}

/// Aggregate statistics over a set of usage records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Percent; `None` with no records
    pub success_rate: Option<f64>,
    pub avg_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub total_failovers: u64,
    pub total_escalations: u64,
    pub by_provider: Vec<CountRow>,
    pub by_model: Vec<CountRow>,
    pub by_tier: Vec<CountRow>,
    pub by_task_class: Vec<CountRow>,
    /// `YYYY-MM-DD` → calls, ascending
    pub by_day: BTreeMap<String, u64>,
}

impl UsageReport {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut by_provider = HashMap::new();
        let mut by_model = HashMap::new();
        let mut by_tier = HashMap::new();
        let mut by_task_class = HashMap::new();
        let mut by_day = BTreeMap::new();
        let mut latencies = Vec::new();
        let mut report = Self::default();

        for r in records {
            report.total += 1;
            if r.success {
                report.success += 1;
            }
            report.total_failovers += u64::from(r.failover_count);
            if r.escalated {
                report.total_escalations += 1;
            }
            if r.latency_ms > 0 {
                latencies.push(r.latency_ms);
            }

            *by_provider
                .entry(r.provider.clone().unwrap_or_else(|| UNKNOWN.to_string()))
                .or_insert(0) += 1;
            *by_model
                .entry(r.model.clone().unwrap_or_else(|| UNKNOWN.to_string()))
                .or_insert(0) += 1;
            *by_tier
                .entry(r.tier.map_or_else(|| UNKNOWN.to_string(), |t| t.to_string()))
                .or_insert(0) += 1;
            *by_task_class.entry(r.task_class.clone()).or_insert(0) += 1;
            *by_day
                .entry(r.timestamp.format("%Y-%m-%d").to_string())
                .or_insert(0) += 1;
        }

        report.failure = report.total - report.success;
        report.success_rate = Some(report.success as f64 / report.total as f64 * 100.0);

        latencies.sort_unstable();
        if !latencies.is_empty() {
            let sum: u64 = latencies.iter().sum();
            report.avg_latency_ms = (sum as f64 / latencies.len() as f64).round() as u64;
            report.p50_latency_ms = percentile(&latencies, 0.50);
            report.p95_latency_ms = percentile(&latencies, 0.95);
        }

        report.by_provider = ranked(by_provider);
        report.by_model = ranked(by_model);
        report.by_tier = ranked(by_tier);
        report.by_task_class = ranked(by_task_class);
        report.by_day = by_day;
        report
    }
}

/// Nearest-rank on a sorted, non-empty slice
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Highest count first, ties by key
fn ranked(counts: HashMap<String, u64>) -> Vec<CountRow> {
    let mut rows: Vec<CountRow> = counts
        .into_iter()
        .map(|(key, count)| CountRow { key, count })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    rows
}

/// Render a report as markdown for CLI display
pub fn format_usage_report(report: &UsageReport, period: &str) -> String {
    let mut out = String::new();

    out.push_str(&format!("## LLM Usage Report ({})\n\n", period));
    if report.total == 0 {
        out.push_str("No usage records.\n");
        return out;
    }

    out.push_str(&format!("**Total Calls:** {}\n", report.total));
    out.push_str(&format!(
        "**Success:** {} | **Failure:** {} | **Success Rate:** {:.1}%\n",
        report.success,
        report.failure,
        report.success_rate.unwrap_or(0.0)
    ));
    out.push_str(&format!(
        "**Latency:** avg {}ms | p50 {}ms | p95 {}ms\n",
        report.avg_latency_ms, report.p50_latency_ms, report.p95_latency_ms
    ));
    out.push_str(&format!(
        "**Failovers:** {} | **Escalations:** {}\n\n",
        report.total_failovers, report.total_escalations
    ));

    for (title, label, rows) in [
        ("By Provider", "Provider", &report.by_provider),
        ("By Model", "Model", &report.by_model),
        ("By Tier", "Tier", &report.by_tier),
        ("By Task Class", "Task Class", &report.by_task_class),
    ] {
        if rows.is_empty() {
            continue;
        }
        out.push_str(&format!("### {}\n\n", title));
        out.push_str(&format!("| {} | Calls | Share |\n", label));
        out.push_str("|---|---|---|\n");
        for row in rows {
            out.push_str(&format!(
                "| {} | {} | {:.1}% |\n",
                row.key,
                row.count,
                row.count as f64 / report.total as f64 * 100.0
            ));
        }
        out.push('\n');
    }

    if !report.by_day.is_empty() {
        out.push_str("### By Day\n\n");
        out.push_str("| Day | Calls |\n");
        out.push_str("|-----|-------|\n");
        for (day, count) in &report.by_day {
            out.push_str(&format!("| {} | {} |\n", day, count));
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(day: u32, provider: &str, tier: Tier, success: bool, latency_ms: u64) -> UsageRecord {
        let mut r = UsageRecord::new(Utc.with_ymd_and_hms(2026, 3, day, 9, 30, 0).unwrap(), "general");
        r.provider = Some(provider.to_string());
        r.model = Some(format!("{}-model", provider));
        r.tier = Some(tier);
        r.success = success;
        r.latency_ms = latency_ms;
        r
    }

    #[test]
    fn test_record_timestamp_second_precision() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(750);
        let r = UsageRecord::new(now, "light");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["timestamp"], "2026-03-01T12:00:00Z");
        assert!(json.get("error").is_none());
        assert!(uuid::Uuid::parse_str(&r.request_id).is_ok());
    }

    #[test]
    fn test_error_truncated() {
        let mut r = UsageRecord::new(Utc::now(), "general");
        r.set_error(&"e".repeat(500));
        assert_eq!(r.error.unwrap().chars().count(), MAX_ERROR_CHARS);
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = UsageLog::new(dir.path().join("logs").join("llm_usage.jsonl"));

        log.append(&record(1, "groq", Tier::Free, true, 120)).await.unwrap();
        let mut failed = record(2, "claude", Tier::Premium, false, 900);
        failed.set_error("[claude] HTTP 500");
        log.append(&failed).await.unwrap();

        let all = log.read(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], failed);

        let since = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let recent = log.read(Some(since)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].provider.as_deref(), Some("claude"));
    }

    #[tokio::test]
    async fn test_read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        let good = serde_json::to_string(&record(1, "groq", Tier::Free, true, 10)).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n{{\"half\": 1}}\n{}\n", good, good)).unwrap();

        let log = UsageLog::new(&path);
        assert_eq!(log.read(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = UsageLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_line_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(UsageLog::new(dir.path().join("u.jsonl")));
        let mut handles = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&record(1, "groq", Tier::Free, true, i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(log.read(None).await.unwrap().len(), 20);
    }

    #[test]
    fn test_report_aggregation() {
        let mut escalated = record(2, "claude", Tier::Premium, true, 400);
        escalated.escalated = true;
        escalated.failover_count = 2;
        let mut no_provider = UsageRecord::new(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(), "coding");
        no_provider.failover_count = 1;

        let records = vec![
            record(1, "groq", Tier::Free, true, 100),
            record(1, "groq", Tier::Free, true, 200),
            record(1, "gemini_flash", Tier::Free, false, 300),
            escalated,
            no_provider,
        ];
        let report = UsageReport::from_records(&records);

        assert_eq!(report.total, 5);
        assert_eq!(report.success, 3);
        assert_eq!(report.failure, 2);
        assert_eq!(report.success_rate, Some(60.0));
        // zero latencies are excluded: [100, 200, 300, 400]
        assert_eq!(report.avg_latency_ms, 250);
        assert_eq!(report.p50_latency_ms, 300);
        assert_eq!(report.p95_latency_ms, 400);
        assert_eq!(report.total_failovers, 3);
        assert_eq!(report.total_escalations, 1);
        assert_eq!(report.by_provider[0], CountRow { key: "groq".into(), count: 2 });
        assert!(report.by_provider.iter().any(|r| r.key == "unknown"));
        assert_eq!(report.by_tier[0], CountRow { key: "free".into(), count: 3 });
        assert_eq!(report.by_task_class[0], CountRow { key: "general".into(), count: 4 });
        assert_eq!(report.by_day.get("2026-03-01"), Some(&3));
        assert_eq!(report.by_day.get("2026-03-02"), Some(&2));
    }

    #[test]
    fn test_empty_report() {
        let report = UsageReport::from_records(&[]);
        assert_eq!(report.total, 0);
        assert!(report.success_rate.is_none());
        assert!(format_usage_report(&report, "today").contains("No usage records."));
    }

    #[test]
    fn test_format_usage_report() {
        let records = vec![
            record(1, "groq", Tier::Free, true, 100),
            record(3, "claude", Tier::Premium, false, 500),
        ];
        let out = format_usage_report(&UsageReport::from_records(&records), "last 7 days");
        assert!(out.contains("## LLM Usage Report (last 7 days)"));
        assert!(out.contains("**Success Rate:** 50.0%"));
        assert!(out.contains("| groq | 1 | 50.0% |"));
        assert!(out.contains("### By Tier"));
        assert!(out.contains("| 2026-03-03 | 1 |"));
    }
}
