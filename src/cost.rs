//! CostLedger — append-only cost events with a running total, persisted to
//! `local_storage/cost_logs.json`. Grounded directly on the original's
//! `CostManager`: per-hour sandbox pricing, tier multipliers, and
//! truncation to the most-recent 100 events.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

use crate::models::Tier;

const SANDBOX_COST_PER_HOUR_USD: f64 = 0.05;
const MAX_RETAINED_EVENTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub kind: String,
    pub id: String,
    pub duration_sec: f64,
    pub tier: Tier,
    pub cost_usd: f64,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostLedgerSnapshot {
    pub total_estimated_usd: f64,
    pub events: Vec<CostEvent>,
}

pub struct CostLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn tier_multiplier(tier: Tier) -> f64 {
        match tier {
            Tier::Seed => 1.0,
            Tier::Launch => 2.0,
            Tier::Scale => 4.0,
        }
    }

    /// Logs one sandbox session and returns its estimated cost.
    pub async fn log_sandbox_usage(&self, sandbox_id: &str, duration_sec: f64, tier: Tier) -> f64 {
        let hours = duration_sec / 3600.0;
        let cost = hours * SANDBOX_COST_PER_HOUR_USD * Self::tier_multiplier(tier);
        let event = CostEvent {
            kind: "SANDBOX".to_string(),
            id: sandbox_id.to_string(),
            duration_sec,
            tier,
            cost_usd: cost,
            ts: chrono::Utc::now(),
        };
        self.append(event).await;
        cost
    }

    async fn append(&self, event: CostEvent) {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.read_locked().await;
        snapshot.total_estimated_usd += event.cost_usd;
        snapshot.events.push(event);
        if snapshot.events.len() > MAX_RETAINED_EVENTS {
            let excess = snapshot.events.len() - MAX_RETAINED_EVENTS;
            snapshot.events.drain(0..excess);
        }
        self.write_locked(&snapshot).await;
    }

    async fn read_locked(&self) -> CostLedgerSnapshot {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => CostLedgerSnapshot::default(),
        }
    }

    async fn write_locked(&self, snapshot: &CostLedgerSnapshot) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Ok(raw) = serde_json::to_string_pretty(snapshot) {
            if let Err(err) = fs::write(&self.path, raw).await {
                tracing::warn!(error = %err, "failed to persist cost ledger");
            }
        }
    }

    pub async fn summary(&self) -> CostLedgerSnapshot {
        let _guard = self.lock.lock().await;
        self.read_locked().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn logs_and_accumulates_total() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost_logs.json"));
        ledger.log_sandbox_usage("sbx-1", 3600.0, Tier::Seed).await;
        ledger.log_sandbox_usage("sbx-2", 3600.0, Tier::Launch).await;

        let summary = ledger.summary().await;
        assert_eq!(summary.events.len(), 2);
        assert!((summary.total_estimated_usd - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn truncates_to_last_100_events() {
        let dir = tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost_logs.json"));
        for i in 0..105 {
            ledger
                .log_sandbox_usage(&format!("sbx-{i}"), 60.0, Tier::Seed)
                .await;
        }
        let summary = ledger.summary().await;
        assert_eq!(summary.events.len(), 100);
        assert_eq!(summary.events[0].id, "sbx-5");
    }
}
