//! C11 — Intent Log.
//!
//! Records a decision made by the control plane (not a user action) as one
//! JSON object per line through the structured logger, following the
//! original's `log_intent` field set. Entries are additionally persisted
//! to the `intent_log` table and kept in a short in-memory ring buffer so
//! tests can assert on emitted intents without parsing log output.

use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{IntentLogEntry, IntentResult};
use crate::store::Store;

const RING_CAPACITY: usize = 200;

#[derive(Clone)]
pub struct IntentLogger {
    store: Store,
    recent: Arc<Mutex<VecDeque<IntentLogEntry>>>,
}

impl IntentLogger {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
        }
    }

    pub async fn record(
        &self,
        project_id: Option<i64>,
        user_id: Option<i64>,
        intent: &str,
        result: IntentResult,
        reason: Option<&str>,
        meta: Option<Value>,
    ) {
        let entry = IntentLogEntry {
            ts: Utc::now(),
            project_id,
            user_id,
            intent: intent.to_string(),
            result,
            reason: reason.map(|s| s.to_string()),
            meta,
        };

        tracing::info!(
            target: "intent",
            project_id = project_id,
            user_id = user_id,
            intent = intent,
            result = %entry.result,
            reason = reason,
            "intent recorded"
        );

        if let Err(err) = self.store.record_intent(&entry).await {
            tracing::warn!(error = %err, "failed to persist intent log entry");
        }

        let mut recent = self.recent.lock().await;
        if recent.len() == RING_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    pub async fn recent(&self) -> Vec<IntentLogEntry> {
        self.recent.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_to_store_and_ring_buffer() {
        let store = Store::new_in_memory().await.unwrap();
        let logger = IntentLogger::new(store.clone());

        logger
            .record(
                Some(1),
                None,
                "start_project",
                IntentResult::Rejected,
                Some("READ-ONLY"),
                None,
            )
            .await;

        let recent = logger.recent().await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].intent, "start_project");
        assert_eq!(store.count_intent_log().await.unwrap(), 1);
    }
}
