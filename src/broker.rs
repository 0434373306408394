//! C4 — Log Broker.
//!
//! Per-deployment subscriber registry with broadcast fan-out. Grounded on
//! the channel-based worker/task wiring used elsewhere in this crate's
//! teacher: a short-held lock guards the registry, and delivery iterates a
//! snapshot so one slow or dropped subscriber never blocks another.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A frame broadcast to every subscriber of a deployment's log stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogFrame {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autofix: Option<serde_json::Value>,
}

impl LogFrame {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: None,
            log: None,
            error: None,
            domain: None,
            autofix: None,
        }
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.log = Some(line.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

type Sink = mpsc::UnboundedSender<LogFrame>;

#[derive(Clone, Default)]
pub struct LogBroker {
    subscribers: Arc<Mutex<HashMap<i64, Vec<Sink>>>>,
}

impl LogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber, returning the receiving half. History is
    /// not replayed: a subscriber that connects late only sees subsequent
    /// frames.
    pub async fn subscribe(&self, deployment_id: i64) -> mpsc::UnboundedReceiver<LogFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .entry(deployment_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Delivers `frame` to every live subscriber of `deployment_id`. A
    /// closed sink is dropped silently rather than treated as an error;
    /// this is the "sink exception is caught and logged" behavior applied
    /// to a channel-based sink, where the failure mode is simply "closed".
    pub async fn broadcast(&self, deployment_id: i64, frame: LogFrame) {
        let snapshot = {
            let mut subs = self.subscribers.lock().await;
            match subs.get_mut(&deployment_id) {
                Some(sinks) => {
                    sinks.retain(|s| !s.is_closed());
                    if sinks.is_empty() {
                        subs.remove(&deployment_id);
                        Vec::new()
                    } else {
                        sinks.clone()
                    }
                }
                None => Vec::new(),
            }
        };
        for sink in snapshot {
            if sink.send(frame.clone()).is_err() {
                tracing::debug!(deployment_id, "log subscriber gone, skipping");
            }
        }
    }

    pub async fn subscriber_count(&self, deployment_id: i64) -> usize {
        self.subscribers
            .lock()
            .await
            .get(&deployment_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_all_subscribers_in_order() {
        let broker = LogBroker::new();
        let mut a = broker.subscribe(1).await;
        let mut b = broker.subscribe(1).await;

        broker.broadcast(1, LogFrame::status("cloning")).await;
        broker.broadcast(1, LogFrame::status("building")).await;

        assert_eq!(a.recv().await.unwrap().status, "cloning");
        assert_eq!(a.recv().await.unwrap().status, "building");
        assert_eq!(b.recv().await.unwrap().status, "cloning");
        assert_eq!(b.recv().await.unwrap().status, "building");
    }

    #[tokio::test]
    async fn broadcast_to_unknown_deployment_is_a_no_op() {
        let broker = LogBroker::new();
        broker.broadcast(99, LogFrame::status("cloning")).await;
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let broker = LogBroker::new();
        let dropped = broker.subscribe(1).await;
        let mut kept = broker.subscribe(1).await;
        drop(dropped);

        broker.broadcast(1, LogFrame::status("building")).await;
        assert_eq!(kept.recv().await.unwrap().status, "building");
    }

    #[tokio::test]
    async fn cross_deployment_isolation() {
        let broker = LogBroker::new();
        let mut a = broker.subscribe(1).await;
        let b_rx = broker.subscribe(2).await;
        drop(b_rx);

        broker.broadcast(2, LogFrame::status("building")).await;
        broker.broadcast(1, LogFrame::status("live")).await;

        assert_eq!(a.recv().await.unwrap().status, "live");
    }
}
