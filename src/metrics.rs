//! C11 — Metrics.
//!
//! No Prometheus client crate appears anywhere in the reference corpus, so
//! these are hand-rolled atomic counters/gauges with a manual
//! text-exposition writer rather than an unverified dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Histogram {
    count: AtomicU64,
    sum_millis: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: std::time::Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct Metrics {
    deployments_total: Mutex<HashMap<(String, String), u64>>,
    deployment_duration: Mutex<HashMap<String, Histogram>>,
    sandboxes_active: AtomicI64,
    http_request_duration: Mutex<HashMap<(String, String), Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_deployment(&self, status: &str, tier: &str) {
        let mut map = self.deployments_total.lock().unwrap();
        *map.entry((status.to_string(), tier.to_string())).or_insert(0) += 1;
    }

    pub fn observe_deployment_duration(&self, tier: &str, duration: std::time::Duration) {
        let mut map = self.deployment_duration.lock().unwrap();
        map.entry(tier.to_string()).or_default().observe(duration);
    }

    pub fn observe_http_request(&self, method: &str, endpoint: &str, duration: std::time::Duration) {
        let mut map = self.http_request_duration.lock().unwrap();
        map.entry((method.to_string(), endpoint.to_string()))
            .or_default()
            .observe(duration);
    }

    pub fn sandbox_created(&self) {
        self.sandboxes_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandbox_removed(&self) {
        self.sandboxes_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sandboxes_active(&self) -> i64 {
        self.sandboxes_active.load(Ordering::Relaxed)
    }

    /// Renders all metrics in Prometheus text-exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP unideploy_deployments_total Total number of deployments\n");
        out.push_str("# TYPE unideploy_deployments_total counter\n");
        for ((status, tier), count) in self.deployments_total.lock().unwrap().iter() {
            out.push_str(&format!(
                "unideploy_deployments_total{{status=\"{status}\",tier=\"{tier}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP unideploy_deployment_duration_seconds Total time taken for deployment\n");
        out.push_str("# TYPE unideploy_deployment_duration_seconds histogram\n");
        for (tier, hist) in self.deployment_duration.lock().unwrap().iter() {
            let count = hist.count.load(Ordering::Relaxed);
            let sum = hist.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0;
            out.push_str(&format!(
                "unideploy_deployment_duration_seconds_count{{tier=\"{tier}\"}} {count}\n"
            ));
            out.push_str(&format!(
                "unideploy_deployment_duration_seconds_sum{{tier=\"{tier}\"}} {sum}\n"
            ));
        }

        out.push_str("# HELP unideploy_sandboxes_active_total Total number of active sandboxes\n");
        out.push_str("# TYPE unideploy_sandboxes_active_total gauge\n");
        out.push_str(&format!(
            "unideploy_sandboxes_active_total {}\n",
            self.sandboxes_active()
        ));

        out.push_str("# HELP unideploy_http_request_duration_seconds HTTP request latency\n");
        out.push_str("# TYPE unideploy_http_request_duration_seconds histogram\n");
        for ((method, endpoint), hist) in self.http_request_duration.lock().unwrap().iter() {
            let count = hist.count.load(Ordering::Relaxed);
            let sum = hist.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0;
            out.push_str(&format!(
                "unideploy_http_request_duration_seconds_count{{method=\"{method}\",endpoint=\"{endpoint}\"}} {count}\n"
            ));
            out.push_str(&format!(
                "unideploy_http_request_duration_seconds_sum{{method=\"{method}\",endpoint=\"{endpoint}\"}} {sum}\n"
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_create_and_remove() {
        let metrics = Metrics::new();
        metrics.sandbox_created();
        metrics.sandbox_created();
        metrics.sandbox_removed();
        assert_eq!(metrics.sandboxes_active(), 1);
    }

    #[test]
    fn render_includes_recorded_series() {
        let metrics = Metrics::new();
        metrics.record_deployment("live", "SEED");
        let text = metrics.render();
        assert!(text.contains("unideploy_deployments_total{status=\"live\",tier=\"SEED\"} 1"));
    }
}
