//! Environment-driven runtime limits, named and defaulted per §6.

use std::env;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "malformed environment value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => raw.eq_ignore_ascii_case("true") || raw == "1",
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub daily_runtime_limit_mins: i64,
    pub platform_max_running: i64,
    pub max_concurrent_builds: i64,
    pub max_upload_bytes: u64,
    pub idle_timeout_secs: i64,
    pub read_only: bool,
    pub allowed_origins: Vec<String>,
    pub public_suffix: String,
}

impl Limits {
    /// Per-tier ceiling on simultaneously `RUNNING` projects for one owner.
    /// SEED keeps the source's implicit behavior (I4: at most one); LAUNCH
    /// and SCALE are given the smallest finite ceilings consistent with
    /// SEED < LAUNCH < SCALE, since the source only ever checked SEED
    /// (see the Open Question resolution in DESIGN.md).
    pub fn concurrency_ceiling(&self, tier: crate::models::Tier) -> i64 {
        match tier {
            crate::models::Tier::Seed => 1,
            crate::models::Tier::Launch => 3,
            crate::models::Tier::Scale => 10,
        }
    }

    pub fn from_env() -> Self {
        let origins = env::var("ALLOWED_ORIGINS").unwrap_or_default();
        Self {
            daily_runtime_limit_mins: env_or("DAILY_RUNTIME_LIMIT_MINS", 60),
            platform_max_running: env_or("PLATFORM_MAX_RUNNING", 40),
            max_concurrent_builds: env_or("MAX_CONCURRENT_BUILDS", 5),
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", 10_485_760),
            idle_timeout_secs: env_or("IDLE_TIMEOUT_SECS", 900),
            read_only: env_bool("READ_ONLY", false),
            allowed_origins: origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            public_suffix: env::var("PUBLIC_SUFFIX").unwrap_or_else(|_| "example.com".into()),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            daily_runtime_limit_mins: 60,
            platform_max_running: 40,
            max_concurrent_builds: 5,
            max_upload_bytes: 10_485_760,
            idle_timeout_secs: 900,
            read_only: false,
            allowed_origins: Vec::new(),
            public_suffix: "example.com".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_spec() {
        let limits = Limits::default();
        assert_eq!(limits.daily_runtime_limit_mins, 60);
        assert_eq!(limits.platform_max_running, 40);
        assert_eq!(limits.max_concurrent_builds, 5);
        assert_eq!(limits.max_upload_bytes, 10_485_760);
        assert!(!limits.read_only);
    }

    #[test]
    fn concurrency_ceiling_is_ordered_by_tier() {
        let limits = Limits::default();
        use crate::models::Tier;
        assert!(
            limits.concurrency_ceiling(Tier::Seed)
                < limits.concurrency_ceiling(Tier::Launch)
        );
        assert!(
            limits.concurrency_ceiling(Tier::Launch)
                < limits.concurrency_ceiling(Tier::Scale)
        );
    }
}
