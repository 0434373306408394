//! C1 — Guard Library.
//!
//! Pure predicates over configuration and store-supplied counts. No guard
//! here performs a mutation; callers (C7, C6) act on the verdict.

use crate::config::Limits;
use crate::models::{Project, ProjectStatus};
use crate::store::Store;

/// Allowed edges of the project lifecycle state machine. Identity is
/// always allowed; anything else must appear here.
pub fn validate_transition(current: ProjectStatus, target: ProjectStatus) -> Result<(), String> {
    use ProjectStatus::*;
    if current == target {
        return Ok(());
    }
    let allowed: &[ProjectStatus] = match current {
        Created => &[Built],
        Built => &[Waking, Running],
        Waking => &[Running, Sleeping],
        Running => &[Sleeping],
        Sleeping => &[Waking],
    };
    if allowed.contains(&target) {
        Ok(())
    } else {
        Err(format!(
            "Illegal status transition: {current} -> {target}"
        ))
    }
}

pub fn is_read_only(limits: &Limits) -> bool {
    limits.read_only
}

pub fn validate_upload(byte_len: u64, limits: &Limits) -> Result<(), String> {
    if byte_len > limits.max_upload_bytes {
        Err("Project zip file is too large. Max 10MB allowed.".to_string())
    } else {
        Ok(())
    }
}

/// Fails if the platform is read-only or the concurrent-build ceiling is met.
pub async fn can_build(store: &Store, limits: &Limits) -> Result<(), String> {
    if is_read_only(limits) {
        return Err("Platform is in READ-ONLY mode for maintenance.".to_string());
    }
    let building = store
        .count_building()
        .await
        .map_err(|_| "failed to check build capacity".to_string())?;
    if building >= limits.max_concurrent_builds {
        Err("Platform build capacity reached. Please try again in a few minutes.".to_string())
    } else {
        Ok(())
    }
}

/// Fails if read-only, the daily quota is exhausted, the platform-wide
/// running ceiling is met, or the owner's tier-specific concurrency
/// ceiling is met (I4 for SEED; see `Limits::concurrency_ceiling`).
pub async fn can_start(project: &Project, store: &Store, limits: &Limits) -> Result<(), String> {
    if is_read_only(limits) {
        return Err("Platform is in READ-ONLY mode for maintenance.".to_string());
    }

    if project.daily_runtime_minutes >= limits.daily_runtime_limit_mins {
        return Err(format!(
            "Daily runtime limit reached ({}m). Resets tomorrow.",
            limits.daily_runtime_limit_mins
        ));
    }

    let running_global = store
        .count_running_global()
        .await
        .map_err(|_| "failed to check platform capacity".to_string())?;
    if running_global >= limits.platform_max_running {
        return Err("Platform capacity reached. Please try again later.".to_string());
    }

    let ceiling = limits.concurrency_ceiling(project.tier);
    let running_owner = store
        .count_running_for_owner(project.owner_id)
        .await
        .map_err(|_| "failed to check tenant concurrency".to_string())?;
    if running_owner >= ceiling {
        return Err("Free tier limit: Only 1 project can run at a time.".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectStatus::*;

    #[test]
    fn transition_table_matches_adjacency() {
        assert!(validate_transition(Created, Built).is_ok());
        assert!(validate_transition(Built, Waking).is_ok());
        assert!(validate_transition(Built, Running).is_ok());
        assert!(validate_transition(Waking, Running).is_ok());
        assert!(validate_transition(Waking, Sleeping).is_ok());
        assert!(validate_transition(Running, Sleeping).is_ok());
        assert!(validate_transition(Sleeping, Waking).is_ok());
    }

    #[test]
    fn identity_transition_always_allowed() {
        assert!(validate_transition(Running, Running).is_ok());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let err = validate_transition(Created, Running).unwrap_err();
        assert!(err.contains("Illegal status transition"));
        assert!(validate_transition(Created, Sleeping).is_err());
        assert!(validate_transition(Sleeping, Running).is_err());
    }

    #[test]
    fn upload_boundary_exact_max_succeeds() {
        let limits = Limits::default();
        assert!(validate_upload(limits.max_upload_bytes, &limits).is_ok());
        assert!(validate_upload(limits.max_upload_bytes + 1, &limits).is_err());
    }

    #[tokio::test]
    async fn build_ceiling_boundary() {
        let store = Store::new_in_memory().await.unwrap();
        let mut limits = Limits::default();
        limits.max_concurrent_builds = 1;
        assert!(can_build(&store, &limits).await.is_ok());
    }

    #[tokio::test]
    async fn read_only_blocks_build() {
        let store = Store::new_in_memory().await.unwrap();
        let mut limits = Limits::default();
        limits.read_only = true;
        let err = can_build(&store, &limits).await.unwrap_err();
        assert!(err.contains("READ-ONLY"));
    }
}
