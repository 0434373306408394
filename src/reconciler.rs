//! C8 — Reconciler / Maintenance Loop.
//!
//! A single long-running task that reconciles persisted `Project.status`
//! against sandbox-fleet reality, accrues runtime, enforces the daily
//! quota and idle timeout, and resets daily counters. A second sub-loop
//! probes every LIVE deployment's domain and triggers recovery on a
//! single failed probe. Grounded directly on the original's
//! `maintenance_worker` (reconciliation/runtime/reset in one pass) and
//! `MaintenanceAgent.check_all_deployments` (the separate health-probe
//! loop); per-Project work is isolated so one Project's error never
//! halts the tick, matching the original's per-project `try/except`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::context::Context;
use crate::models::{IntentResult, Project, ProjectStatus};
use crate::pipeline::{self, PipelineInput};
use crate::{Error, ErrorKind, Result};

/// Spawns the reconciler tick loop as its own task on `period`.
pub fn spawn(ctx: Arc<Context>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick(&ctx, period).await;
        }
    });
}

/// Spawns the health-probe sub-loop as its own task on `period`.
pub fn spawn_health_probe(ctx: Arc<Context>, period: Duration) {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            health_probe_tick(&ctx, &client).await;
        }
    });
}

/// One reconciler tick: snapshot sandbox reality, reconcile every
/// not-locked, not-`WAKING` Project against it, then run the daily reset
/// pass. `period` determines how many runtime minutes a confirmed-running
/// Project accrues this tick.
#[tracing::instrument(skip_all)]
async fn tick(ctx: &Arc<Context>, period: Duration) {
    let tick_minutes = std::cmp::max(1, period.as_secs() as i64 / 60);

    let active = match ctx.sandbox.list_active().await {
        Ok(set) => set,
        Err(err) => {
            tracing::warn!(error = %err, "reconciler: failed to list active sandboxes, skipping tick");
            return;
        }
    };

    let projects = match ctx.store.list_all_projects().await {
        Ok(projects) => projects,
        Err(err) => {
            tracing::warn!(error = %err, "reconciler: failed to list projects, skipping tick");
            return;
        }
    };

    let now = Utc::now();
    for project in projects {
        let project_id = project.id;
        if let Err(err) = reconcile_one(ctx, project, &active, now, tick_minutes).await {
            tracing::warn!(project_id, error = %err, "reconciler: project tick failed, continuing");
        }
    }

    if let Err(err) = daily_reset(ctx, now).await {
        tracing::warn!(error = %err, "reconciler: daily reset pass failed");
    }
}

/// Reconciles one Project against sandbox reality and enforces quotas for
/// it. Isolated from the rest of the tick by the caller.
async fn reconcile_one(
    ctx: &Arc<Context>,
    project: Project,
    active: &HashSet<String>,
    now: chrono::DateTime<Utc>,
    tick_minutes: i64,
) -> Result<()> {
    if project.is_locked || project.status == ProjectStatus::Waking {
        return Ok(());
    }

    let latest = ctx.store.latest_deployment(project.id).await?;
    let sandbox_id = latest.as_ref().and_then(|d| d.sandbox_id.clone());
    let sandbox_active = sandbox_id.as_deref().map(|id| active.contains(id)).unwrap_or(false);

    let effective_status = effective_status(project.status, sandbox_active);

    if project.status != effective_status {
        ctx.store.set_project_status(project.id, effective_status).await?;
        ctx.intent
            .record(
                Some(project.id),
                None,
                "reconcile_drift",
                IntentResult::Success,
                Some(&format!("{} -> {}", project.status, effective_status)),
                None,
            )
            .await;
        if project.status == ProjectStatus::Running && effective_status == ProjectStatus::Sleeping {
            ctx.metrics.sandbox_removed();
        }
    }

    if effective_status == ProjectStatus::Running && sandbox_active {
        ctx.store.add_runtime_minutes(project.id, tick_minutes).await?;
    }

    let refreshed = ctx
        .store
        .get_project(project.id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "project vanished during reconciliation"))?;

    if refreshed.daily_runtime_minutes >= ctx.limits.daily_runtime_limit_mins {
        auto_sleep(ctx, &refreshed, sandbox_id.as_deref(), "daily runtime limit reached").await?;
    } else if refreshed.status == ProjectStatus::Running
        && (now - refreshed.last_active_at).num_seconds() > ctx.limits.idle_timeout_secs
    {
        auto_sleep(ctx, &refreshed, sandbox_id.as_deref(), "idle timeout").await?;
    }

    Ok(())
}

/// `RUNNING` if the sandbox is confirmed active; `SLEEPING` if the
/// recorded status was previously one the fleet could plausibly have
/// dropped and no sandbox is active; otherwise unchanged.
fn effective_status(current: ProjectStatus, sandbox_active: bool) -> ProjectStatus {
    use ProjectStatus::*;
    if sandbox_active {
        Running
    } else if matches!(current, Running | Sleeping | Waking) {
        Sleeping
    } else {
        current
    }
}

async fn auto_sleep(
    ctx: &Arc<Context>,
    project: &Project,
    sandbox_id: Option<&str>,
    reason: &str,
) -> Result<()> {
    if let Some(id) = sandbox_id {
        if let Err(err) = ctx.sandbox.kill(id).await {
            tracing::warn!(project_id = project.id, error = %err, "reconciler: failed to kill sandbox during auto-sleep");
        } else {
            ctx.metrics.sandbox_removed();
        }
    }
    ctx.store.set_project_status(project.id, ProjectStatus::Sleeping).await?;
    ctx.intent
        .record(
            Some(project.id),
            None,
            "auto_sleep",
            IntentResult::Success,
            Some(reason),
            None,
        )
        .await;
    Ok(())
}

async fn daily_reset(ctx: &Arc<Context>, now: chrono::DateTime<Utc>) -> Result<()> {
    let projects = ctx.store.list_all_projects().await?;
    for project in projects {
        if (now - project.last_reset_at).num_hours() >= 24 {
            ctx.store.reset_daily_runtime(project.id).await?;
            ctx.intent
                .record(
                    Some(project.id),
                    None,
                    "daily_reset",
                    IntentResult::Success,
                    None,
                    None,
                )
                .await;
        }
    }
    Ok(())
}

/// Probes every `live` deployment's domain; a non-2xx/3xx response or a
/// 5s timeout triggers recovery. No hysteresis — a single failed probe
/// is enough, matching the original's unconditional
/// `if not is_healthy: recover`.
#[tracing::instrument(skip_all)]
async fn health_probe_tick(ctx: &Arc<Context>, client: &reqwest::Client) {
    let deployments = match ctx.store.list_live_deployments().await {
        Ok(d) => d,
        Err(err) => {
            tracing::warn!(error = %err, "health probe: failed to list live deployments");
            return;
        }
    };

    for deployment in deployments {
        let Some(domain) = deployment.domain.clone() else {
            continue;
        };
        let healthy = probe(client, &domain).await;
        if !healthy {
            tracing::warn!(deployment_id = deployment.id, domain, "health probe failed, recovering");
            if let Err(err) = recover(ctx, deployment.project_id).await {
                tracing::warn!(project_id = deployment.project_id, error = %err, "health probe: recovery failed to start");
            }
        }
    }
}

async fn probe(client: &reqwest::Client, domain: &str) -> bool {
    let url = if domain.starts_with("http") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    };
    let result = tokio::time::timeout(Duration::from_secs(5), client.get(&url).send()).await;
    match result {
        Ok(Ok(resp)) => resp.status().is_success() || resp.status().is_redirection(),
        _ => false,
    }
}

/// Re-enters the pipeline for `project_id`, following the original's
/// `recover_deployment`: a fresh sandbox is provisioned from the
/// project's repository rather than attempting an in-place repair.
async fn recover(ctx: &Arc<Context>, project_id: i64) -> Result<()> {
    let project = ctx
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "project not found for recovery"))?;

    if project.is_locked {
        return Ok(());
    }

    let deployment = ctx.store.create_deployment(project_id).await?;
    let env_vars: HashMap<String, String> = project.env_vars.0.clone();

    ctx.intent
        .record(
            Some(project_id),
            None,
            "health_probe_recovery",
            IntentResult::Success,
            Some("unhealthy domain, redeploying"),
            None,
        )
        .await;

    pipeline::spawn(
        ctx.clone(),
        PipelineInput {
            deployment_id: deployment.id,
            project_id,
            owner_id: project.owner_id,
            project_name: project.name.clone(),
            repo_url: project.git_url.clone(),
            upload_tar_gz: None,
            tier: project.tier,
            env_vars,
            previous_status: project.status,
        },
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateProjectRequest, Tier};
    use std::path::PathBuf;

    async fn setup() -> (Arc<Context>, i64) {
        let store = crate::store::Store::new_in_memory().await.unwrap();
        let user = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        let ctx = Context::new_mock(store, PathBuf::from("/tmp/unideploy-reconciler-test"));
        (ctx, user.id)
    }

    #[test]
    fn effective_status_prefers_sandbox_reality() {
        use ProjectStatus::*;
        assert_eq!(effective_status(Running, true), Running);
        assert_eq!(effective_status(Running, false), Sleeping);
        assert_eq!(effective_status(Sleeping, false), Sleeping);
        assert_eq!(effective_status(Created, false), Created);
        assert_eq!(effective_status(Built, false), Built);
    }

    #[tokio::test]
    async fn drift_is_corrected_when_sandbox_is_gone() {
        let (ctx, owner_id) = setup().await;
        let project = ctx
            .store
            .create_project(
                owner_id,
                &CreateProjectRequest {
                    name: "demo".into(),
                    project_type: None,
                    port: None,
                    git_url: None,
                    tier: Tier::Seed,
                    env_vars: None,
                },
            )
            .await
            .unwrap();
        ctx.store
            .set_project_status(project.id, ProjectStatus::Running)
            .await
            .unwrap();

        tick(&ctx, Duration::from_secs(120)).await;

        let refreshed = ctx.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, ProjectStatus::Sleeping);
    }

    #[tokio::test]
    async fn locked_project_is_skipped() {
        let (ctx, owner_id) = setup().await;
        let project = ctx
            .store
            .create_project(
                owner_id,
                &CreateProjectRequest {
                    name: "demo".into(),
                    project_type: None,
                    port: None,
                    git_url: None,
                    tier: Tier::Seed,
                    env_vars: None,
                },
            )
            .await
            .unwrap();
        ctx.store
            .set_project_status(project.id, ProjectStatus::Running)
            .await
            .unwrap();
        let mut tx = ctx.store.begin().await.unwrap();
        ctx.store.set_locked(&mut tx, project.id, true).await.unwrap();
        tx.commit().await.unwrap();

        tick(&ctx, Duration::from_secs(120)).await;

        let refreshed = ctx.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, ProjectStatus::Running);
    }

    #[tokio::test]
    async fn daily_reset_zeroes_stale_counters() {
        let (ctx, owner_id) = setup().await;
        let project = ctx
            .store
            .create_project(
                owner_id,
                &CreateProjectRequest {
                    name: "demo".into(),
                    project_type: None,
                    port: None,
                    git_url: None,
                    tier: Tier::Seed,
                    env_vars: None,
                },
            )
            .await
            .unwrap();
        ctx.store.add_runtime_minutes(project.id, 30).await.unwrap();
        let mut tx = ctx.store.begin().await.unwrap();
        sqlx::query("UPDATE projects SET last_reset_at = datetime('now', '-2 days') WHERE id = ?1")
            .bind(project.id)
            .execute(&mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        daily_reset(&ctx, Utc::now()).await.unwrap();

        let refreshed = ctx.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(refreshed.daily_runtime_minutes, 0);
    }
}
