//! C7 — Project Lifecycle API.
//!
//! Every mutating operation follows the same transaction template: lock
//! the row, check the guard, write an intermediate state, perform the
//! external effect, then finalize or roll back. `start`/`stop` are
//! idempotent on their respective terminal states.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::guard;
use crate::models::{CreateProjectRequest, IntentResult, Project, ProjectStatus};
use crate::pipeline::{self, PipelineInput};
use crate::{Error, ErrorKind, Result};

pub async fn create_project(
    ctx: &Arc<Context>,
    owner_id: i64,
    req: CreateProjectRequest,
) -> Result<Project> {
    if req.name.trim().is_empty() {
        return Err(Error::new(ErrorKind::Validation, "project name must not be empty"));
    }
    let project = ctx.store.create_project(owner_id, &req).await?;
    Ok(project)
}

pub async fn list_projects(ctx: &Arc<Context>, owner_id: i64) -> Result<Vec<(Project, Option<i64>)>> {
    let projects = ctx.store.list_projects(owner_id).await?;
    let mut out = Vec::with_capacity(projects.len());
    for project in projects {
        let latest = ctx.store.latest_deployment_id(project.id).await?;
        out.push((project, latest));
    }
    Ok(out)
}

/// Starts (wakes) a project. Triggers a fresh pipeline run using the
/// project's repository. Idempotent on `RUNNING`.
pub async fn start_project(ctx: &Arc<Context>, owner_id: i64, project_id: i64) -> Result<ProjectStatus> {
    let mut tx = ctx.store.begin().await?;
    let project = ctx
        .store
        .fetch_project_locked(&mut tx, project_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "project not found"))?;

    if project.owner_id != owner_id {
        return Err(Error::new(ErrorKind::NotFound, "project not found"));
    }

    if project.is_locked {
        tx.rollback().await.ok();
        return Err(Error::new(ErrorKind::Conflict, "project has a mutation in progress"));
    }

    if project.status == ProjectStatus::Running {
        tx.rollback().await.ok();
        return Ok(ProjectStatus::Running);
    }

    if let Err(reason) = guard::can_start(&project, &ctx.store, &ctx.limits).await {
        tx.rollback().await.ok();
        ctx.intent
            .record(
                Some(project_id),
                Some(owner_id),
                "start_project",
                IntentResult::Rejected,
                Some(&reason),
                None,
            )
            .await;
        return Err(Error::new(ErrorKind::Validation, reason));
    }

    if let Err(reason) = guard::validate_transition(project.status, ProjectStatus::Waking) {
        tx.rollback().await.ok();
        ctx.intent
            .record(
                Some(project_id),
                Some(owner_id),
                "start_project",
                IntentResult::Rejected,
                Some(&reason),
                None,
            )
            .await;
        return Err(Error::new(ErrorKind::Validation, reason));
    }

    ctx.store.set_locked(&mut tx, project_id, true).await?;
    ctx.store
        .set_project_status_tx(&mut tx, project_id, ProjectStatus::Waking)
        .await?;
    tx.commit().await?;

    let deployment = ctx.store.create_deployment(project_id).await?;
    let env_vars: HashMap<String, String> = project.env_vars.0.clone();

    pipeline::spawn(
        ctx.clone(),
        PipelineInput {
            deployment_id: deployment.id,
            project_id,
            owner_id,
            project_name: project.name.clone(),
            repo_url: project.git_url.clone(),
            upload_tar_gz: None,
            tier: project.tier,
            env_vars,
            previous_status: project.status,
        },
    );

    Ok(ProjectStatus::Waking)
}

/// Stops (sleeps) a project, terminating the sandbox bound to the latest
/// `live` deployment. Idempotent on `SLEEPING`.
pub async fn stop_project(ctx: &Arc<Context>, owner_id: i64, project_id: i64) -> Result<ProjectStatus> {
    let mut tx = ctx.store.begin().await?;
    let project = ctx
        .store
        .fetch_project_locked(&mut tx, project_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "project not found"))?;

    if project.owner_id != owner_id {
        return Err(Error::new(ErrorKind::NotFound, "project not found"));
    }

    if project.is_locked {
        tx.rollback().await.ok();
        return Err(Error::new(ErrorKind::Conflict, "project has a mutation in progress"));
    }

    if project.status == ProjectStatus::Sleeping {
        tx.rollback().await.ok();
        return Ok(ProjectStatus::Sleeping);
    }

    if guard::is_read_only(&ctx.limits) {
        tx.rollback().await.ok();
        ctx.intent
            .record(
                Some(project_id),
                Some(owner_id),
                "stop_project",
                IntentResult::Rejected,
                Some("READ-ONLY"),
                None,
            )
            .await;
        return Err(Error::new(
            ErrorKind::PlatformBlocked,
            "Platform is in READ-ONLY mode for maintenance.",
        ));
    }

    if let Err(reason) = guard::validate_transition(project.status, ProjectStatus::Sleeping) {
        tx.rollback().await.ok();
        ctx.intent
            .record(
                Some(project_id),
                Some(owner_id),
                "stop_project",
                IntentResult::Rejected,
                Some(&reason),
                None,
            )
            .await;
        return Err(Error::new(ErrorKind::Validation, reason));
    }

    ctx.store.set_locked(&mut tx, project_id, true).await?;
    ctx.store
        .set_project_status_tx(&mut tx, project_id, ProjectStatus::Sleeping)
        .await?;
    tx.commit().await?;

    let kill_result = match ctx.store.latest_deployment(project_id).await? {
        Some(d) if d.status == crate::models::DeploymentStatus::Live => {
            if let Some(sandbox_id) = &d.sandbox_id {
                ctx.sandbox.kill(sandbox_id).await.map_err(|e| e.to_string())
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    };

    match kill_result {
        Ok(()) => {
            ctx.store.touch_last_active(project_id).await?;
            ctx.metrics.sandbox_removed();
            ctx.intent
                .record(
                    Some(project_id),
                    Some(owner_id),
                    "stop_project",
                    IntentResult::Success,
                    None,
                    None,
                )
                .await;
            unlock(ctx, project_id).await?;
            Ok(ProjectStatus::Sleeping)
        }
        Err(reason) => {
            ctx.store
                .set_project_status(project_id, ProjectStatus::Running)
                .await?;
            unlock(ctx, project_id).await?;
            ctx.intent
                .record(
                    Some(project_id),
                    Some(owner_id),
                    "stop_project",
                    IntentResult::Failed,
                    Some(&reason),
                    None,
                )
                .await;
            Err(Error::new(ErrorKind::Sandbox, reason))
        }
    }
}

/// Clears `is_locked` in its own committed transaction. A plain
/// `set_locked` call needs an open transaction to write through, but the
/// caller here is finalizing outside the transaction it started the
/// mutation in, so a fresh one must be opened and committed explicitly —
/// leaving it uncommitted would roll the unlock back and strand the
/// project `is_locked=true` forever.
async fn unlock(ctx: &Arc<Context>, project_id: i64) -> Result<()> {
    let mut tx = ctx.store.begin().await?;
    ctx.store.set_locked(&mut tx, project_id, false).await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;
    use std::path::PathBuf;

    async fn setup() -> (Arc<Context>, i64) {
        let store = crate::store::Store::new_in_memory().await.unwrap();
        let user = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        let ctx = Context::new_mock(store, PathBuf::from("/tmp/unideploy-test"));
        (ctx, user.id)
    }

    #[tokio::test]
    async fn create_project_defaults_to_created() {
        let (ctx, owner_id) = setup().await;
        let project = create_project(
            &ctx,
            owner_id,
            CreateProjectRequest {
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
        assert_eq!(project.status, ProjectStatus::Created);
    }

    #[tokio::test]
    async fn starting_a_created_project_is_illegal_transition() {
        let (ctx, owner_id) = setup().await;
        let project = create_project(
            &ctx,
            owner_id,
            CreateProjectRequest {
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

        let err = start_project(&ctx, owner_id, project.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn stop_on_sleeping_is_idempotent() {
        let (ctx, owner_id) = setup().await;
        let project = create_project(
            &ctx,
            owner_id,
            CreateProjectRequest {
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
            .set_project_status(project.id, ProjectStatus::Sleeping)
            .await
            .unwrap();

        let status = stop_project(&ctx, owner_id, project.id).await.unwrap();
        assert_eq!(status, ProjectStatus::Sleeping);
    }

    #[tokio::test]
    async fn start_unknown_project_is_not_found() {
        let (ctx, owner_id) = setup().await;
        let err = start_project(&ctx, owner_id, 999).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
