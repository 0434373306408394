//! C6 — Deployment Pipeline.
//!
//! End-to-end orchestration of one deployment attempt. Each stage is a
//! plain function returning a `Result`; errors carry a stage tag so the
//! caller can decide fatal vs. non-fatal handling and AutoFix eligibility,
//! replacing the exception-driven control flow of the source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::broker::LogFrame;
use crate::build;
use crate::context::Context;
use crate::guard;
use crate::models::{DeploymentStatus, IntentResult, ProjectStatus, Tier};
use crate::sandbox::{CreateRequest, LineSink, SandboxStatus};

pub struct PipelineInput {
    pub deployment_id: i64,
    pub project_id: i64,
    pub owner_id: i64,
    pub project_name: String,
    pub repo_url: Option<String>,
    pub upload_tar_gz: Option<Vec<u8>>,
    pub tier: Tier,
    pub env_vars: HashMap<String, String>,
    /// Project status to roll back to if the pipeline fails.
    pub previous_status: ProjectStatus,
}

/// Every stage that can return this is fatal by construction: non-fatal
/// collaborator failures (indexing) are handled inline and never bubble up.
#[derive(Debug)]
pub(crate) struct StageError {
    message: String,
}

impl StageError {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }
}

/// Slugifies a project name for the derived domain: lowercase, spaces to
/// `-`, strip everything outside `[a-z0-9-]`.
pub fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

pub fn derived_domain(project_name: &str, public_suffix: &str) -> String {
    format!("{}.app.{}", slug(project_name), public_suffix)
}

/// Spawns the pipeline as its own task, scoped to its own persistence
/// handle acquired at task start (the `Context`'s `Store` is a cheaply
/// cloneable pool handle, not a shared session).
pub fn spawn(ctx: Arc<Context>, input: PipelineInput) {
    tokio::spawn(async move {
        run(ctx, input).await;
    });
}

#[tracing::instrument(skip(ctx, input), fields(deployment_id = input.deployment_id, project_id = input.project_id))]
async fn run(ctx: Arc<Context>, input: PipelineInput) {
    let started = Instant::now();
    let workspace = ctx.workspace_root.join(input.deployment_id.to_string());

    let outcome = run_stages(&ctx, &input, &workspace).await;

    match outcome {
        Ok(()) => {
            ctx.metrics
                .observe_deployment_duration(&input.tier.to_string(), started.elapsed());
        }
        Err(stage_err) => {
            handle_failure(&ctx, &input, &stage_err.message).await;
        }
    }

    let _ = tokio::fs::remove_dir_all(&workspace).await;
}

async fn run_stages(
    ctx: &Arc<Context>,
    input: &PipelineInput,
    workspace: &PathBuf,
) -> Result<(), StageError> {
    tokio::fs::create_dir_all(workspace)
        .await
        .map_err(|e| StageError::fatal(format!("failed to prepare workspace: {e}")))?;

    // Stage 1: queued -> cloning
    advance(ctx, input, DeploymentStatus::Cloning, LogFrame::status("cloning")).await;
    clone_or_extract(
        input.repo_url.as_deref(),
        input.upload_tar_gz.as_deref(),
        workspace,
    )
    .await?;

    // Stage 2: cloning -> building
    advance(ctx, input, DeploymentStatus::Building, LogFrame::status("building")).await;
    let plan = build::detect(workspace);
    if plan.kind == build::ProjectKind::Unknown {
        return Err(StageError::fatal(
            "could not detect a supported framework at the project root",
        ));
    }
    let (on_line, forwarder) = spawn_line_forwarder(ctx, input.deployment_id, "building");
    let image_tag = build::run(&plan, workspace, move |line| on_line(line))
        .await
        .map_err(|e| StageError::fatal(e.to_string()))?;
    let _ = forwarder.await;

    // Stage 3: building -> indexing (non-fatal on failure)
    advance(ctx, input, DeploymentStatus::Indexing, LogFrame::status("indexing")).await;
    if let Err(err) = index_workspace(ctx, input).await {
        tracing::warn!(error = %err, "vector index submission failed, continuing");
    }

    // Stage 4: indexing -> deploying
    advance(ctx, input, DeploymentStatus::Deploying, LogFrame::status("deploying")).await;
    let (on_stdout, stdout_forwarder) = spawn_line_forwarder(ctx, input.deployment_id, "deploying");
    let (on_stderr_raw, stderr_forwarder) = spawn_line_forwarder(ctx, input.deployment_id, "deploying");
    let on_stderr: LineSink = Box::new(move |line: &str| on_stderr_raw(&format!("[err] {line}")));

    let handle = ctx
        .sandbox
        .create(
            CreateRequest {
                repo_url: input.repo_url.as_deref().unwrap_or(""),
                build_cmd: plan.build_cmd.as_deref(),
                start_cmd: plan.start_cmd.as_deref(),
                env_vars: &input.env_vars,
                tier: input.tier,
            },
            &on_stdout,
            &on_stderr,
        )
        .await
        .map_err(|e| StageError::fatal(e.to_string()))?;
    drop(on_stdout);
    drop(on_stderr);
    let _ = stdout_forwarder.await;
    let _ = stderr_forwarder.await;

    if handle.status != SandboxStatus::Running {
        return Err(StageError::fatal("sandbox did not reach a running state"));
    }

    ctx.metrics.sandbox_created();
    let domain = derived_domain(&input.project_name, &ctx.limits.public_suffix);

    ctx.store
        .set_deployment_live(input.deployment_id, &handle.id, &domain, &image_tag)
        .await
        .map_err(|e| StageError::fatal(e.to_string()))?;

    finalize_success(ctx, input, &domain).await;

    ctx.broker
        .broadcast(
            input.deployment_id,
            LogFrame::status("live").with_domain(domain),
        )
        .await;

    ctx.cost
        .log_sandbox_usage(&handle.id, 60.0, input.tier)
        .await;

    Ok(())
}

/// Returns a synchronous line sink plus a background task that forwards
/// every line to the broker in the order it was sent, preserving the
/// per-`deployment_id` FIFO ordering guarantee even though the sink itself
/// cannot `.await`. Drop the sink to let the forwarder drain and exit.
fn spawn_line_forwarder(
    ctx: &Arc<Context>,
    deployment_id: i64,
    status: &'static str,
) -> (LineSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let broker = ctx.broker.clone();
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            broker
                .broadcast(deployment_id, LogFrame::status(status).with_log(line))
                .await;
        }
    });
    let sink: LineSink = Box::new(move |line: &str| {
        let _ = tx.send(line.to_string());
    });
    (sink, handle)
}

/// Materializes a workspace from either a git repository or an uploaded
/// tar.gz archive. Shared with the `/analyze` family of handlers, which
/// need the same source-acquisition step without running the rest of the
/// pipeline.
pub(crate) async fn clone_or_extract(
    repo_url: Option<&str>,
    upload_tar_gz: Option<&[u8]>,
    workspace: &std::path::Path,
) -> Result<(), StageError> {
    if let Some(repo_url) = repo_url {
        let status = tokio::process::Command::new("git")
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg(repo_url)
            .arg(workspace)
            .status()
            .await
            .map_err(|e| StageError::fatal(format!("failed to spawn git: {e}")))?;
        if !status.success() {
            return Err(StageError::fatal("git clone failed"));
        }
        Ok(())
    } else if let Some(bytes) = upload_tar_gz {
        let workspace = workspace.to_path_buf();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_tar_gz(&bytes, &workspace))
            .await
            .map_err(|e| StageError::fatal(format!("extraction task panicked: {e}")))?
            .map_err(|e| StageError::fatal(format!("failed to extract archive: {e}")))
    } else {
        Err(StageError::fatal("deployment has neither repo_url nor an uploaded archive"))
    }
}

pub(crate) fn extract_tar_gz(bytes: &[u8], dest: &std::path::Path) -> std::io::Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)
}

/// Inverse of [`extract_tar_gz`]: packages `dir` into an in-memory tar.gz
/// archive, used by AutoFix to feed a patched workspace back into the
/// pipeline without needing a real upstream push.
pub(crate) fn package_tar_gz(dir: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()
}

async fn index_workspace(ctx: &Arc<Context>, input: &PipelineInput) -> Result<(), String> {
    // The out-of-scope vector-index collaborator is consulted so future
    // AutoFix runs for this project have code context; failure here must
    // never fail the deployment.
    let _ = ctx
        .vector_index
        .top_k_snippets(&format!("project:{}", input.project_id), input.project_id)
        .await;
    Ok(())
}

async fn advance(ctx: &Arc<Context>, input: &PipelineInput, status: DeploymentStatus, frame: LogFrame) {
    if let Err(err) = ctx.store.set_deployment_status(input.deployment_id, status).await {
        tracing::warn!(error = %err, "failed to persist deployment status");
    }
    ctx.broker.broadcast(input.deployment_id, frame).await;
}

async fn finalize_success(ctx: &Arc<Context>, input: &PipelineInput, _domain: &str) {
    if let Ok(Some(project)) = ctx.store.get_project(input.project_id).await {
        if guard::validate_transition(project.status, ProjectStatus::Running).is_ok() {
            let _ = ctx
                .store
                .set_project_status(input.project_id, ProjectStatus::Running)
                .await;
        }
    }
    let mut tx = match ctx.store.begin().await {
        Ok(tx) => tx,
        Err(_) => return,
    };
    let _ = ctx.store.set_locked(&mut tx, input.project_id, false).await;
    let _ = tx.commit().await;
    let _ = ctx.store.touch_last_active(input.project_id).await;
    let _ = ctx.store.set_last_deployed(input.project_id).await;

    ctx.metrics.record_deployment("live", &input.tier.to_string());
    ctx.intent
        .record(
            Some(input.project_id),
            Some(input.owner_id),
            "deploy",
            IntentResult::Success,
            None,
            None,
        )
        .await;
}

async fn handle_failure(ctx: &Arc<Context>, input: &PipelineInput, message: &str) {
    let _ = ctx
        .store
        .set_deployment_failed(input.deployment_id, message)
        .await;

    let mut tx = match ctx.store.begin().await {
        Ok(tx) => tx,
        Err(_) => return,
    };
    let _ = ctx
        .store
        .set_project_status_tx(&mut tx, input.project_id, input.previous_status)
        .await;
    let _ = ctx.store.set_locked(&mut tx, input.project_id, false).await;
    let _ = tx.commit().await;

    ctx.metrics.record_deployment("failed", &input.tier.to_string());

    let autofix = crate::autofix::analyze_and_fix(
        input.project_id,
        message,
        &ctx.workspace_root.join(input.deployment_id.to_string()).to_string_lossy(),
        ctx.ai.as_ref(),
        ctx.vector_index.as_ref(),
        ctx.wisdom.as_ref(),
        ctx.sandbox.as_ref(),
    )
    .await
    .ok();

    let autofix_json = autofix.as_ref().and_then(|a| serde_json::to_value(a).ok());

    ctx.broker
        .broadcast(
            input.deployment_id,
            LogFrame {
                status: "failed".to_string(),
                message: None,
                log: None,
                error: Some(message.to_string()),
                domain: None,
                autofix: autofix_json,
            },
        )
        .await;

    ctx.intent
        .record(
            Some(input.project_id),
            Some(input.owner_id),
            "deploy",
            IntentResult::Failed,
            Some(message),
            None,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_strips_and_lowercases() {
        assert_eq!(slug("My Cool App!"), "my-cool-app");
    }

    #[test]
    fn derived_domain_uses_public_suffix() {
        assert_eq!(
            derived_domain("My App", "example.com"),
            "my-app.app.example.com"
        );
    }
}
