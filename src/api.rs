//! C10 — HTTP/WS Surface.
//!
//! A thin REST + WebSocket layer over C1/C2/C6/C7/C9/C11. Handlers
//! translate requests into calls against [`crate::project`],
//! [`crate::pipeline`] and [`crate::autofix`] and never touch the store
//! directly except for read-only lookups; mutation always goes through the
//! transaction templates those modules already implement.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Extension, FromRequestParts, Multipart, Path, Query};
use axum::headers::{authorization::Bearer, Authorization};
use axum::http::request::Parts;
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router, TypedHeader};
use hyper::Request;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::autofix;
use crate::build::{self, BuildPlan, ProjectKind};
use crate::context::Context;
use crate::cost::CostLedgerSnapshot;
use crate::guard;
use crate::models::{
    CreateProjectRequest, DeploymentStatus, GitDeployRequest, IntentResult, Project,
    ProjectStatus, Tier, User,
};
use crate::pipeline::{self, PipelineInput};
use crate::project;
use crate::{Error, ErrorKind, Result};

/// Builds the complete HTTP/WS router. Layer order matters: layers added
/// later wrap those added earlier, so the `Extension(ctx)` layer is added
/// after `track_metrics` so the context is already present in request
/// extensions by the time the middleware runs.
pub fn router(ctx: Arc<Context>) -> Router {
    let upload_limit = DefaultBodyLimit::max(ctx.limits.max_upload_bytes as usize);

    Router::new()
        .route("/", get(root))
        .route("/projects", post(create_project).get(list_projects))
        .route("/analyze", post(analyze_repo))
        .route("/analyze/zip", post(analyze_zip).layer(upload_limit.clone()))
        .route("/deploy/:project_id", post(deploy_upload).layer(upload_limit))
        .route("/deploy/:project_id/git", post(deploy_git))
        .route("/projects/:id/start", post(start_project))
        .route("/projects/:id/stop", post(stop_project))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/apply-fix", post(apply_fix))
        .route("/system/config", get(system_config))
        .route("/system/cost", get(system_cost))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws/deploy/:id", get(ws_deploy))
        .layer(middleware::from_fn(track_metrics))
        .layer(Extension(ctx.clone()))
        .layer(cors_layer(&ctx))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn cors_layer(ctx: &Context) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    if ctx.limits.allowed_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<_> = ctx
            .limits
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn track_metrics(
    Extension(ctx): Extension<Arc<Context>>,
    req: Request<axum::body::Body>,
    next: Next<axum::body::Body>,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    ctx.metrics.observe_http_request(&method, &path, started.elapsed());
    response
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "online", "service": "unideploy-gateway" }))
}

/// Extracts and verifies the caller's identity, upserting a [`User`] on
/// first success. The verifier collaborator is the Rust analogue of the
/// original's Firebase `verify_id_token` call.
struct AuthenticatedUser(User);

#[async_trait]
impl FromRequestParts<()> for AuthenticatedUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &()) -> Result<Self> {
        let ctx = parts
            .extensions
            .get::<Arc<Context>>()
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Integration, "application context missing"))?;

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| Error::new(ErrorKind::Unauthorized, "missing bearer token"))?;

        let identity = ctx
            .verifier
            .verify(bearer.token())
            .await
            .map_err(|_| Error::new(ErrorKind::Unauthorized, "invalid authentication token"))?;

        let user = ctx
            .store
            .upsert_user(&identity.external_id, &identity.email, &identity.name)
            .await?;

        Ok(AuthenticatedUser(user))
    }
}

// -- projects ------------------------------------------------------------

async fn create_project(
    AuthenticatedUser(user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<crate::models::ProjectResponse>> {
    let created = project::create_project(&ctx, user.id, req).await?;
    Ok(Json(created.into_response(None)))
}

async fn list_projects(
    AuthenticatedUser(user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
) -> Result<Json<Vec<crate::models::ProjectResponse>>> {
    let projects = project::list_projects(&ctx, user.id).await?;
    Ok(Json(
        projects
            .into_iter()
            .map(|(project, latest)| project.into_response(latest))
            .collect(),
    ))
}

async fn owned_project(ctx: &Arc<Context>, owner_id: i64, project_id: i64) -> Result<Project> {
    let project = ctx
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "project not found"))?;
    if project.owner_id != owner_id {
        return Err(Error::new(ErrorKind::NotFound, "project not found"));
    }
    Ok(project)
}

// -- lifecycle -------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    status: ProjectStatus,
}

async fn start_project(
    AuthenticatedUser(user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    Path(project_id): Path<i64>,
) -> Result<Json<StatusResponse>> {
    let status = project::start_project(&ctx, user.id, project_id).await?;
    Ok(Json(StatusResponse { status }))
}

async fn stop_project(
    AuthenticatedUser(user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    Path(project_id): Path<i64>,
) -> Result<Json<StatusResponse>> {
    let status = project::stop_project(&ctx, user.id, project_id).await?;
    Ok(Json(StatusResponse { status }))
}

// -- analyze ---------------------------------------------------------------

#[derive(serde::Deserialize)]
struct AnalyzeQuery {
    repo_url: String,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    build_command: Option<String>,
    start_command: Option<String>,
    port: Option<i64>,
    recommended_tier: Tier,
    tier_reasoning: String,
    files: Vec<String>,
    suggestion_engine: String,
}

async fn analyze_repo(
    AuthenticatedUser(_user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    Query(query): Query<AnalyzeQuery>,
) -> Result<Json<AnalyzeResponse>> {
    let response = run_analysis(&ctx, Some(&query.repo_url), None).await?;
    Ok(Json(response))
}

async fn analyze_zip(
    AuthenticatedUser(_user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    multipart: Multipart,
) -> Result<Json<AnalyzeResponse>> {
    let bytes = read_multipart_file(multipart).await?;
    guard::validate_upload(bytes.len() as u64, &ctx.limits).map_err(|reason| Error::new(ErrorKind::PayloadTooLarge, reason))?;
    let response = run_analysis(&ctx, None, Some(bytes)).await?;
    Ok(Json(response))
}

/// Clones or extracts the source into a scratch workspace, detects its
/// framework, and consults the AI collaborator for a one-line rationale —
/// falling back to the heuristic detector's own reasoning when no AI
/// collaborator is configured, mirroring the original analyzer's
/// LLM-then-fallback structure. The workspace is always removed, win or
/// lose.
async fn run_analysis(
    ctx: &Arc<Context>,
    repo_url: Option<&str>,
    upload: Option<Vec<u8>>,
) -> Result<AnalyzeResponse> {
    let workspace = ctx.workspace_root.join(format!("analyze-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&workspace)
        .await
        .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to prepare analysis workspace"))?;

    let outcome = async {
        pipeline::clone_or_extract(repo_url, upload.as_deref(), &workspace)
            .await
            .map_err(|e| {
                let kind = if repo_url.is_some() {
                    ErrorKind::UpstreamUnavailable
                } else {
                    ErrorKind::Integration
                };
                Error::new(kind, e.message().to_string())
            })?;

        let plan = build::detect(&workspace);
        let files = {
            let root = workspace.clone();
            tokio::task::spawn_blocking(move || list_files(&root))
                .await
                .map_err(|e| Error::from_source(ErrorKind::Integration, e, "analysis task panicked"))?
        };

        let (recommended_tier, tier_reasoning) = recommend_tier(&plan);

        let suggestion_engine = match ctx
            .ai
            .complete(
                "You are a DevOps expert recommending a deployment configuration.",
                &format!("Detected framework: {}. Sample files: {:?}", plan.framework, files),
            )
            .await
        {
            Ok(text) => text,
            Err(_) => format!("Fallback: heuristic detection ({})", plan.framework),
        };

        Ok(AnalyzeResponse {
            id: uuid::Uuid::new_v4().to_string(),
            kind: plan.framework.clone(),
            build_command: plan.build_cmd.clone(),
            start_command: plan.start_cmd.clone(),
            port: None,
            recommended_tier,
            tier_reasoning,
            files,
            suggestion_engine,
        })
    }
    .await;

    let _ = tokio::fs::remove_dir_all(&workspace).await;
    outcome
}

fn recommend_tier(plan: &BuildPlan) -> (Tier, String) {
    match (plan.kind, plan.framework.as_str()) {
        (ProjectKind::Unknown, _) => (
            Tier::Seed,
            "Could not detect a framework; starting on the smallest tier.".to_string(),
        ),
        (ProjectKind::Static, _) => (
            Tier::Seed,
            "Static sites serve pre-built assets and need minimal resources.".to_string(),
        ),
        (ProjectKind::Dynamic, "python") => (
            Tier::Launch,
            "Python web frameworks hold a persistent process and benefit from LAUNCH headroom.".to_string(),
        ),
        (ProjectKind::Dynamic, _) => (
            Tier::Seed,
            "Lightweight Node.js service detected; SEED tier is sufficient to start.".to_string(),
        ),
    }
}

/// Depth-first listing of every regular file under `root`, skipping `.git`,
/// bounded to 50 entries the way the original analyzer truncates its own
/// file listing.
fn list_files(root: &std::path::Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().into_owned());
            }
            if out.len() >= 50 {
                return out;
            }
        }
    }
    out
}

async fn read_multipart_file(mut multipart: Multipart) -> Result<Vec<u8>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::from_source(ErrorKind::Validation, e, "invalid multipart payload"))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::from_source(ErrorKind::Validation, e, "failed to read uploaded file"))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(Error::new(ErrorKind::Validation, "no file uploaded"))
}

// -- deploy ------------------------------------------------------------

#[derive(Serialize)]
struct DeployAccepted {
    deployment_id: i64,
    status: DeploymentStatus,
}

async fn deploy_upload(
    AuthenticatedUser(user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    Path(project_id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<DeployAccepted>> {
    let project = owned_project(&ctx, user.id, project_id).await?;

    if let Err(reason) = guard::can_build(&ctx.store, &ctx.limits).await {
        record_rejected(&ctx, project_id, user.id, "deploy", &reason).await;
        return Err(Error::new(ErrorKind::PlatformBlocked, reason));
    }

    let bytes = read_multipart_file(multipart).await?;

    if let Err(reason) = guard::validate_upload(bytes.len() as u64, &ctx.limits) {
        record_rejected(&ctx, project_id, user.id, "deploy", &reason).await;
        return Err(Error::new(ErrorKind::PayloadTooLarge, reason));
    }

    if let Err(reason) = guard::can_build(&ctx.store, &ctx.limits).await {
        record_rejected(&ctx, project_id, user.id, "deploy", &reason).await;
        return Err(Error::new(ErrorKind::PlatformBlocked, reason));
    }

    let deployment = ctx.store.create_deployment(project_id).await?;
    pipeline::spawn(
        ctx.clone(),
        PipelineInput {
            deployment_id: deployment.id,
            project_id,
            owner_id: user.id,
            project_name: project.name.clone(),
            repo_url: None,
            upload_tar_gz: Some(bytes),
            tier: project.tier,
            env_vars: project.env_vars.0.clone(),
            previous_status: project.status,
        },
    );

    Ok(Json(DeployAccepted {
        deployment_id: deployment.id,
        status: DeploymentStatus::Queued,
    }))
}

async fn deploy_git(
    AuthenticatedUser(user): AuthenticatedUser,
    Extension(ctx): Extension<Arc<Context>>,
    Path(project_id): Path<i64>,
    Json(req): Json<GitDeployRequest>,
) -> Result<Json<DeployAccepted>> {
    let project = owned_project(&ctx, user.id, project_id).await?;

    if let Err(reason) = guard::can_build(&ctx.store, &ctx.limits).await {
        record_rejected(&ctx, project_id, user.id, "deploy", &reason).await;
        return Err(Error::new(ErrorKind::PlatformBlocked, reason));
    }

    let deployment = ctx.store.create_deployment(project_id).await?;
    pipeline::spawn(
        ctx.clone(),
        PipelineInput {
            deployment_id: deployment.id,
            project_id,
            owner_id: user.id,
            project_name: project.name.clone(),
            repo_url: Some(req.repo_url),
            upload_tar_gz: None,
            tier: project.tier,
            env_vars: project.env_vars.0.clone(),
            previous_status: project.status,
        },
    );

    Ok(Json(DeployAccepted {
        deployment_id: deployment.id,
        status: DeploymentStatus::Queued,
    }))
}

async fn record_rejected(ctx: &Arc<Context>, project_id: i64, user_id: i64, intent: &str, reason: &str) {
    ctx.intent
        .record(Some(project_id), Some(user_id), intent, IntentResult::Rejected, Some(reason), None)
        .await;
}

// -- deployments ---------------------------------------------------------

async fn get_deployment(
    Extension(ctx): Extension<Arc<Context>>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<crate::models::Deployment>> {
    let deployment = ctx
        .store
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "deployment not found"))?;
    Ok(Json(deployment))
}

#[derive(Serialize)]
struct ApplyFixResponse {
    status: &'static str,
    patched_file: String,
}

/// Applies the AutoFix suggestion and enqueues a fresh deployment. Since
/// this crate never pushes to the project's upstream repository, the
/// patched workspace is re-packaged into a tar.gz in memory and fed to the
/// pipeline the same way an uploaded project would be, rather than relying
/// on a redundant clone picking up the same unfixed source.
async fn apply_fix(
    Extension(ctx): Extension<Arc<Context>>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<ApplyFixResponse>> {
    let deployment = ctx
        .store
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "deployment not found"))?;
    let project = ctx
        .store
        .get_project(deployment.project_id)
        .await?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "project not found"))?;

    let repo_url = project
        .git_url
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::Validation, "apply-fix requires a git-backed project"))?;
    let error_log = deployment.error_message.clone().unwrap_or_else(|| "Unknown error".to_string());

    let workspace = ctx.workspace_root.join(format!("autofix-{deployment_id}"));
    tokio::fs::create_dir_all(&workspace)
        .await
        .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to prepare autofix workspace"))?;

    let result = apply_fix_inner(&ctx, &project, &error_log, &repo_url, &workspace).await;
    let _ = tokio::fs::remove_dir_all(&workspace).await;
    result.map(Json)
}

async fn apply_fix_inner(
    ctx: &Arc<Context>,
    project: &Project,
    error_log: &str,
    repo_url: &str,
    workspace: &PathBuf,
) -> Result<ApplyFixResponse> {
    pipeline::clone_or_extract(Some(repo_url), None, workspace)
        .await
        .map_err(|e| Error::from_source(ErrorKind::Integration, std::io::Error::new(std::io::ErrorKind::Other, e.message().to_string()), "failed to prepare autofix workspace"))?;

    let outcome = autofix::analyze_and_fix(
        project.id,
        error_log,
        &workspace.to_string_lossy(),
        ctx.ai.as_ref(),
        ctx.vector_index.as_ref(),
        ctx.wisdom.as_ref(),
        ctx.sandbox.as_ref(),
    )
    .await
    .map_err(|e| Error::new(ErrorKind::Validation, format!("could not generate a fix to apply: {e}")))?;

    let focus_path = workspace.join(&outcome.focus_file);
    autofix::apply_fix(&focus_path, &outcome.suggestion, project.id, ctx.wisdom.as_ref())
        .await
        .map_err(|e| match e {
            autofix::ApplyFixError::TooShort => {
                Error::new(ErrorKind::Validation, "generated fix was too short to apply")
            }
            autofix::ApplyFixError::Io(io) => {
                Error::from_source(ErrorKind::Integration, io, "failed to write patched file")
            }
        })?;

    let archive = {
        let dir = workspace.clone();
        tokio::task::spawn_blocking(move || pipeline::package_tar_gz(&dir))
            .await
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "autofix packaging task panicked"))?
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to package patched workspace"))?
    };

    let new_deployment = ctx.store.create_deployment(project.id).await?;
    pipeline::spawn(
        ctx.clone(),
        PipelineInput {
            deployment_id: new_deployment.id,
            project_id: project.id,
            owner_id: project.owner_id,
            project_name: project.name.clone(),
            repo_url: None,
            upload_tar_gz: Some(archive),
            tier: project.tier,
            env_vars: project.env_vars.0.clone(),
            previous_status: project.status,
        },
    );

    ctx.intent
        .record(
            Some(project.id),
            None,
            "apply_fix",
            IntentResult::Success,
            Some(&outcome.focus_file),
            None,
        )
        .await;

    Ok(ApplyFixResponse {
        status: "success",
        patched_file: outcome.focus_file,
    })
}

// -- system ----------------------------------------------------------------

#[derive(Serialize)]
struct SystemConfigResponse {
    read_only: bool,
    maintenance: bool,
    daily_limit_mins: i64,
}

async fn system_config(Extension(ctx): Extension<Arc<Context>>) -> Json<SystemConfigResponse> {
    Json(SystemConfigResponse {
        read_only: ctx.limits.read_only,
        maintenance: ctx.limits.read_only,
        daily_limit_mins: ctx.limits.daily_runtime_limit_mins,
    })
}

async fn system_cost(Extension(ctx): Extension<Arc<Context>>) -> Json<CostLedgerSnapshot> {
    Json(ctx.cost.summary().await)
}

#[derive(Serialize)]
struct HealthStats {
    projects: i64,
    total_deployments: i64,
    sandboxes_active: i64,
    engine: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    version: &'static str,
    stats: HealthStats,
}

async fn health(Extension(ctx): Extension<Arc<Context>>) -> Result<Json<HealthResponse>> {
    let projects = ctx.store.count_projects().await?;
    let total_deployments = ctx.store.count_deployments().await?;
    Ok(Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        stats: HealthStats {
            projects,
            total_deployments,
            sandboxes_active: ctx.metrics.sandboxes_active(),
            engine: "pluggable-sandbox-provider".to_string(),
        },
    }))
}

async fn metrics(Extension(ctx): Extension<Arc<Context>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.render(),
    )
}

// -- websocket ---------------------------------------------------------------

async fn ws_deploy(
    Extension(ctx): Extension<Arc<Context>>,
    Path(deployment_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_deploy_logs(socket, ctx, deployment_id))
}

/// Forwards every broadcast frame for `deployment_id` to the socket as
/// JSON text. Client-sent text is read and discarded purely to detect
/// disconnects; the protocol carries no client-to-server payload.
async fn stream_deploy_logs(mut socket: WebSocket, ctx: Arc<Context>, deployment_id: i64) {
    let mut rx = ctx.broker.subscribe(deployment_id).await;
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(payload) = serde_json::to_string(&frame) else { continue };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildPlan, ProjectKind};
    use crate::config::Limits;
    use crate::models::{CreateProjectRequest, IntentResult, Tier};
    use crate::store::Store;
    use hyper::Body;
    use std::path::PathBuf;
    use tower::ServiceExt;

    async fn project_with_status(
        ctx: &Arc<Context>,
        owner_id: i64,
        name: &str,
        status: ProjectStatus,
        tier: Tier,
    ) -> i64 {
        let project = project::create_project(
            ctx,
            owner_id,
            CreateProjectRequest {
                name: name.into(),
                project_type: None,
                port: None,
                git_url: None,
                tier,
                env_vars: None,
            },
        )
        .await
        .unwrap();
        ctx.store.set_project_status(project.id, status).await.unwrap();
        project.id
    }

    async fn body_string(response: Response) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Scenario 2 (spec §8): with the platform READ-ONLY, a git deploy is
    /// blocked before a Deployment row is ever created, and the rejection
    /// is recorded to the intent log.
    #[tokio::test]
    async fn read_only_block_returns_503_with_no_deployment_row() {
        let store = Store::new_in_memory().await.unwrap();
        let user = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        let limits = Limits { read_only: true, ..Limits::default() };
        let ctx = Context::new_mock_with_limits(store.clone(), PathBuf::from("/tmp/unideploy-test"), limits);
        let project_id = project_with_status(&ctx, user.id, "demo", ProjectStatus::Built, Tier::Seed).await;
        let intent = ctx.intent.clone();

        let router = router(ctx);
        let request = hyper::Request::builder()
            .method("POST")
            .uri(format!("/deploy/{project_id}/git"))
            .header("authorization", "Bearer tok-1")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"repo_url":"https://x/y.git"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(store.count_deployments().await.unwrap(), 0);

        let recent = intent.recent().await;
        let rejection = recent
            .iter()
            .find(|entry| entry.project_id == Some(project_id))
            .expect("rejection was not recorded to the intent log");
        assert_eq!(rejection.result, IntentResult::Rejected);
        assert!(rejection.reason.as_deref().unwrap_or_default().contains("READ-ONLY"));
    }

    /// Scenario 3 (spec §8): the owner already has one project RUNNING
    /// under SEED tier, so starting a second is blocked with a 400 whose
    /// body names the free-tier limit, and the target project's status is
    /// left untouched.
    #[tokio::test]
    async fn concurrency_limit_returns_400_free_tier() {
        let store = Store::new_in_memory().await.unwrap();
        let user = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        let ctx = Context::new_mock(store.clone(), PathBuf::from("/tmp/unideploy-test"));
        let _running = project_with_status(&ctx, user.id, "seven", ProjectStatus::Running, Tier::Seed).await;
        let candidate = project_with_status(&ctx, user.id, "eight", ProjectStatus::Built, Tier::Seed).await;

        let router = router(ctx);
        let request = hyper::Request::builder()
            .method("POST")
            .uri(format!("/projects/{candidate}/start"))
            .header("authorization", "Bearer tok-1")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.contains("Free tier"), "body was: {body}");

        let after = store.get_project(candidate).await.unwrap().unwrap();
        assert_eq!(after.status, ProjectStatus::Built);
    }

    /// Scenario 4 (spec §8): stopping a CREATED project is not a legal
    /// transition and must surface as a 400 naming the illegal edge.
    #[tokio::test]
    async fn illegal_transition_returns_400() {
        let store = Store::new_in_memory().await.unwrap();
        let user = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        let ctx = Context::new_mock(store.clone(), PathBuf::from("/tmp/unideploy-test"));
        let project_id = project_with_status(&ctx, user.id, "nine", ProjectStatus::Created, Tier::Seed).await;

        let router = router(ctx);
        let request = hyper::Request::builder()
            .method("POST")
            .uri(format!("/projects/{project_id}/stop"))
            .header("authorization", "Bearer tok-1")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.contains("Illegal status transition"), "body was: {body}");
    }

    #[test]
    fn recommends_seed_for_unknown() {
        let plan = BuildPlan {
            kind: ProjectKind::Unknown,
            framework: "unknown".into(),
            build_cmd: None,
            start_cmd: None,
            output_dir: None,
        };
        let (tier, _) = recommend_tier(&plan);
        assert_eq!(tier, Tier::Seed);
    }

    #[test]
    fn recommends_launch_for_python() {
        let plan = BuildPlan {
            kind: ProjectKind::Dynamic,
            framework: "python".into(),
            build_cmd: None,
            start_cmd: None,
            output_dir: None,
        };
        let (tier, _) = recommend_tier(&plan);
        assert_eq!(tier, Tier::Launch);
    }

    #[test]
    fn list_files_skips_git_and_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), "ref: refs/heads/main").unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        let files = list_files(dir.path());
        assert_eq!(files, vec!["index.html".to_string()]);
    }
}
