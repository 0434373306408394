//! C3 — Sandbox Provider Interface.
//!
//! The pipeline and reconciler depend only on this trait; concrete
//! implementations (a real provisioner, a mock) are swappable by
//! configuration, collapsing the duck-typed "sandbox" and "k8s" managers
//! of the original implementation into one polymorphic interface.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::Tier;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SandboxStatus {
    Running,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub status: SandboxStatus,
    pub url: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VerifyOutcome {
    pub status: SandboxStatus,
    pub output: String,
    pub error: Option<String>,
}

/// Callback invoked once per streamed output line from the sandbox.
pub type LineSink = Box<dyn Fn(&str) + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox operation failed: {0}")]
    Failed(String),
    #[error("sandbox operation timed out")]
    Timeout,
}

/// Resource request for a new sandbox. The caller assumes `create` may
/// block for minutes while cloning and building occur remotely.
pub struct CreateRequest<'a> {
    pub repo_url: &'a str,
    pub build_cmd: Option<&'a str>,
    pub start_cmd: Option<&'a str>,
    pub env_vars: &'a std::collections::HashMap<String, String>,
    pub tier: Tier,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(
        &self,
        req: CreateRequest<'_>,
        on_stdout: &LineSink,
        on_stderr: &LineSink,
    ) -> Result<SandboxHandle, SandboxError>;

    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    /// Reattach to an existing sandbox.
    async fn connect(&self, id: &str) -> Result<SandboxHandle, SandboxError>;

    async fn verify(
        &self,
        workspace: &str,
        focus_file: &str,
        patch: &str,
        error: &str,
    ) -> Result<VerifyOutcome, SandboxError>;

    /// Used by the reconciler to detect drift against recorded state.
    async fn list_active(&self) -> Result<HashSet<String>, SandboxError>;
}

/// Tier-ordered resource ceilings. Every concrete provider should honor
/// SEED <= LAUNCH <= SCALE across cpu, memory, and timeout.
pub fn timeout_for_tier(tier: Tier) -> std::time::Duration {
    match tier {
        Tier::Seed => std::time::Duration::from_secs(120),
        Tier::Launch => std::time::Duration::from_secs(300),
        Tier::Scale => std::time::Duration::from_secs(600),
    }
}

/// Deterministic in-process provider used for local/offline operation and
/// tests. Every sandbox it creates is immediately "running".
pub struct MockSandboxProvider {
    active: Arc<Mutex<HashSet<String>>>,
}

impl MockSandboxProvider {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl Default for MockSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(
        &self,
        req: CreateRequest<'_>,
        on_stdout: &LineSink,
        _on_stderr: &LineSink,
    ) -> Result<SandboxHandle, SandboxError> {
        on_stdout(&format!("[system] spawning sandbox for {}", req.repo_url));
        if let Some(cmd) = req.build_cmd {
            on_stdout(&format!("[build] running: {cmd}"));
        }
        if let Some(cmd) = req.start_cmd {
            on_stdout(&format!("[start] running: {cmd}"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.active.lock().await.insert(id.clone());
        Ok(SandboxHandle {
            url: format!("https://8080-{id}.sandbox.local"),
            status: SandboxStatus::Running,
            id,
        })
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.active.lock().await.remove(id);
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<SandboxHandle, SandboxError> {
        if self.active.lock().await.contains(id) {
            Ok(SandboxHandle {
                id: id.to_string(),
                status: SandboxStatus::Running,
                url: format!("https://8080-{id}.sandbox.local"),
            })
        } else {
            Err(SandboxError::Failed("no such sandbox".into()))
        }
    }

    async fn verify(
        &self,
        _workspace: &str,
        _focus_file: &str,
        patch: &str,
        _error: &str,
    ) -> Result<VerifyOutcome, SandboxError> {
        if patch.trim().is_empty() {
            return Ok(VerifyOutcome {
                status: SandboxStatus::Failed,
                output: String::new(),
                error: Some("empty patch".into()),
            });
        }
        Ok(VerifyOutcome {
            status: SandboxStatus::Running,
            output: "syntax check passed".into(),
            error: None,
        })
    }

    async fn list_active(&self) -> Result<HashSet<String>, SandboxError> {
        Ok(self.active.lock().await.clone())
    }
}

/// Speaks to an out-of-process sandbox daemon over HTTP. Request/response
/// shapes follow the original implementation's provisioner contract
/// (`{id, status, url}`).
pub struct HttpSandboxProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(serde::Serialize)]
struct CreateWire<'a> {
    repo_url: &'a str,
    build_cmd: Option<&'a str>,
    start_cmd: Option<&'a str>,
    env_vars: &'a std::collections::HashMap<String, String>,
    tier: Tier,
}

#[derive(serde::Deserialize)]
struct CreateWireResponse {
    id: String,
    status: String,
    url: String,
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(
        &self,
        req: CreateRequest<'_>,
        on_stdout: &LineSink,
        _on_stderr: &LineSink,
    ) -> Result<SandboxHandle, SandboxError> {
        on_stdout(&format!("[system] spawning sandbox for {}", req.repo_url));
        let body = CreateWire {
            repo_url: req.repo_url,
            build_cmd: req.build_cmd,
            start_cmd: req.start_cmd,
            env_vars: req.env_vars,
            tier: req.tier,
        };
        let timeout = timeout_for_tier(req.tier);
        let resp = tokio::time::timeout(
            timeout,
            self.client
                .post(format!("{}/sandboxes", self.base_url))
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| SandboxError::Timeout)?
        .map_err(|e| SandboxError::Failed(e.to_string()))?;

        let wire: CreateWireResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;

        let status = if wire.status == "running" {
            SandboxStatus::Running
        } else {
            SandboxStatus::Failed
        };
        Ok(SandboxHandle {
            id: wire.id,
            status,
            url: wire.url,
        })
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.client
            .delete(format!("{}/sandboxes/{}", self.base_url, id))
            .send()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<SandboxHandle, SandboxError> {
        let resp = self
            .client
            .get(format!("{}/sandboxes/{}", self.base_url, id))
            .send()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        let wire: CreateWireResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        let status = if wire.status == "running" {
            SandboxStatus::Running
        } else {
            SandboxStatus::Failed
        };
        Ok(SandboxHandle {
            id: wire.id,
            status,
            url: wire.url,
        })
    }

    async fn verify(
        &self,
        workspace: &str,
        focus_file: &str,
        patch: &str,
        error: &str,
    ) -> Result<VerifyOutcome, SandboxError> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            workspace: &'a str,
            focus_file: &'a str,
            patch: &'a str,
            error: &'a str,
        }
        let resp = self
            .client
            .post(format!("{}/verify", self.base_url))
            .json(&Req {
                workspace,
                focus_file,
                patch,
                error,
            })
            .send()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))
    }

    async fn list_active(&self) -> Result<HashSet<String>, SandboxError> {
        let resp = self
            .client
            .get(format!("{}/sandboxes", self.base_url))
            .send()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_sink() -> LineSink {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn mock_create_then_list_then_kill() {
        let provider = MockSandboxProvider::new();
        let env = std::collections::HashMap::new();
        let handle = provider
            .create(
                CreateRequest {
                    repo_url: "https://example.com/repo.git",
                    build_cmd: Some("npm run build"),
                    start_cmd: Some("npm start"),
                    env_vars: &env,
                    tier: Tier::Seed,
                },
                &noop_sink(),
                &noop_sink(),
            )
            .await
            .unwrap();
        assert_eq!(handle.status, SandboxStatus::Running);
        assert!(provider.list_active().await.unwrap().contains(&handle.id));
        provider.kill(&handle.id).await.unwrap();
        assert!(!provider.list_active().await.unwrap().contains(&handle.id));
    }

    #[tokio::test]
    async fn verify_rejects_empty_patch() {
        let provider = MockSandboxProvider::new();
        let outcome = provider.verify("/ws", "app.py", "", "err").await.unwrap();
        assert_eq!(outcome.status, SandboxStatus::Failed);
    }
}
