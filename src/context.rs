//! Top-level application context. Every collaborator handle lives here and
//! is injected into pipeline tasks, the reconciler, and HTTP handlers — no
//! hidden globals, unlike the source's mutable singletons.

use std::path::PathBuf;
use std::sync::Arc;

use crate::autofix::{AiClient, NullCollaborators, VectorIndexClient, WisdomStore};
use crate::broker::LogBroker;
use crate::config::Limits;
use crate::cost::CostLedger;
use crate::identity::{IdentityVerifier, MockVerifier};
use crate::intent::IntentLogger;
use crate::metrics::Metrics;
use crate::sandbox::{MockSandboxProvider, SandboxProvider};
use crate::store::Store;

pub struct Context {
    pub store: Store,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub broker: LogBroker,
    pub metrics: Arc<Metrics>,
    pub intent: IntentLogger,
    pub cost: Arc<CostLedger>,
    pub limits: Limits,
    pub ai: Arc<dyn AiClient>,
    pub vector_index: Arc<dyn VectorIndexClient>,
    pub wisdom: Arc<dyn WisdomStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub workspace_root: PathBuf,
}

impl Context {
    /// Builds a context given a persistence handle, a sandbox provider, and
    /// the four out-of-scope collaborators. Used by `main` to wire real
    /// (or HTTP-backed) implementations.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        sandbox: Arc<dyn SandboxProvider>,
        ai: Arc<dyn AiClient>,
        vector_index: Arc<dyn VectorIndexClient>,
        wisdom: Arc<dyn WisdomStore>,
        verifier: Arc<dyn IdentityVerifier>,
        workspace_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            intent: IntentLogger::new(store.clone()),
            store,
            sandbox,
            broker: LogBroker::new(),
            metrics: Arc::new(Metrics::new()),
            cost: Arc::new(CostLedger::new("local_storage/cost_logs.json")),
            limits: Limits::from_env(),
            ai,
            vector_index,
            wisdom,
            verifier,
            workspace_root,
        })
    }

    /// Builds a context with in-process mocks for every external
    /// collaborator — suitable for local/offline operation and tests.
    pub fn new_mock(store: Store, workspace_root: PathBuf) -> Arc<Self> {
        let collaborators = Arc::new(NullCollaborators);
        Self::new(
            store,
            Arc::new(MockSandboxProvider::new()),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
            Arc::new(MockVerifier),
            workspace_root,
        )
    }

    /// Same as [`Context::new_mock`], but with `limits` substituted for the
    /// environment-derived defaults — tests exercising a non-default
    /// [`Limits`] (read-only mode, a tight concurrency ceiling) need this
    /// since `new`/`new_mock` always read `Limits::from_env()`.
    pub fn new_mock_with_limits(store: Store, workspace_root: PathBuf, limits: Limits) -> Arc<Self> {
        let mut ctx = Self::new_mock(store, workspace_root);
        Arc::get_mut(&mut ctx)
            .expect("sole owner immediately after construction")
            .limits = limits;
        ctx
    }
}
