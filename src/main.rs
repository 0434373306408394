use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unideploy_gateway::args::{LogFormat, StartArgs};
use unideploy_gateway::autofix::NullCollaborators;
use unideploy_gateway::context::Context;
use unideploy_gateway::identity::MockVerifier;
use unideploy_gateway::sandbox::{HttpSandboxProvider, MockSandboxProvider};
use unideploy_gateway::store::Store;
use unideploy_gateway::{api, reconciler};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = StartArgs::parse();

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter_layer);
    match args.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }

    tracing::info!(?args, "starting control plane");

    let store = Store::new(&args.database_path)
        .await
        .expect("failed to open persistence store");

    let sandbox: Arc<dyn unideploy_gateway::sandbox::SandboxProvider> =
        match &args.sandbox_provider_url {
            Some(url) => Arc::new(HttpSandboxProvider::new(url.clone())),
            None => {
                tracing::warn!("SANDBOX_PROVIDER_URL unset, using in-process mock sandbox provider");
                Arc::new(MockSandboxProvider::new())
            }
        };

    let collaborators = Arc::new(NullCollaborators);
    let ctx = Context::new(
        store,
        sandbox,
        collaborators.clone(),
        collaborators.clone(),
        collaborators,
        Arc::new(MockVerifier),
        PathBuf::from("workspaces"),
    );

    reconciler::spawn(ctx.clone(), Duration::from_secs(args.reconcile_period_secs));
    reconciler::spawn_health_probe(
        ctx.clone(),
        Duration::from_secs(args.health_probe_period_secs),
    );

    let router = api::router(ctx);

    tracing::info!(addr = %args.bind_addr, "listening");
    axum::Server::bind(&args.bind_addr)
        .serve(router.into_make_service())
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

    Ok(())
}
