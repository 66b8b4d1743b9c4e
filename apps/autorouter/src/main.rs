use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use autorouter_common::{FailoverStrategy, Settings, SettingsPatch};
use autorouter_core::proxy_engine::{Finalizer, ProxyEngine};
use autorouter_core::upstream_client::{UpstreamClient, WreqUpstreamClient};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();
    let dsn = args.database_dsn()?;

    let mut patch = SettingsPatch {
        host: Some(args.host),
        port: Some(args.port),
        dsn: Some(dsn),
        admin_token: Some(args.admin_token),
        encryption_key: Some(args.encryption_key),
        allow_key_reveal: Some(args.allow_key_reveal),
        ..Default::default()
    };
    if let Some(cap) = args.max_attempts {
        patch.overlay(SettingsPatch {
            failover: Some(FailoverStrategy::MaxAttempts(cap)),
            ..Default::default()
        });
    }
    let settings: Settings = patch.into_settings()?;

    let boot = autorouter_core::bootstrap(settings.clone()).await?;

    let client: Arc<dyn UpstreamClient> =
        Arc::new(WreqUpstreamClient::new(Duration::from_secs(5))?);
    let finalizer = Finalizer::new(
        boot.state.clone(),
        boot.bus.request_log_tx.clone(),
        boot.bus.snapshot_tx.clone(),
        boot.bus.breaker_tx.clone(),
    );
    let engine = Arc::new(ProxyEngine::new(boot.state.clone(), client, finalizer));

    let app = axum::Router::new()
        .nest(
            "/api/admin",
            autorouter_admin::admin_router(boot.state.clone(), boot.store.clone()),
        )
        .merge(autorouter_router::proxy_router(engine));

    let bind = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
