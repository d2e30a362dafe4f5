use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use anyproxy_common::GlobalConfigPatch;
use anyproxy_core::{AppState, ProxyEngine, ReqwestUpstreamClient};
use anyproxy_storage::RouteStorage;
use anyproxy_transform::signature;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();

    let storage = RouteStorage::connect(&args.db).await?;
    storage.sync_schema().await?;

    // Merge order: CLI > persisted config > defaults; the result is written
    // back so the management surface always sees the effective values.
    let mut merged = storage.load_config().await?.unwrap_or_default();
    merged.overlay(GlobalConfigPatch {
        bind_host: args.host,
        bind_port: args.port,
        local_credential: args.credential,
        database_path: Some(args.db.clone()),
        redirect_enabled: args.redirect_enabled,
        redirect_keyword: args.redirect_keyword,
        redirect_target_model: args.redirect_target,
    });
    let config = merged.into_config()?;
    storage.save_config(&config).await?;

    let state = Arc::new(AppState::new(config.clone()));
    let _sweeper = signature::start_sweeper(state.signatures.clone(), signature::SWEEP_INTERVAL);

    let upstream: Arc<dyn anyproxy_core::UpstreamClient> =
        Arc::new(ReqwestUpstreamClient::new()?);
    let engine = Arc::new(ProxyEngine::new(state, storage, upstream));

    let app = axum::Router::new()
        .merge(anyproxy_router::proxy_router(engine.clone()))
        .nest("/admin", anyproxy_router::admin_router(engine));

    let bind = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", bind = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
