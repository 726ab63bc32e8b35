use std::sync::Arc;

use anyhow::Context;

use creditflow_infra::config::SyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    creditflow_observability::init();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(creditflow_api::app::services::build_services(&config).await?);

    let warm = services.pool.warm_start(&config.warm_tenants).await;
    services.pool.start_cleanup();

    let app = creditflow_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!(addr = %listener.local_addr()?, warm_started = warm.started.len(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.pool.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received, draining consumers");
}
