use std::sync::Arc;

use clap::Parser;
use simplebank::{
    api::{self, AppState},
    config::{CliArgs, Config},
    store::Store,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);

    telemetry::init_logging(&config.logging)?;

    let metrics = match telemetry::install_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    let storage_config = config.storage.clone();
    let backend = tokio::task::spawn_blocking(move || storage_config.open()).await??;
    tracing::info!(backend = ?config.storage.backend, "Storage ready");

    let store = Store::new(backend).with_policy(config.ledger.policy());
    let state = Arc::new(AppState {
        store,
        request_timeout: config.ledger.request_timeout(),
        metrics,
    });
    let app = api::router(state, Arc::new(config.auth.clone()));

    let addr = config.listen_addr()?;
    tracing::info!(%addr, "API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
