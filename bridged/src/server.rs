use std::sync::Arc;

use anyhow::{Context, Result};
use libsupervisor::{
    ConfigArtifacts, HostEnvironment, JsonFileStore, Materializer, RecordStore, Supervisor,
};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::api;
use crate::config::Config;
use crate::rootpath;

/// Run the daemon until ctrl-c or SIGTERM, then stop every worker.
pub async fn serve(cfg: Config) -> Result<()> {
    let state_dir = rootpath::determine(cfg.state_dir.clone())?;
    info!(
        state_dir = %state_dir.display(),
        users_file = %cfg.users_file.display(),
        "starting bridged"
    );

    let store = Arc::new(JsonFileStore::new(&cfg.users_file));
    let supervisor = Supervisor::spawn(
        store,
        Arc::new(HostEnvironment::new()),
        Materializer::new(cfg.capabilities.clone()),
        ConfigArtifacts::new(state_dir.join("configs")),
        cfg.supervisor_settings(&state_dir),
    );

    let reconciled = supervisor
        .recover()
        .await
        .context("failed to reconcile persisted worker status")?;
    if !reconciled.is_empty() {
        info!(users = ?reconciled, "reconciled workers left over from a previous run");
    }

    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.addr))?;
    info!("serving on {}", cfg.addr);
    let served = axum::serve(listener, api::router(supervisor.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor.shutdown().await;
    served.context("control api failed")
}

/// Generated worker config for one user, as pretty JSON.
pub async fn render_config(cfg: &Config, user_id: &str) -> Result<String> {
    let store = JsonFileStore::new(&cfg.users_file);
    let record = store
        .read_record(user_id)
        .await
        .with_context(|| format!("failed to load user {user_id}"))?;
    let generated = Materializer::new(cfg.capabilities.clone()).materialize(&record);
    serde_json::to_string_pretty(&generated).context("failed to encode worker config")
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for ctrl-c: {e}");
            }
        }
        _ = terminate => {}
    }
    info!("shutdown requested");
}
