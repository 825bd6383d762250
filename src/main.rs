// =============================================================================
// Xyidactyl Agent - entry point
// =============================================================================
//
// A containerized sidecar that polls the panel API on behalf of its users,
// evaluates alert and automation rules against each sample, and pushes
// notifications through the configured provider. It exposes no inbound
// port: the mobile app talks to it through the control file and reads the
// status/metrics files back out through the panel's file API.
//
// Exit codes: 0 on graceful shutdown, 1 on configuration or init failure.
// =============================================================================

mod alerts;
mod automation;
mod cleanup;
mod config;
mod control;
mod crypto;
mod logging;
mod monitor;
mod panel;
mod push;
mod status;
mod storage;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::alerts::AlertEvaluator;
use crate::automation::AutomationExecutor;
use crate::config::{AgentConfig, PushProviderKind};
use crate::control::ControlLoader;
use crate::crypto::ApiKeyCipher;
use crate::monitor::Monitor;
use crate::panel::PanelClient;
use crate::push::{ApnsProvider, DevProvider, PushProvider};
use crate::status::{StatusExporter, DEFAULT_METRICS_LIMIT};
use crate::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    // Config comes first: the log directory lives under DATA_DIR.
    let config = AgentConfig::from_env().context("configuration error")?;
    config::ensure_dir(&config.data_dir)?;
    logging::init(&config.log_dir(), &config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_uuid = %config.agent_uuid,
        panel_url = %config.panel_url,
        sampling_secs = config.sampling_interval.as_secs(),
        retention_days = config.retention_days,
        "agent starting"
    );

    // ── Init (failures here exit 1) ──────────────────────────────────────
    let cipher = ApiKeyCipher::new(&config.agent_secret).context("invalid agent secret")?;

    let storage = Arc::new(
        Storage::open(config.db_path())
            .await
            .context("failed to open database")?,
    );
    if let Err(e) = storage.log_summary().await {
        warn!(error = %e, "could not summarise storage at startup");
    }

    let panel = Arc::new(PanelClient::new(&config.panel_url)?);

    let push: Arc<dyn PushProvider> = match config.push_provider {
        PushProviderKind::Apns => {
            let apns_cfg = config
                .apns
                .as_ref()
                .context("PUSH_PROVIDER=apns but no APNs credentials")?;
            Arc::new(ApnsProvider::new(apns_cfg).context("failed to initialise APNs transport")?)
        }
        PushProviderKind::Dev => Arc::new(DevProvider),
    };
    info!(provider = push.name(), "push provider ready");

    let control = Arc::new(ControlLoader::new(&config.control_file_path));
    control.load_initial();

    // ── Wire components ──────────────────────────────────────────────────
    let alerts = Arc::new(AlertEvaluator::new(storage.clone(), push.clone()));
    let automations = Arc::new(AutomationExecutor::new(
        panel.clone(),
        storage.clone(),
        push.clone(),
    ));
    let exporter = Arc::new(StatusExporter::new(
        config.status_path(),
        config.metrics_path(),
    ));

    let monitor = Arc::new(Monitor::new(
        control.clone(),
        cipher,
        panel,
        storage.clone(),
        alerts,
        automations,
        exporter,
        config.sampling_interval,
        DEFAULT_METRICS_LIMIT,
    ));

    // Reserved knob: actions currently execute serially per cycle.
    info!(
        max_concurrent_actions = config.max_concurrent_actions,
        "automation executor ready"
    );

    // ── Spawn the long-lived loops ───────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_task = tokio::spawn(control.clone().run(shutdown_rx.clone()));
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));
    let cleanup_task = tokio::spawn(cleanup::run(
        storage,
        config.retention_days,
        shutdown_rx,
    ));

    info!("all subsystems running");

    // ── Graceful shutdown ────────────────────────────────────────────────
    wait_for_signal().await?;
    warn!("shutdown signal received, stopping gracefully");
    let _ = shutdown_tx.send(true);

    // In-flight cycles run to completion before the loops return.
    let _ = tokio::join!(control_task, monitor_task, cleanup_task);

    info!("agent shut down complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    Ok(())
}
