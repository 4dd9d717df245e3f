//! Energy Monitor Daemon - solar plant production monitoring.
//!
//! This daemon samples the plant's instantaneous output from a remote API,
//! keeps a retained time series on disk, derives energy statistics and raises
//! an alarm when production stops or the remote connection fails.

mod alarm;
mod config;
mod error;
mod export;
mod ipc_server;
mod logging;
mod metrics;
mod monitor;
mod remote_api;
mod stats;
mod store;
mod telemetry;

use alarm::{AlarmController, LogNotifier};
use config::ConfigManager;
use error::DaemonError;
use ipc_server::DaemonState;
use metrics::MetricsCollector;
use monitor::{MonitorState, MonitoringLoop};
use remote_api::CommandPowerApi;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::TimeSeriesStore;
use telemetry::{RemoteTelemetry, TcpConnectivityProbe, TelemetrySource};
use tokio::sync::watch;
use tracing::{error, info};

/// Graceful shutdown timeout in seconds
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Delay before restarting a failed IPC server
const IPC_RESTART_DELAY_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        e
    })?;

    info!("Energy monitor daemon starting...");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("Energy monitor daemon shut down gracefully"),
        Err(e) => error!("Energy monitor daemon error: {}", e),
    }

    result.map_err(Into::into)
}

/// Wire the components together and run until a shutdown signal.
async fn run_daemon() -> Result<(), DaemonError> {
    let config_path = ConfigManager::default_path();
    let config_manager = Arc::new(ConfigManager::load_or_default(&config_path)?);
    info!("Configuration loaded from {:?}", config_manager.path());

    let config = config_manager.get();

    // Opening the store also prunes data older than the retention window.
    let store = Arc::new(TimeSeriesStore::open(
        &config.data_file,
        config_manager.retention_days(),
    )?);
    info!(
        "Energy data loaded from {:?} ({} days on file, retention {} days)",
        store.path(),
        store.bucket_dates().len(),
        store.retention().days()
    );

    let api = CommandPowerApi::from_settings(&config.remote);
    let probe = TcpConnectivityProbe::new(
        config.remote.probe_host.clone(),
        config.remote.probe_port,
        Duration::from_secs(config.remote.connect_timeout_secs),
    );
    let telemetry: Arc<dyn TelemetrySource> = Arc::new(RemoteTelemetry::new(
        api,
        probe,
        config_manager.credentials(),
        Duration::from_secs(config.remote.request_timeout_secs),
    ));

    let alarm = Arc::new(AlarmController::new(
        config_manager.alarm_enabled(),
        Arc::new(LogNotifier),
    ));
    let metrics = Arc::new(MetricsCollector::new());
    let monitor_state = Arc::new(MonitorState::new());

    let monitor = Arc::new(MonitoringLoop::new(
        Arc::clone(&telemetry),
        Arc::clone(&store),
        Arc::clone(&alarm),
        Arc::clone(&metrics),
        Arc::clone(&monitor_state),
    ));

    let daemon_state = Arc::new(DaemonState::new(
        Arc::clone(&config_manager),
        Arc::clone(&store),
        alarm,
        telemetry,
        metrics,
        monitor_state,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(signal_tx).await {
            error!("Signal handler error: {}", e);
        }
    });

    let ipc_state = Arc::clone(&daemon_state);
    let ipc_shutdown_rx = shutdown_rx.clone();
    let socket_path = config.control_socket.clone();
    let ipc_handle = tokio::spawn(async move {
        run_ipc_server_with_restart(ipc_state, socket_path, ipc_shutdown_rx).await
    });

    let monitor_config = Arc::clone(&config_manager);
    let monitor_handle = tokio::spawn(monitor.run(monitor_config, shutdown_rx.clone()));

    let export_handle = tokio::spawn(export::run_auto_export(
        Arc::clone(&store),
        Arc::clone(&config_manager),
        shutdown_rx.clone(),
    ));

    info!("Energy monitor daemon initialized and running");

    let mut shutdown_rx_main = shutdown_rx.clone();
    shutdown_rx_main.changed().await.ok();

    info!("Shutdown signal received, stopping tasks...");

    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(ipc_handle, monitor_handle, export_handle);
    })
    .await;

    info!("All tasks stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown on SIGTERM and SIGINT.
#[cfg(unix)]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

#[cfg(not(unix))]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Run the IPC server, restarting it after errors.
async fn run_ipc_server_with_restart(
    state: Arc<DaemonState>,
    socket_path: PathBuf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("IPC server shutting down");
                    break;
                }
            }
            result = run_ipc_server_inner(Arc::clone(&state), &socket_path) => {
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!(
                            "IPC server error: {}, restarting in {} seconds",
                            e, IPC_RESTART_DELAY_SECS
                        );
                        tokio::time::sleep(Duration::from_secs(IPC_RESTART_DELAY_SECS)).await;
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn run_ipc_server_inner(
    state: Arc<DaemonState>,
    socket_path: &std::path::Path,
) -> Result<(), error::IpcError> {
    let server = ipc_server::IpcServer::new(socket_path).await?;
    info!("IPC server listening on {:?}", server.socket_path());
    server.run(state).await
}

#[cfg(not(unix))]
async fn run_ipc_server_inner(
    _state: Arc<DaemonState>,
    _socket_path: &std::path::Path,
) -> Result<(), error::IpcError> {
    tracing::warn!("IPC server not available on this platform");
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
