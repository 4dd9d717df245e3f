//! IPC Server module for presentation-layer communication.
//!
//! This module provides a Unix Domain Socket server that accepts
//! newline-delimited JSON commands and answers each with one JSON line.

use crate::alarm::{AlarmCause, AlarmController, AlarmStatus};
use crate::config::{Config, ConfigManager, Credentials};
use crate::error::IpcError;
use crate::export;
use crate::metrics::MetricsCollector;
use crate::monitor::MonitorState;
use crate::stats::StatisticsEngine;
use crate::store::{Reading, TimeSeriesStore};
use crate::telemetry::TelemetrySource;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

fn default_days() -> u32 {
    7
}

/// Commands that can be received via IPC.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "command")]
pub enum IpcCommand {
    GetStatus,
    GetStatistics {
        #[serde(default = "default_days")]
        days: u32,
    },
    GetMonthlyRollup,
    GetMetrics,
    Pause,
    Resume,
    ResetAlarm,
    /// Operator-raised alarm; ignores the alarm setting.
    TriggerAlarm,
    SetAlarmEnabled {
        enabled: bool,
    },
    SetRetention {
        days: u32,
    },
    SetInterval {
        seconds: u64,
    },
    SetCredentials {
        username: String,
        password: String,
        #[serde(default)]
        subdomain: String,
        #[serde(default)]
        captcha_model_path: String,
    },
    ExportCsv {
        #[serde(default = "default_days")]
        days: u32,
        path: PathBuf,
    },
    ExportReport {
        #[serde(default = "default_days")]
        days: u32,
        path: PathBuf,
    },
    ExportMonthly {
        path: PathBuf,
    },
    /// Copy of the backing data file.
    ExportRaw {
        path: PathBuf,
    },
}

/// Configuration portion of status response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConfigResponse {
    pub time_interval: u64,
    pub alarm_enabled: bool,
    pub data_retention_days: u32,
    pub credentials_configured: bool,
}

impl From<&Config> for ConfigResponse {
    fn from(config: &Config) -> Self {
        Self {
            time_interval: config.time_interval,
            alarm_enabled: config.alarm_enabled,
            data_retention_days: config.data_retention_days,
            credentials_configured: config.credentials.is_complete(),
        }
    }
}

/// Status response sent to clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusResponse {
    pub paused: bool,
    pub session: String,
    pub alarm: AlarmStatus,
    pub latest_reading: Option<Reading>,
    pub today_energy_kwh: Option<f64>,
    pub config: ConfigResponse,
}

/// Shared daemon state accessible by the IPC server.
pub struct DaemonState {
    pub config_manager: Arc<ConfigManager>,
    pub store: Arc<TimeSeriesStore>,
    pub stats: StatisticsEngine,
    pub alarm: Arc<AlarmController>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub metrics: Arc<MetricsCollector>,
    pub monitor: Arc<MonitorState>,
}

impl DaemonState {
    pub fn new(
        config_manager: Arc<ConfigManager>,
        store: Arc<TimeSeriesStore>,
        alarm: Arc<AlarmController>,
        telemetry: Arc<dyn TelemetrySource>,
        metrics: Arc<MetricsCollector>,
        monitor: Arc<MonitorState>,
    ) -> Self {
        let stats = StatisticsEngine::new(Arc::clone(&store));
        Self {
            config_manager,
            store,
            stats,
            alarm,
            telemetry,
            metrics,
            monitor,
        }
    }

    /// Get the current status as a StatusResponse.
    pub fn get_status(&self) -> StatusResponse {
        let config = self.config_manager.get();
        StatusResponse {
            paused: self.monitor.is_paused(),
            session: self.telemetry.session_state().as_str().to_string(),
            alarm: self.alarm.status(),
            latest_reading: self.monitor.latest_reading(),
            today_energy_kwh: self.monitor.today_energy().map(|e| e.energy_kwh),
            config: ConfigResponse::from(&config),
        }
    }
}

fn success(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "success": true, "message": message.into() })
}

fn failure(error: impl ToString) -> serde_json::Value {
    serde_json::json!({ "success": false, "error": error.to_string() })
}

fn to_response<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        serde_json::json!({
            "error": format!("Failed to serialize response: {}", e)
        })
    })
}

/// Resolve a client export path under the configured export folder.
fn export_target(state: &DaemonState, path: &Path) -> Result<PathBuf, serde_json::Value> {
    let folder = state.config_manager.get().export.folder;
    export::resolve_export_path(&folder, path).map_err(|e| {
        tracing::warn!("Rejected export request: {}", e);
        failure(e)
    })
}

/// Handle a single IPC command and return the response.
pub async fn handle_command(command: IpcCommand, state: &DaemonState) -> serde_json::Value {
    match command {
        IpcCommand::GetStatus => to_response(&state.get_status()),

        IpcCommand::GetStatistics { days } => to_response(&state.stats.compute(days)),

        IpcCommand::GetMonthlyRollup => {
            serde_json::json!({ "months": state.stats.calculate_monthly_rollup() })
        }

        IpcCommand::GetMetrics => to_response(&state.metrics.get_metrics()),

        IpcCommand::Pause => {
            state.monitor.pause();
            tracing::info!("Monitoring paused via IPC");
            success("Monitoring paused")
        }

        IpcCommand::Resume => {
            state.monitor.resume();
            tracing::info!("Monitoring resumed via IPC");
            success("Monitoring resumed")
        }

        IpcCommand::ResetAlarm => {
            let was_active = state.alarm.reset();
            serde_json::json!({ "success": true, "was_active": was_active })
        }

        IpcCommand::TriggerAlarm => {
            if state.alarm.trigger(AlarmCause::Manual) {
                state.metrics.record_alarm_activation();
            }
            success("Alarm triggered")
        }

        IpcCommand::SetAlarmEnabled { enabled } => {
            match state.config_manager.modify(|c| c.alarm_enabled = enabled) {
                Ok(_) => {
                    state.alarm.set_enabled(enabled);
                    tracing::info!("Alarm enabled set to {} via IPC", enabled);
                    success(format!("Alarm {}", if enabled { "enabled" } else { "disabled" }))
                }
                Err(e) => failure(e),
            }
        }

        IpcCommand::SetRetention { days } => {
            if let Err(e) = state.config_manager.modify(|c| c.data_retention_days = days) {
                tracing::warn!("Failed to update retention via IPC: {}", e);
                return failure(e);
            }
            match state.store.set_retention(days) {
                Ok(removed) => {
                    tracing::info!("Retention set to {} days via IPC, {} days pruned", days, removed);
                    serde_json::json!({ "success": true, "days_removed": removed })
                }
                Err(e) => failure(e),
            }
        }

        IpcCommand::SetInterval { seconds } => {
            match state.config_manager.modify(|c| c.time_interval = seconds) {
                Ok(_) => {
                    tracing::info!("Acquisition interval set to {}s via IPC", seconds);
                    success(format!("Interval set to {}s", seconds))
                }
                Err(e) => failure(e),
            }
        }

        IpcCommand::SetCredentials {
            username,
            password,
            subdomain,
            captcha_model_path,
        } => {
            let credentials = Credentials {
                username,
                password,
                subdomain,
                captcha_model_path,
            };
            if !credentials.is_complete() {
                return failure(IpcError::InvalidCommand(
                    "username and password are required".to_string(),
                ));
            }
            if let Err(e) = state
                .config_manager
                .modify(|c| c.credentials = credentials.clone())
            {
                return failure(e);
            }

            state.telemetry.set_credentials(credentials);
            let renewed = state.telemetry.renew_session().await;
            state.metrics.record_renewal(renewed);
            serde_json::json!({ "success": true, "session_renewed": renewed })
        }

        IpcCommand::ExportCsv { days, path } => {
            let path = match export_target(state, &path) {
                Ok(path) => path,
                Err(response) => return response,
            };
            match export::export_csv_file(&state.store, days, &path) {
                Ok(rows) => serde_json::json!({ "success": true, "rows": rows }),
                Err(e) => failure(e),
            }
        }

        IpcCommand::ExportReport { days, path } => {
            let path = match export_target(state, &path) {
                Ok(path) => path,
                Err(response) => return response,
            };
            match export::export_report_file(&state.stats.compute(days), &path) {
                Ok(()) => success(format!("Report written to {}", path.display())),
                Err(e) => failure(e),
            }
        }

        IpcCommand::ExportMonthly { path } => {
            let path = match export_target(state, &path) {
                Ok(path) => path,
                Err(response) => return response,
            };
            match export::export_monthly_file(&state.stats.calculate_monthly_rollup(), &path) {
                Ok(()) => success(format!("Monthly data written to {}", path.display())),
                Err(e) => failure(e),
            }
        }

        IpcCommand::ExportRaw { path } => {
            let path = match export_target(state, &path) {
                Ok(path) => path,
                Err(response) => return response,
            };
            match export::export_raw_file(&state.store, &path) {
                Ok(()) => success(format!("Energy data copied to {}", path.display())),
                Err(e) => failure(e),
            }
        }
    }
}

/// Unix Domain Socket server for IPC.
#[cfg(unix)]
pub struct IpcServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Unix listener for incoming connections
    listener: UnixListener,
}

#[cfg(unix)]
impl IpcServer {
    /// Bind a server at `path`, replacing any stale socket file. Only the
    /// daemon's own user may connect.
    pub async fn new(path: &Path) -> Result<Self, IpcError> {
        use std::os::unix::fs::PermissionsExt;

        let socket_path = path.to_path_buf();

        Self::cleanup_socket(&socket_path)?;

        let bind_err = |e| IpcError::SocketBindFailed {
            path: path.display().to_string(),
            source: e,
        };
        let listener = UnixListener::bind(&socket_path).map_err(bind_err)?;

        // Owner read/write only
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_err)?;

        Ok(Self {
            socket_path,
            listener,
        })
    }

    /// Clean up an existing socket file.
    fn cleanup_socket(path: &Path) -> Result<(), IpcError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| IpcError::SocketBindFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections forever, one task per client.
    pub async fn run(&self, state: Arc<DaemonState>) -> Result<(), IpcError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, state).await {
                            tracing::warn!("Error handling IPC connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Error accepting IPC connection: {}", e);
                }
            }
        }
    }

    /// Handle a single client connection.
    async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<(), IpcError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        while reader.read_line(&mut line).await? > 0 {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                line.clear();
                continue;
            }

            let response = match serde_json::from_str::<IpcCommand>(trimmed) {
                Ok(command) => handle_command(command, &state).await,
                Err(e) => serde_json::json!({
                    "error": IpcError::InvalidCommand(e.to_string()).to_string()
                }),
            };

            let response_str = serde_json::to_string(&response)?;
            writer.write_all(response_str.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            line.clear();
        }

        Ok(())
    }
}

#[cfg(unix)]
impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
