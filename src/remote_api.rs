//! Remote power API adapter backed by an external helper command.
//!
//! The vendor client runs as a separate program. Each call spawns
//! `<command> <args..> <action>` where action is `power`, `probe` or `login`.
//! Credentials travel through environment variables, never the argument list.
//!
//! Helper contract:
//!
//! - `login` receives the credentials and must leave a session the helper can
//!   find again on its own (a cookie jar or token cache it owns). The daemon
//!   keeps no session material between processes.
//! - `power` and `probe` run in fresh processes without credentials and reuse
//!   that cached session. When it is missing or rejected they exit with 2.
//! - `power` prints `{"power_kw": <f64>}` on stdout.
//!
//! | exit code | meaning                       |
//! |-----------|-------------------------------|
//! | 0         | success                       |
//! | 2         | session expired or rejected   |
//! | 3         | vendor unreachable            |
//! | other     | remote fault, stderr attached |

use crate::config::{Credentials, RemoteSettings};
use crate::error::TelemetryError;
use crate::telemetry::{PowerStatus, RemotePowerApi};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Exit code the helper uses for a rejected or expired session.
pub const EXIT_AUTH_EXPIRED: i32 = 2;

/// Exit code the helper uses when it could not reach the vendor.
pub const EXIT_NO_CONNECTIVITY: i32 = 3;

pub const ENV_USERNAME: &str = "ENERGY_MONITOR_USERNAME";
pub const ENV_PASSWORD: &str = "ENERGY_MONITOR_PASSWORD";
pub const ENV_SUBDOMAIN: &str = "ENERGY_MONITOR_SUBDOMAIN";
pub const ENV_CAPTCHA_MODEL: &str = "ENERGY_MONITOR_CAPTCHA_MODEL";

/// [`RemotePowerApi`] that shells out to a helper program.
pub struct CommandPowerApi {
    program: String,
    args: Vec<String>,
}

impl CommandPowerApi {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &RemoteSettings) -> Self {
        Self::new(settings.command.clone(), settings.args.clone())
    }

    /// Run one helper action and return its stdout.
    async fn execute(
        &self,
        action: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, TelemetryError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(action)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(credentials) = credentials {
            command
                .env(ENV_USERNAME, &credentials.username)
                .env(ENV_PASSWORD, &credentials.password)
                .env(ENV_SUBDOMAIN, &credentials.subdomain)
                .env(ENV_CAPTCHA_MODEL, &credentials.captcha_model_path);
        }

        debug!("Running remote helper '{}' action '{}'", self.program, action);
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TelemetryError::RemoteFault(format!("helper '{}' not found", self.program))
            } else {
                TelemetryError::RemoteFault(format!("failed to run '{}': {}", self.program, e))
            }
        })?;

        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(EXIT_AUTH_EXPIRED) => Err(TelemetryError::AuthExpired),
            Some(EXIT_NO_CONNECTIVITY) => Err(TelemetryError::NoConnectivity),
            code => Err(TelemetryError::RemoteFault(format!(
                "'{} {}' exited with {:?}: {}",
                self.program,
                action,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Parse the helper's `power` output: a single JSON object `{"power_kw": <f64>}`.
pub fn parse_power_output(stdout: &[u8]) -> Result<PowerStatus, TelemetryError> {
    serde_json::from_slice(stdout)
        .map_err(|e| TelemetryError::RemoteFault(format!("malformed power response: {}", e)))
}

#[async_trait]
impl RemotePowerApi for CommandPowerApi {
    async fn get_current_power(&self) -> Result<PowerStatus, TelemetryError> {
        let stdout = self.execute("power", None).await?;
        parse_power_output(&stdout)
    }

    async fn probe(&self) -> Result<(), TelemetryError> {
        self.execute("probe", None).await.map(|_| ())
    }

    async fn reauthenticate(&self, credentials: &Credentials) -> Result<(), TelemetryError> {
        self.execute("login", Some(credentials)).await.map(|_| ())
    }
}
