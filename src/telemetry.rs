//! Telemetry acquisition with session management.
//!
//! The remote API is an injected capability. [`RemoteTelemetry`] wraps it with a
//! connectivity probe, a session state machine
//! (`Uninitialized -> Valid <-> Invalid`) and a hard timeout on every remote
//! call, and reports every failure as a [`TelemetryError`].

use crate::config::Credentials;
use crate::error::TelemetryError;
use crate::store::Reading;
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Instantaneous plant output as reported by the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub power_kw: f64,
}

/// The vendor API, seen as an opaque capability.
#[async_trait]
pub trait RemotePowerApi: Send + Sync {
    async fn get_current_power(&self) -> Result<PowerStatus, TelemetryError>;

    /// Lightweight call that only checks the session is accepted.
    async fn probe(&self) -> Result<(), TelemetryError>;

    async fn reauthenticate(&self, credentials: &Credentials) -> Result<(), TelemetryError>;
}

/// Cheap network reachability check, run before touching the remote API.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Reachability by opening a TCP connection to a well-known host.
pub struct TcpConnectivityProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpConnectivityProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpConnectivityProbe {
    async fn is_reachable(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Connectivity probe to {}:{} failed: {}", self.host, self.port, e);
                false
            }
            Err(_) => {
                debug!("Connectivity probe to {}:{} timed out", self.host, self.port);
                false
            }
        }
    }
}

/// Session lifecycle with the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session has been opened yet, or credentials are missing.
    Uninitialized,
    Valid,
    Invalid,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Valid => "valid",
            SessionState::Invalid => "invalid",
        }
    }
}

/// What the monitoring loop needs from the acquisition layer.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Read the current output. An invalid session gets exactly one renewal
    /// attempt before the read is abandoned for this tick.
    async fn current_reading(&self) -> Result<Reading, TelemetryError>;

    /// Connectivity first, then a remote probe. Never fails, only answers.
    async fn is_session_valid(&self) -> bool;

    /// Re-establish the session. Safe to call repeatedly.
    async fn renew_session(&self) -> bool;

    fn session_state(&self) -> SessionState;

    /// Whether a renewal could even be attempted.
    fn has_credentials(&self) -> bool;

    /// Replace the login credentials. Takes effect at the next renewal.
    fn set_credentials(&self, credentials: Credentials);
}

/// [`TelemetrySource`] over an injected [`RemotePowerApi`].
pub struct RemoteTelemetry<A, P> {
    api: A,
    probe: P,
    credentials: Mutex<Credentials>,
    state: Mutex<SessionState>,
    request_timeout: Duration,
}

impl<A, P> RemoteTelemetry<A, P>
where
    A: RemotePowerApi,
    P: ConnectivityProbe,
{
    pub fn new(api: A, probe: P, credentials: Credentials, request_timeout: Duration) -> Self {
        if !credentials.is_complete() {
            error!("No credentials configured for the remote power API; acquisition stays uninitialized until they are supplied");
        }
        Self {
            api,
            probe,
            credentials: Mutex::new(credentials),
            state: Mutex::new(SessionState::Uninitialized),
            request_timeout,
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!("Session state {} -> {}", state.as_str(), next.as_str());
            *state = next;
        }
    }

    /// Valid sessions become Invalid; Uninitialized stays put.
    fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Valid {
            debug!("Session state valid -> invalid");
            *state = SessionState::Invalid;
        }
    }

    /// One login attempt, reporting why it failed.
    async fn renew(&self) -> Result<(), TelemetryError> {
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !credentials.is_complete() {
            debug!("Skipping renewal: no credentials configured");
            return Err(TelemetryError::AuthExpired);
        }

        info!("Renewing remote session for {}", credentials.username);
        match self
            .bounded("session renewal", self.api.reauthenticate(&credentials))
            .await
        {
            Ok(()) => {
                self.set_state(SessionState::Valid);
                info!("Remote session renewed");
                Ok(())
            }
            Err(e) => {
                warn!("Session renewal failed: {}", e);
                self.invalidate();
                Err(e)
            }
        }
    }

    /// Run a remote call under the request timeout.
    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T, TelemetryError>
    where
        F: Future<Output = Result<T, TelemetryError>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::RemoteFault(format!(
                "{} timed out after {}s",
                what,
                self.request_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl<A, P> TelemetrySource for RemoteTelemetry<A, P>
where
    A: RemotePowerApi,
    P: ConnectivityProbe,
{
    async fn current_reading(&self) -> Result<Reading, TelemetryError> {
        if self.session_state() != SessionState::Valid {
            self.renew().await?;
        }

        match self.bounded("power read", self.api.get_current_power()).await {
            Ok(status) if status.power_kw.is_finite() => {
                // Inverters may report a small negative draw at night.
                let power_kw = status.power_kw.max(0.0);
                Ok(Reading::new(Local::now().naive_local(), power_kw))
            }
            Ok(status) => Err(TelemetryError::RemoteFault(format!(
                "remote reported a non-finite power value ({})",
                status.power_kw
            ))),
            Err(TelemetryError::AuthExpired) => {
                self.invalidate();
                Err(TelemetryError::AuthExpired)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_session_valid(&self) -> bool {
        if !self.probe.is_reachable().await {
            warn!("{}", TelemetryError::NoConnectivity);
            self.invalidate();
            return false;
        }

        if self.session_state() != SessionState::Valid {
            return false;
        }

        match self.bounded("session probe", self.api.probe()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Session probe failed: {}", e);
                self.invalidate();
                false
            }
        }
    }

    async fn renew_session(&self) -> bool {
        self.renew().await.is_ok()
    }

    fn session_state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_credentials(&self) -> bool {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_complete()
    }

    fn set_credentials(&self, credentials: Credentials) {
        info!("Remote API credentials updated for {}", credentials.username);
        *self.credentials.lock().unwrap_or_else(PoisonError::into_inner) = credentials;
    }
}
