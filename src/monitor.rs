//! Monitoring loop: one tick per configured interval.
//!
//! A tick validates the session, reads the current output, persists it and
//! decides the alarm state. Every failure ends in a log line plus an alarm
//! trigger; nothing a tick does can stop the loop.

use crate::alarm::{AlarmCause, AlarmController};
use crate::config::ConfigManager;
use crate::error::{StoreError, TelemetryError};
use crate::metrics::MetricsCollector;
use crate::stats::{DayEnergy, StatisticsEngine};
use crate::store::{self, Reading, TimeSeriesStore};
use crate::telemetry::TelemetrySource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often the cached energy figure for today is recomputed.
pub const TODAY_ENERGY_REFRESH: Duration = Duration::from_secs(3600);

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Paused,
    /// No credentials yet; nothing was attempted.
    Unconfigured,
    Recorded(Reading),
    /// Reading obtained but not persisted.
    PersistFailed(Reading),
    RenewalFailed,
    ReadFailed(TelemetryError),
}

/// Live values the loop publishes for clients.
#[derive(Debug, Default)]
pub struct MonitorState {
    paused: AtomicBool,
    latest: RwLock<Option<Reading>>,
    today_energy: RwLock<Option<DayEnergy>>,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes effect at the next tick boundary.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn today_energy(&self) -> Option<DayEnergy> {
        *self.today_energy.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_latest(&self, reading: Reading) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(reading);
    }

    fn set_today_energy(&self, energy: DayEnergy) {
        *self.today_energy.write().unwrap_or_else(PoisonError::into_inner) = Some(energy);
    }
}

/// Drives telemetry, store and alarm.
pub struct MonitoringLoop {
    telemetry: Arc<dyn TelemetrySource>,
    store: Arc<TimeSeriesStore>,
    alarm: Arc<AlarmController>,
    stats: StatisticsEngine,
    metrics: Arc<MetricsCollector>,
    state: Arc<MonitorState>,
}

impl MonitoringLoop {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        store: Arc<TimeSeriesStore>,
        alarm: Arc<AlarmController>,
        metrics: Arc<MetricsCollector>,
        state: Arc<MonitorState>,
    ) -> Self {
        let stats = StatisticsEngine::new(Arc::clone(&store));
        Self {
            telemetry,
            store,
            alarm,
            stats,
            metrics,
            state,
        }
    }

    /// Run one acquisition tick.
    pub async fn tick(&self) -> TickOutcome {
        if self.state.is_paused() {
            debug!("Monitoring paused, skipping tick");
            return TickOutcome::Paused;
        }
        self.metrics.record_tick();

        // Missing credentials were reported at startup; wait for SetCredentials
        if !self.telemetry.has_credentials() {
            debug!("No remote credentials configured, skipping acquisition");
            return TickOutcome::Unconfigured;
        }

        if !self.telemetry.is_session_valid().await {
            let renewed = self.telemetry.renew_session().await;
            self.metrics.record_renewal(renewed);
            if !renewed {
                warn!("Session renewal failed");
                self.raise(AlarmCause::SessionRenewalFailed);
                self.revalidate_session().await;
                return TickOutcome::RenewalFailed;
            }
        }

        // Read; a failure ends the tick
        let reading = match self.telemetry.current_reading().await {
            Ok(reading) => reading,
            Err(e) => {
                error!("Error reading current power: {}", e);
                self.metrics.record_telemetry_failure();
                self.raise(AlarmCause::CommunicationError);
                self.revalidate_session().await;
                return TickOutcome::ReadFailed(e);
            }
        };

        self.state.set_latest(reading);
        let status = if reading.power_kw > 0.0 {
            "producing"
        } else {
            "no production"
        };
        info!("Current power: {:.2} kW ({})", reading.power_kw, status);

        let persisted = match self.persist(reading).await {
            Ok(_) => {
                self.metrics.record_reading();
                true
            }
            Err(e) => {
                error!("Failed to persist reading: {}", e);
                self.metrics.record_persistence_failure();
                self.raise(AlarmCause::PersistenceFailure);
                false
            }
        };

        // Alarm decision: invalid session first, then zero output, then recovery
        if !self.telemetry.is_session_valid().await {
            warn!("Session invalid after read");
            self.raise(AlarmCause::SessionInvalid);
        } else if self.alarm.is_enabled() && reading.power_kw == 0.0 {
            self.raise(AlarmCause::ZeroProduction);
        } else if persisted && self.alarm.is_active() {
            self.alarm.reset();
        }

        if persisted {
            TickOutcome::Recorded(reading)
        } else {
            TickOutcome::PersistFailed(reading)
        }
    }

    /// Flush a reading on the blocking pool.
    async fn persist(&self, reading: Reading) -> Result<Reading, StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.record(reading.timestamp, reading.power_kw))
            .await
            .unwrap_or_else(|e| {
                Err(StoreError::Persistence {
                    path: self.store.path().display().to_string(),
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })
            })
    }

    /// Drop buckets past the retention horizon. Returns the number removed.
    pub async fn run_maintenance(&self, retention_days: u32) -> usize {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.prune(retention_days)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(e)) => {
                error!("Retention maintenance failed: {}", e);
                0
            }
            Err(e) => {
                error!("Retention maintenance did not complete: {}", e);
                0
            }
        }
    }

    /// A still-invalid session always raises the alarm.
    async fn revalidate_session(&self) {
        if !self.telemetry.is_session_valid().await {
            self.raise(AlarmCause::SessionInvalid);
        }
    }

    fn raise(&self, cause: AlarmCause) {
        if self.alarm.trigger(cause) {
            self.metrics.record_alarm_activation();
        }
    }

    /// Recompute today's integrated energy.
    pub fn refresh_today_energy(&self) -> DayEnergy {
        let date = store::today();
        let energy = DayEnergy {
            date,
            energy_kwh: self.stats.calculate_daily_energy(date),
        };
        debug!("Energy produced today: {:.2} kWh", energy.energy_kwh);
        self.state.set_today_energy(energy);
        energy
    }

    /// Run a tick on its own task so a panic is contained.
    pub async fn run_tick_guarded(self: &Arc<Self>) -> Option<TickOutcome> {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.tick().await }).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_panic() => {
                error!("Panic during monitoring tick, continuing operation");
                self.metrics.record_tick_panic();
                None
            }
            Err(e) => {
                warn!("Monitoring tick did not complete: {}", e);
                None
            }
        }
    }

    /// Tick until shutdown. The interval and retention are re-read from config;
    /// retention maintenance runs on start and whenever the date changes.
    pub async fn run(
        self: Arc<Self>,
        config: Arc<ConfigManager>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.run_maintenance(config.retention_days()).await;
        self.refresh_today_energy();
        let mut last_refresh = Instant::now();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Some(outcome) = self.run_tick_guarded().await {
                debug!("Tick finished: {:?}", outcome);
            }

            let stale_day = self
                .state
                .today_energy()
                .map_or(true, |energy| energy.date != store::today());
            if stale_day {
                self.run_maintenance(config.retention_days()).await;
            }
            if stale_day || last_refresh.elapsed() >= TODAY_ENERGY_REFRESH {
                self.refresh_today_energy();
                last_refresh = Instant::now();
            }

            // Interval changes apply from the next sleep
            let period = Duration::from_secs(config.time_interval().max(1));
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(period) => {}
            }
        }

        info!("Monitoring loop shutting down");
    }
}
