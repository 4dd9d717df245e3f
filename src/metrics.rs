//! Metrics collection module for the energy monitor daemon.
//!
//! Tracks acquisition outcomes, failures and alarm activity.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Metrics data exposed via IPC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsResponse {
    /// Loop ticks executed (paused ticks excluded)
    pub ticks: u64,
    /// Readings persisted to the store
    pub readings_recorded: u64,
    pub telemetry_failures: u64,
    pub persistence_failures: u64,
    pub renewals_succeeded: u64,
    pub renewals_failed: u64,
    /// Idle to active alarm transitions
    pub alarm_activations: u64,
    /// Telemetry and persistence failures in the last hour
    pub failures_last_hour: u64,
    /// Ticks that panicked and were recovered
    pub tick_panics: u64,
    /// Uptime in seconds
    pub uptime_sec: u64,
}

/// Metrics collector for the daemon
pub struct MetricsCollector {
    /// Daemon start time
    start_time: Instant,
    ticks: AtomicU64,
    readings_recorded: AtomicU64,
    telemetry_failures: AtomicU64,
    persistence_failures: AtomicU64,
    renewals_succeeded: AtomicU64,
    renewals_failed: AtomicU64,
    alarm_activations: AtomicU64,
    tick_panics: AtomicU64,
    /// Recent failures with timestamps for per-hour calculation
    recent_failures: RwLock<Vec<Instant>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ticks: AtomicU64::new(0),
            readings_recorded: AtomicU64::new(0),
            telemetry_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            renewals_succeeded: AtomicU64::new(0),
            renewals_failed: AtomicU64::new(0),
            alarm_activations: AtomicU64::new(0),
            tick_panics: AtomicU64::new(0),
            recent_failures: RwLock::new(Vec::new()),
        }
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_reading(&self) {
        self.readings_recorded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_telemetry_failure(&self) {
        self.telemetry_failures.fetch_add(1, Ordering::SeqCst);
        self.record_recent_failure();
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::SeqCst);
        self.record_recent_failure();
    }

    /// Record the outcome of a session renewal attempt
    pub fn record_renewal(&self, succeeded: bool) {
        if succeeded {
            self.renewals_succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.renewals_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_alarm_activation(&self) {
        self.alarm_activations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_tick_panic(&self) {
        self.tick_panics.fetch_add(1, Ordering::SeqCst);
    }

    fn record_recent_failure(&self) {
        let now = Instant::now();
        if let Ok(mut failures) = self.recent_failures.write() {
            failures.push(now);
            // Keep only last hour of failures
            if let Some(hour_ago) = now.checked_sub(Duration::from_secs(3600)) {
                failures.retain(|t| *t > hour_ago);
            }
        }
    }

    /// Get current metrics
    pub fn get_metrics(&self) -> MetricsResponse {
        let now = Instant::now();
        let uptime = now.duration_since(self.start_time);

        let failures_last_hour = self
            .recent_failures
            .read()
            .map(|failures| match now.checked_sub(Duration::from_secs(3600)) {
                Some(hour_ago) => failures.iter().filter(|t| **t > hour_ago).count() as u64,
                None => failures.len() as u64,
            })
            .unwrap_or(0);

        MetricsResponse {
            ticks: self.ticks.load(Ordering::SeqCst),
            readings_recorded: self.readings_recorded.load(Ordering::SeqCst),
            telemetry_failures: self.telemetry_failures.load(Ordering::SeqCst),
            persistence_failures: self.persistence_failures.load(Ordering::SeqCst),
            renewals_succeeded: self.renewals_succeeded.load(Ordering::SeqCst),
            renewals_failed: self.renewals_failed.load(Ordering::SeqCst),
            alarm_activations: self.alarm_activations.load(Ordering::SeqCst),
            failures_last_hour,
            tick_panics: self.tick_panics.load(Ordering::SeqCst),
            uptime_sec: uptime.as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
