//! Alarm state machine and its notifier boundary.
//!
//! The controller owns `enabled`/`active` and the blink schedule. What an
//! alert looks like or sounds like is up to the injected [`Notifier`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of signals emitted at the fast cadence before throttling.
pub const FAST_SIGNAL_CYCLES: u32 = 20;

/// Signal period for the first [`FAST_SIGNAL_CYCLES`] cycles.
pub const FAST_SIGNAL_PERIOD: Duration = Duration::from_millis(500);

/// Signal period once the alarm has been active for a while.
pub const SLOW_SIGNAL_PERIOD: Duration = Duration::from_millis(2500);

/// Why the alarm was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmCause {
    /// Plant reported 0 kW.
    ZeroProduction,
    SessionRenewalFailed,
    CommunicationError,
    /// Session still invalid after the tick's read.
    SessionInvalid,
    PersistenceFailure,
    /// Raised by the operator.
    Manual,
}

impl AlarmCause {
    /// Only zero production can be silenced by the user's alarm setting.
    pub fn is_maskable(&self) -> bool {
        matches!(self, AlarmCause::ZeroProduction)
    }
}

impl fmt::Display for AlarmCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AlarmCause::ZeroProduction => "no production",
            AlarmCause::SessionRenewalFailed => "session renewal failed",
            AlarmCause::CommunicationError => "communication error",
            AlarmCause::SessionInvalid => "session invalid",
            AlarmCause::PersistenceFailure => "failed to persist reading",
            AlarmCause::Manual => "manual alarm",
        };
        f.write_str(text)
    }
}

/// Presentation boundary for alerts.
pub trait Notifier: Send + Sync {
    fn show_alert(&self, reason: &str);
    fn hide_alert(&self);
    /// One blink/beep.
    fn emit_signal(&self);
}

/// Headless notifier: alerts go to the log, signals ring the terminal bell.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_alert(&self, reason: &str) {
        warn!("ALARM: {}", reason);
    }

    fn hide_alert(&self) {
        info!("Alarm cleared");
    }

    fn emit_signal(&self) {
        let mut stdout = std::io::stdout();
        if stdout.write_all(b"\x07").and_then(|_| stdout.flush()).is_err() {
            debug!("Could not write alarm bell to stdout");
        }
    }
}

/// Alarm state as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmStatus {
    pub enabled: bool,
    pub active: bool,
    pub reason: Option<AlarmCause>,
}

/// State shared with the blink task.
struct AlarmShared {
    active: AtomicBool,
    /// Bumped on every activation and reset so a stale blink task stops.
    generation: AtomicU64,
    reason: Mutex<Option<AlarmCause>>,
}

impl AlarmShared {
    fn is_current(&self, generation: u64) -> bool {
        self.active.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_reason(&self, reason: Option<AlarmCause>) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = reason;
    }

    fn reason(&self) -> Option<AlarmCause> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Idle/Active alarm with an `enabled` gate for maskable causes.
pub struct AlarmController {
    enabled: AtomicBool,
    shared: Arc<AlarmShared>,
    notifier: Arc<dyn Notifier>,
}

impl AlarmController {
    pub fn new(enabled: bool, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            shared: Arc::new(AlarmShared {
                active: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reason: Mutex::new(None),
            }),
            notifier,
        }
    }

    /// Raise the alarm.
    ///
    /// Returns true only on an Idle to Active transition. While already active
    /// only the displayed reason changes.
    pub fn trigger(&self, cause: AlarmCause) -> bool {
        if cause.is_maskable() && !self.is_enabled() {
            debug!("Alarm disabled, ignoring '{}'", cause);
            return false;
        }

        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.shared.reason() != Some(cause) {
                self.shared.set_reason(Some(cause));
                self.notifier.show_alert(&cause.to_string());
            }
            return false;
        }

        self.shared.set_reason(Some(cause));
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Alarm activated: {}", cause);
        self.notifier.show_alert(&cause.to_string());
        self.spawn_signal_task(generation);
        true
    }

    /// Clear the alarm. Always allowed; returns true if it was active.
    pub fn reset(&self) -> bool {
        if self
            .shared
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.set_reason(None);
        info!("Alarm reset");
        self.notifier.hide_alert();
        true
    }

    /// Gate future maskable triggers. An active alarm stays active.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<AlarmCause> {
        self.shared.reason()
    }

    pub fn status(&self) -> AlarmStatus {
        AlarmStatus {
            enabled: self.is_enabled(),
            active: self.is_active(),
            reason: self.reason(),
        }
    }

    fn spawn_signal_task(&self, generation: u64) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, alarm will not blink");
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let notifier = Arc::clone(&self.notifier);
        handle.spawn(async move {
            let mut cycles: u32 = 0;
            while shared.is_current(generation) {
                notifier.emit_signal();
                cycles = cycles.saturating_add(1);
                let period = if cycles <= FAST_SIGNAL_CYCLES {
                    FAST_SIGNAL_PERIOD
                } else {
                    SLOW_SIGNAL_PERIOD
                };
                tokio::time::sleep(period).await;
            }
        });
    }
}

impl Drop for AlarmController {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
    }
}
