//! Watchdog reporting stalled pipeline stages.
//!
//! The processing loop and the publisher beat after every frame. A stage that
//! stops beating is reported loudly (log, metric, `/status`) but never
//! restarted: restarting the loop would hand the tracker a discontinuous frame
//! sequence. A loop that halted on a fatal error records the reason instead.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, info};

use crate::pipeline::telemetry;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 5_000;
/// Grace period at startup allowing the tracker to warm up.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 10_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Logical components monitored by the watchdog.
pub(crate) enum HealthComponent {
    Processor,
    Publisher,
}

impl HealthComponent {
    /// Human readable label used in log messages and metrics.
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Processor => "processing",
            HealthComponent::Publisher => "publishing",
        }
    }
}

pub(crate) struct PipelineHealth {
    processor: AtomicU64,
    publisher: AtomicU64,
    halted: Mutex<Option<String>>,
}

impl PipelineHealth {
    /// Initialise the health tracker with grace periods for each component.
    pub(crate) fn new() -> Self {
        Self::starting_at(current_millis())
    }

    fn starting_at(now: u64) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            processor: AtomicU64::new(grace_deadline),
            publisher: AtomicU64::new(grace_deadline),
            halted: Mutex::new(None),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub(crate) fn beat(&self, component: HealthComponent) {
        let now = current_millis();
        match component {
            HealthComponent::Processor => self.processor.store(now, Ordering::Relaxed),
            HealthComponent::Publisher => self.publisher.store(now, Ordering::Relaxed),
        }
    }

    /// Record that the processing loop stopped on a fatal error.
    pub(crate) fn halt(&self, reason: impl Into<String>) {
        *self.halted.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    pub(crate) fn halted(&self) -> Option<String> {
        self.halted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the first component that has not produced a heartbeat recently.
    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        if self.halted().is_some() {
            return None;
        }
        if now.saturating_sub(self.processor.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS
        {
            return Some(HealthComponent::Processor);
        }
        if now.saturating_sub(self.publisher.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS
        {
            return Some(HealthComponent::Publisher);
        }
        None
    }
}

/// Stall currently reported by the watchdog, if any.
#[derive(Default)]
pub(crate) struct WatchdogState {
    stalled: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Update the reported stall. Returns the previous value.
    pub(crate) fn set(&self, component: Option<HealthComponent>) -> Option<HealthComponent> {
        let mut guard = self.stalled.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, component)
    }

    pub(crate) fn stalled(&self) -> Option<HealthComponent> {
        *self.stalled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the watchdog thread that polls component health.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("traffic-watchdog", move || {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let stale = health.stale_component(current_millis());
            match (state.set(stale), stale) {
                (None, Some(component)) => {
                    error!(
                        "Watchdog detected stalled {} stage; counting is not advancing",
                        component.label()
                    );
                    metrics::gauge!("traffic_stage_stalled", "stage" => component.label())
                        .set(1.0);
                }
                (Some(previous), None) => {
                    info!("{} stage recovered", previous.label());
                    metrics::gauge!("traffic_stage_stalled", "stage" => previous.label())
                        .set(0.0);
                }
                _ => {}
            }
        }
    })
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
