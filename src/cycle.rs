//! Periodic re-triggering of the ranging engine.
//!
//! The next trigger must never fire while the previous echo window is still
//! open. The sensor needs up to 60 ms round trip, so the period floor is the
//! larger of the historical 50 ms clamp and that echo window. A cycle that
//! overruns its period simply delays the next one.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::edge::EdgeSource;
use crate::error::{RangingError, Result};
use crate::line::TriggerLine;
use crate::ranging::Ranger;
use crate::timer::{self, TimerHandle};

/// Worst-case trigger-to-echo-end time the sensor documents.
pub const ECHO_WINDOW: Duration = Duration::from_millis(60);
/// Minimum period historically enforced by the attribute setter.
pub const LEGACY_MIN_PERIOD: Duration = Duration::from_millis(50);
pub const DEFAULT_FLOOR: Duration = longer(LEGACY_MIN_PERIOD, ECHO_WINDOW);
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);
pub const MAX_PERIOD: Duration = Duration::from_millis(u32::MAX as u64);

const fn longer(a: Duration, b: Duration) -> Duration {
    if a.as_nanos() > b.as_nanos() { a } else { b }
}

/// Measurement period shared between the control path and the scheduler.
///
/// A period of zero means one-shot: `start` measures once and stays idle.
#[derive(Debug)]
pub struct CycleConfig {
    period_ns: AtomicU64,
    floor: Duration,
}

impl CycleConfig {
    pub fn new(period: Duration, floor: Duration) -> Result<Self> {
        if floor < ECHO_WINDOW {
            return Err(RangingError::invalid(format!(
                "period floor {floor:?} is shorter than the echo window {ECHO_WINDOW:?}"
            )));
        }
        if floor > MAX_PERIOD {
            return Err(RangingError::invalid(format!(
                "period floor {floor:?} exceeds {MAX_PERIOD:?}"
            )));
        }
        let config = CycleConfig {
            period_ns: AtomicU64::new(0),
            floor,
        };
        config.set_period(period)?;
        Ok(config)
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.load(Ordering::Acquire))
    }

    /// Validate and store a new period, returning the one that took effect.
    /// Non-zero periods under the floor are raised to it.
    pub fn set_period(&self, requested: Duration) -> Result<Duration> {
        if requested > MAX_PERIOD {
            return Err(RangingError::invalid(format!(
                "cycle period {requested:?} exceeds {MAX_PERIOD:?}"
            )));
        }
        let effective = if requested.is_zero() {
            Duration::ZERO
        } else {
            requested.max(self.floor)
        };
        if effective != requested {
            info!(
                requested_ms = requested.as_millis() as u64,
                floor_ms = self.floor.as_millis() as u64,
                "cycle period clamped to floor"
            );
        }
        // MAX_PERIOD fits comfortably in u64 nanoseconds
        self.period_ns
            .store(effective.as_nanos() as u64, Ordering::Release);
        Ok(effective)
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            period_ns: AtomicU64::new(DEFAULT_PERIOD.as_nanos() as u64),
            floor: DEFAULT_FLOOR,
        }
    }
}

/// Background measurement loop. Dropping or disarming it cancels pending
/// cycles and waits for an in-flight one to finish.
pub struct CycleScheduler {
    timer: TimerHandle,
    cycles: Arc<AtomicU64>,
}

impl CycleScheduler {
    /// Start measuring now and keep re-arming at the configured period.
    pub fn arm<T, S, C>(ranger: Arc<Ranger<T, S, C>>, config: Arc<CycleConfig>) -> Result<Self>
    where
        T: TriggerLine + 'static,
        S: EdgeSource + 'static,
        C: Clock + 'static,
    {
        let cycles = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&cycles);
        let timer = timer::every(
            "hcsr04-cycle",
            move || config.period(),
            move || {
                run_cycle(&ranger);
                counter.fetch_add(1, Ordering::Relaxed);
                ControlFlow::Continue(())
            },
        )?;
        debug!("cycle scheduler armed");
        Ok(CycleScheduler { timer, cycles })
    }

    pub fn disarm(self) {
        self.timer.cancel();
        debug!("cycle scheduler disarmed");
    }

    /// Cycles run so far, whatever their outcome.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

fn run_cycle<T, S, C>(ranger: &Ranger<T, S, C>)
where
    T: TriggerLine,
    S: EdgeSource,
    C: Clock,
{
    match ranger.trigger_and_measure() {
        Ok(measurement) => debug!(distance_mm = measurement.distance_mm(), "periodic reading"),
        Err(RangingError::Busy) => {
            error!("measurement already in flight when the periodic trigger fired; cycle skipped")
        }
        Err(err) => warn!(error = %err, "periodic cycle failed"),
    }
}
