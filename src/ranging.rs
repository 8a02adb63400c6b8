//! Trigger emission, pulse-width capture and distance conversion.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::clock::{Clock, Instant};
use crate::edge::{EdgeSource, EdgeWait};
use crate::error::{RangingError, Result};
use crate::line::{Edge, Level, TriggerLine};

/// Datasheet figure for the echo width per millimetre of range.
pub const DATASHEET_NS_PER_MM: u32 = 5400;

/// Longest echo the sensor produces, even with nothing in range.
pub const MAX_ECHO_WIDTH: Duration = Duration::from_millis(38);

/// Shortest trigger pulse the sensor reacts to.
pub const MIN_TRIGGER_PULSE: Duration = Duration::from_micros(10);

pub const DEFAULT_TRIGGER_PULSE: Duration = Duration::from_millis(1);
pub const DEFAULT_RISING_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_FALLING_TIMEOUT: Duration = Duration::from_millis(500);

/// Converts echo width to distance: `mm = floor(width_ns / ns_per_mm)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    ns_per_mm: u32,
}

impl Calibration {
    pub const DATASHEET: Calibration = Calibration {
        ns_per_mm: DATASHEET_NS_PER_MM,
    };

    pub fn new(ns_per_mm: u32) -> Result<Self> {
        if ns_per_mm == 0 {
            return Err(RangingError::invalid("ns_per_mm must be non-zero"));
        }
        Ok(Calibration { ns_per_mm })
    }

    pub fn ns_per_mm(&self) -> u32 {
        self.ns_per_mm
    }

    /// Truncates; sub-millimetre precision is below the sensor's noise floor.
    pub fn distance_mm(&self, pulse_width: Duration) -> u32 {
        let mm = pulse_width.as_nanos() / u128::from(self.ns_per_mm);
        u32::try_from(mm).unwrap_or(u32::MAX)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::DATASHEET
    }
}

/// One completed cycle. The distance is always derived from the pulse width
/// it is stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pulse_width: Duration,
    distance_mm: u32,
}

impl Measurement {
    pub fn from_pulse(pulse_width: Duration, calibration: &Calibration) -> Self {
        Measurement {
            pulse_width,
            distance_mm: calibration.distance_mm(pulse_width),
        }
    }

    pub fn pulse_width(&self) -> Duration {
        self.pulse_width
    }

    pub fn distance_mm(&self) -> u32 {
        self.distance_mm
    }
}

/// Outcome of the most recent cycle, as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reading {
    #[default]
    Empty,
    Ready(Measurement),
    Failed(RangingError),
}

impl Reading {
    /// Distance in millimetres, 0 when there is nothing valid to report.
    pub fn distance_mm(&self) -> u32 {
        match self {
            Reading::Ready(m) => m.distance_mm(),
            Reading::Empty | Reading::Failed(_) => 0,
        }
    }

    pub fn measurement(&self) -> Option<Measurement> {
        match self {
            Reading::Ready(m) => Some(*m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RangingState {
    Idle = 0,
    TriggerArmed = 1,
    AwaitingRisingEdge = 2,
    AwaitingFallingEdge = 3,
    MeasurementReady = 4,
    TimedOut = 5,
}

impl RangingState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RangingState::TriggerArmed,
            2 => RangingState::AwaitingRisingEdge,
            3 => RangingState::AwaitingFallingEdge,
            4 => RangingState::MeasurementReady,
            5 => RangingState::TimedOut,
            _ => RangingState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangingConfig {
    pub calibration: Calibration,
    /// How long the trigger is held high. At least [`MIN_TRIGGER_PULSE`].
    pub trigger_pulse: Duration,
    pub rising_timeout: Duration,
    /// Must exceed [`MAX_ECHO_WIDTH`].
    pub falling_timeout: Duration,
}

impl RangingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trigger_pulse < MIN_TRIGGER_PULSE {
            return Err(RangingError::invalid(format!(
                "trigger pulse {:?} is shorter than the sensor minimum {:?}",
                self.trigger_pulse, MIN_TRIGGER_PULSE
            )));
        }
        if self.rising_timeout.is_zero() {
            return Err(RangingError::invalid("rising-edge timeout must be non-zero"));
        }
        if self.falling_timeout <= MAX_ECHO_WIDTH {
            return Err(RangingError::invalid(format!(
                "falling-edge timeout {:?} does not exceed the maximum echo width {:?}",
                self.falling_timeout, MAX_ECHO_WIDTH
            )));
        }
        Ok(())
    }
}

impl Default for RangingConfig {
    fn default() -> Self {
        RangingConfig {
            calibration: Calibration::DATASHEET,
            trigger_pulse: DEFAULT_TRIGGER_PULSE,
            rising_timeout: DEFAULT_RISING_TIMEOUT,
            falling_timeout: DEFAULT_FALLING_TIMEOUT,
        }
    }
}

/// The trigger and echo lines of one physical sensor.
///
/// The trigger is driven LOW when the handle is dropped.
pub struct SensorHandle<T: TriggerLine, S: EdgeSource> {
    trigger: T,
    echo: S,
}

impl<T: TriggerLine, S: EdgeSource> SensorHandle<T, S> {
    pub fn new(trigger: T, echo: S) -> Self {
        SensorHandle { trigger, echo }
    }

    fn force_low(&mut self) -> Result<()> {
        self.trigger.set_level(Level::Low)
    }
}

impl<T: TriggerLine, S: EdgeSource> Drop for SensorHandle<T, S> {
    fn drop(&mut self) {
        if let Err(err) = self.force_low() {
            warn!(error = %err, "could not drive trigger low on release");
        }
    }
}

/// Echo-ranging engine for one sensor.
///
/// At most one cycle is in flight at a time: the handle lock doubles as the
/// re-entrancy guard, and a caller that finds it taken gets [`RangingError::Busy`].
/// The published [`Reading`] sits behind its own lock so readers never wait
/// on a measurement.
pub struct Ranger<T: TriggerLine, S: EdgeSource, C: Clock> {
    handle: Mutex<Option<SensorHandle<T, S>>>,
    state: AtomicU8,
    last: RwLock<Reading>,
    clock: C,
    config: RangingConfig,
}

impl<T: TriggerLine, S: EdgeSource, C: Clock> Ranger<T, S, C> {
    pub fn new(mut handle: SensorHandle<T, S>, clock: C, config: RangingConfig) -> Result<Self> {
        config.validate()?;
        handle.force_low()?;
        Ok(Ranger {
            handle: Mutex::new(Some(handle)),
            state: AtomicU8::new(RangingState::Idle as u8),
            last: RwLock::new(Reading::Empty),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn state(&self) -> RangingState {
        RangingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn last_reading(&self) -> Reading {
        self.last.read().clone()
    }

    pub fn read_last_distance_mm(&self) -> u32 {
        self.last.read().distance_mm()
    }

    /// Emit one trigger pulse and time the echo it produces.
    ///
    /// The outcome is also published as the latest [`Reading`], except for
    /// `Busy` and `NotReady` which never touched the sensor. The trigger is
    /// LOW on every return path.
    pub fn trigger_and_measure(&self) -> Result<Measurement> {
        let mut guard = self.handle.try_lock().ok_or(RangingError::Busy)?;
        let handle = guard.as_mut().ok_or(RangingError::NotReady)?;

        let outcome = self.run_cycle(handle);
        if outcome.is_err() {
            if let Err(err) = handle.force_low() {
                warn!(error = %err, "could not drive trigger low after failed cycle");
            }
        }

        let (state, reading) = match &outcome {
            Ok(measurement) => (RangingState::MeasurementReady, Reading::Ready(*measurement)),
            Err(err @ (RangingError::NoEcho | RangingError::EchoStuck)) => {
                (RangingState::TimedOut, Reading::Failed(err.clone()))
            }
            Err(err) => (RangingState::Idle, Reading::Failed(err.clone())),
        };
        self.set_state(state);
        *self.last.write() = reading;
        outcome
    }

    fn run_cycle(&self, handle: &mut SensorHandle<T, S>) -> Result<Measurement> {
        handle.echo.arm();
        self.set_state(RangingState::TriggerArmed);

        handle.trigger.set_level(Level::High)?;
        self.clock.sleep(self.config.trigger_pulse);
        handle.trigger.set_level(Level::Low)?;

        self.set_state(RangingState::AwaitingRisingEdge);
        let rising = match handle.echo.await_edge(Edge::Rising, self.config.rising_timeout)? {
            EdgeWait::Seen(event) => event,
            EdgeWait::TimedOut => {
                debug!("no echo within {:?}", self.config.rising_timeout);
                return Err(RangingError::NoEcho);
            }
        };

        self.set_state(RangingState::AwaitingFallingEdge);
        let falling = match handle.echo.await_edge(Edge::Falling, self.config.falling_timeout)? {
            EdgeWait::Seen(event) => event,
            EdgeWait::TimedOut => {
                debug!("echo still high after {:?}", self.config.falling_timeout);
                return Err(RangingError::EchoStuck);
            }
        };

        let measurement = Measurement::from_pulse(
            falling.timestamp - rising.timestamp,
            &self.config.calibration,
        );
        debug!(
            width_ns = measurement.pulse_width().as_nanos() as u64,
            distance_mm = measurement.distance_mm(),
            "cycle complete"
        );
        Ok(measurement)
    }

    /// Forget the published reading and return to `Idle`.
    pub fn reset(&self) {
        *self.last.write() = Reading::Empty;
        self.set_state(RangingState::Idle);
    }

    /// Park the sensor: wait out any in-flight cycle, drive the trigger LOW,
    /// clear the reading, then hold the handle for `settle` so nothing can
    /// re-trigger inside the quiet window. Returns when the quiet window began.
    ///
    /// A failed write to the trigger is reported only after the reading is
    /// cleared and the settle delay has run.
    pub fn quiesce(&self, settle: Duration) -> Result<Instant> {
        let mut guard = self.handle.lock();
        let parked = match guard.as_mut() {
            Some(handle) => handle.force_low(),
            None => Ok(()),
        };
        self.reset();
        let quiet_from = self.clock.now();
        self.clock.sleep(settle);
        parked.map(|()| quiet_from)
    }

    /// Give up the lines. Later cycles fail with `NotReady`.
    pub fn release(&self) -> Option<SensorHandle<T, S>> {
        let handle = self.handle.lock().take();
        self.reset();
        handle
    }

    fn set_state(&self, state: RangingState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
