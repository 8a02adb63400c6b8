//! Simulated clock and sensor for exercising the engine without hardware.
//!
//! [`MockClock`] is a shared virtual timeline: `sleep` and `relax` move it
//! forward instead of blocking. [`SimulatedSensor`] models an HC-SR04 on top
//! of it, answering each trigger pulse according to an [`EchoScript`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, Instant};
use crate::edge::EchoNotifier;
use crate::error::{RangingError, Result};
use crate::line::{EchoLine, Edge, EdgeEvent, Level, TriggerLine};

/// Virtual monotonic clock. Clones share one timeline.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<AtomicU64>,
    relax_step: u64,
}

impl MockClock {
    /// Starts at zero; each busy-wait step advances 1 µs.
    pub fn new() -> Self {
        Self::with_relax_step(Duration::from_micros(1))
    }

    pub fn with_relax_step(step: Duration) -> Self {
        MockClock {
            now: Arc::new(AtomicU64::new(0)),
            relax_step: u64::try_from(step.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        Instant::from_nanos(self.now.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn relax(&self) {
        self.now.fetch_add(self.relax_step, Ordering::SeqCst);
    }
}

/// How the simulated sensor answers a trigger pulse. Times are measured from
/// the falling edge of the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoScript {
    Echo { delay: Duration, width: Duration },
    /// Nothing reflected: the echo line stays low.
    Silent,
    /// Echo goes high after `delay` and never returns low.
    Stuck { delay: Duration },
}

impl EchoScript {
    pub fn echo(delay: Duration, width: Duration) -> Self {
        EchoScript::Echo { delay, width }
    }

    fn window(&self, fired: Instant) -> Option<(Instant, Option<Instant>)> {
        match *self {
            EchoScript::Echo { delay, width } => Some((fired + delay, Some(fired + delay + width))),
            EchoScript::Silent => None,
            EchoScript::Stuck { delay } => Some((fired + delay, None)),
        }
    }
}

/// One complete pulse seen on the trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub rose: Instant,
    pub fell: Instant,
}

impl Pulse {
    pub fn width(&self) -> Duration {
        self.fell - self.rose
    }
}

#[derive(Debug)]
struct SimState {
    script: EchoScript,
    trigger: Level,
    rose: Option<Instant>,
    fired: Option<Instant>,
    pulses: Vec<Pulse>,
    notifier: Option<EchoNotifier>,
    fail_writes: bool,
}

/// An HC-SR04 living on a [`MockClock`] timeline.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    clock: MockClock,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSensor {
    pub fn new(clock: MockClock, script: EchoScript) -> Self {
        SimulatedSensor {
            clock,
            state: Arc::new(Mutex::new(SimState {
                script,
                trigger: Level::Low,
                rose: None,
                fired: None,
                pulses: Vec::new(),
                notifier: None,
                fail_writes: false,
            })),
        }
    }

    pub fn lines(&self) -> (MockTrigger, MockEcho) {
        (
            MockTrigger { sim: self.clone() },
            MockEcho { sim: self.clone() },
        )
    }

    pub fn trigger(&self) -> MockTrigger {
        MockTrigger { sim: self.clone() }
    }

    /// Stamp edges into `notifier` on every pulse, the way an edge interrupt would.
    pub fn attach_notifier(&self, notifier: EchoNotifier) {
        self.state.lock().notifier = Some(notifier);
    }

    pub fn set_script(&self, script: EchoScript) {
        self.state.lock().script = script;
    }

    /// Make every subsequent trigger write fail with a GPIO error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn trigger_level(&self) -> Level {
        self.state.lock().trigger
    }

    pub fn pulses(&self) -> Vec<Pulse> {
        self.state.lock().pulses.clone()
    }

    fn echo_level(&self) -> Level {
        let state = self.state.lock();
        let Some(fired) = state.fired else {
            return Level::Low;
        };
        let now = self.clock.now();
        match state.script.window(fired) {
            Some((rise, Some(fall))) if now >= rise && now < fall => Level::High,
            Some((rise, None)) if now >= rise => Level::High,
            _ => Level::Low,
        }
    }

    fn drive(&self, level: Level) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(RangingError::gpio("simulated write failure"));
        }
        let now = self.clock.now();
        match (state.trigger, level) {
            (Level::Low, Level::High) => state.rose = Some(now),
            (Level::High, Level::Low) => {
                if let Some(rose) = state.rose.take() {
                    state.pulses.push(Pulse { rose, fell: now });
                }
                state.fired = Some(now);
                if let (Some(notifier), Some((rise, fall))) =
                    (state.notifier.as_ref(), state.script.window(now))
                {
                    notifier.notify(EdgeEvent {
                        edge: Edge::Rising,
                        timestamp: rise,
                    });
                    if let Some(fall) = fall {
                        notifier.notify(EdgeEvent {
                            edge: Edge::Falling,
                            timestamp: fall,
                        });
                    }
                }
            }
            _ => {}
        }
        state.trigger = level;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockTrigger {
    sim: SimulatedSensor,
}

impl TriggerLine for MockTrigger {
    fn set_level(&mut self, level: Level) -> Result<()> {
        self.sim.drive(level)
    }
}

#[derive(Debug)]
pub struct MockEcho {
    sim: SimulatedSensor,
}

impl EchoLine for MockEcho {
    fn level(&self) -> Result<Level> {
        Ok(self.sim.echo_level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_shared_timeline() {
        let clock = MockClock::new();
        let other = clock.clone();
        clock.sleep(Duration::from_millis(3));
        other.relax();
        assert_eq!(clock.now().as_nanos(), 3_001_000);
    }

    #[test]
    fn test_simulated_echo_window() {
        let clock = MockClock::new();
        let sim = SimulatedSensor::new(
            clock.clone(),
            EchoScript::echo(Duration::from_micros(100), Duration::from_micros(300)),
        );
        let (mut trigger, echo) = sim.lines();
        assert_eq!(echo.level().unwrap(), Level::Low);

        trigger.set_level(Level::High).unwrap();
        clock.advance(Duration::from_micros(10));
        trigger.set_level(Level::Low).unwrap();

        clock.advance(Duration::from_micros(99));
        assert_eq!(echo.level().unwrap(), Level::Low);
        clock.advance(Duration::from_micros(1));
        assert_eq!(echo.level().unwrap(), Level::High);
        clock.advance(Duration::from_micros(300));
        assert_eq!(echo.level().unwrap(), Level::Low);

        let pulses = sim.pulses();
        assert_eq!(pulses.len(), 1);
        assert_eq!(pulses[0].width(), Duration::from_micros(10));
    }

    #[test]
    fn test_stuck_echo_stays_high() {
        let clock = MockClock::new();
        let sim = SimulatedSensor::new(
            clock.clone(),
            EchoScript::Stuck {
                delay: Duration::from_micros(50),
            },
        );
        let (mut trigger, echo) = sim.lines();
        trigger.set_level(Level::High).unwrap();
        trigger.set_level(Level::Low).unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(echo.level().unwrap(), Level::High);
    }
}
