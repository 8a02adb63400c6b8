//! Start/stop control of periodic measurement, and the device-level facade
//! the I/O layer talks to.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, Instant};
use crate::cycle::{CycleConfig, CycleScheduler};
use crate::edge::EdgeSource;
use crate::error::{RangingError, Result};
use crate::line::TriggerLine;
use crate::ranging::{Measurement, Ranger, Reading};

/// Quiet time the sensor needs after its last trigger before it can be
/// re-triggered reliably.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

/// Longest text accepted on the period write path: `u32::MAX` in decimal.
pub const MAX_PERIOD_TEXT: usize = 10;

/// Control words accepted on the device's write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

impl FromStr for Command {
    type Err = RangingError;

    /// Judged on the first three characters, case-insensitively:
    /// `on`/`1` start, `off`/`0` stop.
    fn from_str(s: &str) -> Result<Self> {
        let head = s.chars().take(3).collect::<String>().to_ascii_lowercase();
        if head.starts_with("on") || head.starts_with('1') {
            Ok(Command::Start)
        } else if head.starts_with("off") || head.starts_with('0') {
            Ok(Command::Stop)
        } else {
            Err(RangingError::invalid(format!("unknown control word {s:?}")))
        }
    }
}

/// Parse a cycle period written as decimal milliseconds, with an optional
/// trailing newline.
pub fn parse_period_ms(s: &str) -> Result<Duration> {
    if s.len() > MAX_PERIOD_TEXT {
        return Err(RangingError::invalid(format!(
            "period text is {} bytes, at most {MAX_PERIOD_TEXT} allowed",
            s.len()
        )));
    }
    let digits = s.strip_suffix('\n').unwrap_or(s);
    digits
        .parse::<u32>()
        .map(|ms| Duration::from_millis(u64::from(ms)))
        .map_err(|_| RangingError::invalid(format!("bad period {s:?}")))
}

/// Copy `"<value>\n"` into `buf`, truncating to fit.
fn render_line(value: impl std::fmt::Display, buf: &mut [u8]) -> usize {
    let text = format!("{value}\n");
    let len = text.len().min(buf.len());
    buf[..len].copy_from_slice(&text.as_bytes()[..len]);
    len
}

#[derive(Default)]
struct Gate {
    scheduler: Option<CycleScheduler>,
    last_stop: Option<Instant>,
}

/// One ranging sensor with its measurement period and start/stop gate.
///
/// `start` and `stop` are serialized by the gate lock; readers of the last
/// distance and of the running flag never take it.
pub struct DistanceMeter<T, S, C>
where
    T: TriggerLine + 'static,
    S: EdgeSource + 'static,
    C: Clock + 'static,
{
    ranger: Arc<Ranger<T, S, C>>,
    cycle: Arc<CycleConfig>,
    gate: Mutex<Gate>,
    running: AtomicBool,
    settle: Duration,
}

impl<T, S, C> DistanceMeter<T, S, C>
where
    T: TriggerLine + 'static,
    S: EdgeSource + 'static,
    C: Clock + 'static,
{
    pub fn new(ranger: Ranger<T, S, C>, cycle: CycleConfig, settle: Duration) -> Self {
        DistanceMeter {
            ranger: Arc::new(ranger),
            cycle: Arc::new(cycle),
            gate: Mutex::new(Gate::default()),
            running: AtomicBool::new(false),
            settle,
        }
    }

    pub fn ranger(&self) -> &Ranger<T, S, C> {
        &self.ranger
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Begin periodic measurement. No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut gate = self.gate.lock();
        if gate.scheduler.is_some() {
            debug!("start requested while running");
            return Ok(());
        }

        if let Some(stopped) = gate.last_stop {
            let clock = self.ranger.clock();
            let quiet = clock.now() - stopped;
            if quiet < self.settle {
                clock.sleep(self.settle - quiet);
            }
        }

        self.ranger.reset();
        let scheduler = CycleScheduler::arm(Arc::clone(&self.ranger), Arc::clone(&self.cycle))?;
        gate.scheduler = Some(scheduler);
        self.running.store(true, Ordering::Release);
        info!(
            period_ms = self.cycle.period().as_millis() as u64,
            "measurement started"
        );
        Ok(())
    }

    /// End periodic measurement. No-op when already stopped.
    ///
    /// Pending cycles are cancelled before this returns, the trigger is LOW,
    /// and the settle delay has elapsed: nothing can emit a trigger pulse
    /// inside the quiet window. If the trigger could not be driven LOW the
    /// meter still ends up stopped, and the error is returned afterwards.
    pub fn stop(&self) -> Result<()> {
        let mut gate = self.gate.lock();
        let Some(scheduler) = gate.scheduler.take() else {
            debug!("stop requested while stopped");
            return Ok(());
        };
        self.running.store(false, Ordering::Release);

        scheduler.disarm();
        let (quiet_from, parked) = match self.ranger.quiesce(self.settle) {
            Ok(quiet_from) => (quiet_from, Ok(())),
            Err(err) => {
                // the trigger state is unknown, so the quiet window restarts now
                warn!(error = %err, "could not park trigger on stop");
                (self.ranger.clock().now(), Err(err))
            }
        };
        gate.last_stop = Some(quiet_from);
        info!("measurement stopped");
        parked
    }

    pub fn apply(&self, command: Command) -> Result<()> {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
        }
    }

    /// Measure once, right now. `Busy` if a cycle is already in flight.
    pub fn measure_now(&self) -> Result<Measurement> {
        self.ranger.trigger_and_measure()
    }

    pub fn set_cycle_period(&self, period: Duration) -> Result<Duration> {
        self.cycle.set_period(period)
    }

    pub fn cycle_period(&self) -> Duration {
        self.cycle.period()
    }

    /// Text write path for the period: see [`parse_period_ms`]. Returns the
    /// period that took effect.
    pub fn write_period_text(&self, text: &str) -> Result<Duration> {
        self.set_cycle_period(parse_period_ms(text)?)
    }

    /// Render the period as `"<ms>\n"` into `buf`, truncating like [`Self::read_text`].
    pub fn read_period_text(&self, buf: &mut [u8]) -> usize {
        render_line(self.cycle_period().as_millis(), buf)
    }

    /// Most recent distance in millimetres, 0 if nothing valid yet.
    pub fn read_last_distance_mm(&self) -> u32 {
        self.ranger.read_last_distance_mm()
    }

    pub fn last_reading(&self) -> Reading {
        self.ranger.last_reading()
    }

    /// Render the last distance as `"<mm>\n"` into `buf`.
    ///
    /// A buffer too small for the whole line receives its leading bytes; the
    /// return value is always the number of bytes written.
    pub fn read_text(&self, buf: &mut [u8]) -> usize {
        render_line(self.read_last_distance_mm(), buf)
    }
}

impl<T, S, C> Drop for DistanceMeter<T, S, C>
where
    T: TriggerLine + 'static,
    S: EdgeSource + 'static,
    C: Clock + 'static,
{
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "stop during teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant as WallInstant;

    use super::*;
    use crate::edge::{InterruptSource, PollConfig, PollingSource};
    use crate::line::Level;
    use crate::mock::{EchoScript, MockClock, MockEcho, MockTrigger, SimulatedSensor};
    use crate::ranging::{RangingConfig, SensorHandle};

    type PollingMeter = DistanceMeter<MockTrigger, PollingSource<MockEcho, MockClock>, MockClock>;

    fn polling_meter(script: EchoScript) -> (SimulatedSensor, MockClock, PollingMeter) {
        let clock = MockClock::new();
        let sim = SimulatedSensor::new(clock.clone(), script);
        let (trigger, echo) = sim.lines();
        let source = PollingSource::new(echo, clock.clone(), PollConfig::default());
        let ranger = Ranger::new(
            SensorHandle::new(trigger, source),
            clock.clone(),
            RangingConfig::default(),
        )
        .unwrap();
        let meter = DistanceMeter::new(ranger, CycleConfig::default(), DEFAULT_SETTLE);
        (sim, clock, meter)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = WallInstant::now() + Duration::from_secs(5);
        while WallInstant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    fn one_metre() -> EchoScript {
        EchoScript::echo(Duration::from_micros(250), Duration::from_nanos(5_400_000))
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!("on".parse::<Command>().unwrap(), Command::Start);
        assert_eq!("ON\n".parse::<Command>().unwrap(), Command::Start);
        assert_eq!("1".parse::<Command>().unwrap(), Command::Start);
        assert_eq!("off".parse::<Command>().unwrap(), Command::Stop);
        assert_eq!("Off\n".parse::<Command>().unwrap(), Command::Stop);
        assert_eq!("0".parse::<Command>().unwrap(), Command::Stop);
        assert!("of".parse::<Command>().is_err());
        assert!("go".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn test_start_runs_cycles() {
        let (sim, _clock, meter) = polling_meter(one_metre());
        meter.start().unwrap();
        assert!(meter.is_running());
        assert!(wait_until(|| meter.read_last_distance_mm() == 1000));
        meter.stop().unwrap();
        assert!(!sim.pulses().is_empty());
    }

    #[test]
    fn test_start_is_idempotent() {
        let (sim, _clock, meter) = polling_meter(one_metre());
        meter.set_cycle_period(Duration::ZERO).unwrap();
        meter.start().unwrap();
        meter.start().unwrap();
        assert!(wait_until(|| meter.read_last_distance_mm() == 1000));
        thread::sleep(Duration::from_millis(50));
        // one-shot mode: a second start while running must not add a cycle
        assert_eq!(sim.pulses().len(), 1);
        assert!(meter.is_running());
        meter.stop().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_leaves_trigger_low() {
        let (sim, clock, meter) = polling_meter(one_metre());
        let before = clock.now();
        meter.stop().unwrap();
        // stopping while stopped skips the settle delay entirely
        assert_eq!(clock.now(), before);
        assert_eq!(sim.trigger_level(), Level::Low);

        meter.start().unwrap();
        assert!(wait_until(|| meter.read_last_distance_mm() == 1000));
        meter.stop().unwrap();
        meter.stop().unwrap();
        assert!(!meter.is_running());
        assert_eq!(sim.trigger_level(), Level::Low);
        assert_eq!(meter.last_reading(), Reading::Empty);
        assert_eq!(meter.read_last_distance_mm(), 0);
    }

    #[test]
    fn test_settle_delay_precedes_next_trigger() {
        let (sim, clock, meter) = polling_meter(one_metre());
        meter.start().unwrap();
        assert!(wait_until(|| !sim.pulses().is_empty()));

        let stop_called = clock.now();
        meter.stop().unwrap();
        let pulses_at_stop = sim.pulses().len();
        assert!(clock.now() - stop_called >= DEFAULT_SETTLE);

        meter.start().unwrap();
        assert!(wait_until(|| sim.pulses().len() > pulses_at_stop));
        meter.stop().unwrap();

        let next = sim.pulses()[pulses_at_stop];
        assert!(next.rose - stop_called >= DEFAULT_SETTLE);
    }

    #[test]
    fn test_on_demand_measurement_while_stopped() {
        let (_sim, _clock, meter) = polling_meter(one_metre());
        assert!(!meter.is_running());
        assert_eq!(meter.measure_now().unwrap().distance_mm(), 1000);
        assert_eq!(meter.read_last_distance_mm(), 1000);
    }

    #[test]
    fn test_start_clears_previous_reading() {
        let (sim, _clock, meter) = polling_meter(one_metre());
        meter.measure_now().unwrap();
        sim.set_script(EchoScript::Silent);
        meter.set_cycle_period(Duration::ZERO).unwrap();
        meter.start().unwrap();
        assert!(wait_until(|| meter.last_reading() == Reading::Failed(RangingError::NoEcho)));
        meter.stop().unwrap();
    }

    #[test]
    fn test_apply_dispatches_commands() {
        let (_sim, _clock, meter) = polling_meter(one_metre());
        meter.apply("on".parse().unwrap()).unwrap();
        assert!(meter.is_running());
        meter.apply("off".parse().unwrap()).unwrap();
        assert!(!meter.is_running());
    }

    #[test]
    fn test_read_text_truncates_short_buffer() {
        let (_sim, _clock, meter) = polling_meter(one_metre());
        meter.measure_now().unwrap();

        let mut buf = [0u8; 16];
        let n = meter.read_text(&mut buf);
        assert_eq!(&buf[..n], b"1000\n");

        let mut short = [0u8; 3];
        assert_eq!(meter.read_text(&mut short), 3);
        assert_eq!(&short, b"100");

        assert_eq!(meter.read_text(&mut []), 0);
    }

    #[test]
    fn test_read_text_before_any_measurement() {
        let (_sim, _clock, meter) = polling_meter(one_metre());
        let mut buf = [0u8; 8];
        let n = meter.read_text(&mut buf);
        assert_eq!(&buf[..n], b"0\n");
    }

    #[test]
    fn test_period_setter_clamps() {
        let (_sim, _clock, meter) = polling_meter(one_metre());
        assert_eq!(
            meter.set_cycle_period(Duration::from_millis(10)).unwrap(),
            Duration::from_millis(60)
        );
        assert_eq!(meter.cycle_period(), Duration::from_millis(60));
    }

    #[test]
    fn test_failed_park_still_stops_and_settles() {
        let (sim, clock, meter) = polling_meter(one_metre());
        meter.set_cycle_period(Duration::ZERO).unwrap();
        meter.start().unwrap();
        assert!(wait_until(|| meter.read_last_distance_mm() == 1000));

        sim.fail_writes(true);
        let stop_called = clock.now();
        assert!(matches!(meter.stop(), Err(RangingError::Gpio(_))));
        assert!(!meter.is_running());
        assert_eq!(meter.last_reading(), Reading::Empty);
        assert!(clock.now() - stop_called >= DEFAULT_SETTLE);

        sim.fail_writes(false);
        let pulses_at_stop = sim.pulses().len();
        meter.start().unwrap();
        assert!(wait_until(|| sim.pulses().len() > pulses_at_stop));
        meter.stop().unwrap();

        let next = sim.pulses()[pulses_at_stop];
        assert!(next.rose - stop_called >= DEFAULT_SETTLE);
    }

    const HELD_SETTLE: Duration = Duration::from_millis(777);

    /// Blocks in the settle sleep until released.
    struct HeldSettleClock {
        inner: MockClock,
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Clock for HeldSettleClock {
        fn now(&self) -> Instant {
            self.inner.now()
        }

        fn sleep(&self, duration: Duration) {
            if duration == HELD_SETTLE {
                let _ = self.entered.send(());
                let _ = self.release.lock().recv();
            }
            self.inner.sleep(duration);
        }
    }

    #[test]
    fn test_running_flag_readable_during_settle() {
        let mock = MockClock::new();
        let sim = SimulatedSensor::new(mock.clone(), one_metre());
        let (trigger, echo) = sim.lines();
        let source = PollingSource::new(echo, mock.clone(), PollConfig::default());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let clock = HeldSettleClock {
            inner: mock,
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };
        let ranger = Ranger::new(SensorHandle::new(trigger, source), clock, RangingConfig::default()).unwrap();
        let meter = DistanceMeter::new(ranger, CycleConfig::default(), HELD_SETTLE);
        meter.set_cycle_period(Duration::ZERO).unwrap();
        meter.start().unwrap();
        assert!(wait_until(|| meter.read_last_distance_mm() == 1000));

        thread::scope(|s| {
            let stopping = s.spawn(|| meter.stop());
            entered_rx.recv().unwrap();
            // stop is parked inside the settle sleep with the gate held
            assert!(!meter.is_running());
            assert_eq!(meter.read_last_distance_mm(), 0);
            release_tx.send(()).unwrap();
            stopping.join().unwrap().unwrap();
        });
        assert!(!meter.is_running());
    }

    #[test]
    fn test_period_text_parsing() {
        assert_eq!(parse_period_ms("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_period_ms("250\n").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_period_ms("0").unwrap(), Duration::ZERO);
        assert_eq!(
            parse_period_ms("4294967295").unwrap(),
            Duration::from_millis(u64::from(u32::MAX))
        );
        assert!(parse_period_ms("4294967296").is_err());
        assert!(parse_period_ms("12345678901").is_err());
        assert!(parse_period_ms("").is_err());
        assert!(parse_period_ms("-5").is_err());
        assert!(parse_period_ms("fast").is_err());
        assert!(parse_period_ms("100 ms").is_err());
    }

    #[test]
    fn test_period_text_round_trip_clamps() {
        let (_sim, _clock, meter) = polling_meter(one_metre());
        let mut buf = [0u8; 16];
        let n = meter.read_period_text(&mut buf);
        assert_eq!(&buf[..n], b"100\n");

        assert_eq!(meter.write_period_text("20\n").unwrap(), Duration::from_millis(60));
        let n = meter.read_period_text(&mut buf);
        assert_eq!(&buf[..n], b"60\n");

        assert!(matches!(
            meter.write_period_text("soon"),
            Err(RangingError::InvalidConfig(_))
        ));
        assert_eq!(meter.cycle_period(), Duration::from_millis(60));

        let mut short = [0u8; 1];
        assert_eq!(meter.read_period_text(&mut short), 1);
        assert_eq!(&short, b"6");
    }

    #[test]
    fn test_interrupt_meter_round_trip() {
        let clock = MockClock::new();
        let sim = SimulatedSensor::new(clock.clone(), one_metre());
        let source = InterruptSource::new(clock.clone());
        sim.attach_notifier(source.notifier());
        let ranger = Ranger::new(
            SensorHandle::new(sim.trigger(), source),
            clock,
            RangingConfig::default(),
        )
        .unwrap();
        let meter = DistanceMeter::new(ranger, CycleConfig::default(), DEFAULT_SETTLE);

        meter.start().unwrap();
        assert!(wait_until(|| meter.read_last_distance_mm() == 1000));
        drop(meter);
        assert_eq!(sim.trigger_level(), Level::Low);
    }
}
