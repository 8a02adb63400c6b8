//! Linux character-device GPIO backend.
//!
//! Line events delivered by the kernel carry `CLOCK_MONOTONIC` timestamps,
//! the same timeline [`MonotonicClock`] reads, so edges stamped here line up
//! with the engine's deadlines.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpio_cdev::{Chip, EventRequestFlags, EventType, LineEventHandle, LineHandle, LineRequestFlags};
use tracing::{debug, error, info, warn};

use crate::clock::{Instant, MonotonicClock};
use crate::config::{Settings, Strategy};
use crate::edge::{EchoNotifier, EdgeSource, EdgeWait, InterruptSource, PollingSource};
use crate::error::{RangingError, Result};
use crate::line::{EchoLine, Edge, EdgeEvent, Level, TriggerLine};
use crate::ranging::SensorHandle;

const TRIGGER_CONSUMER: &str = "hcsr04-trigger";
const ECHO_CONSUMER: &str = "hcsr04-echo";

/// How long the watcher blocks in `poll` before re-checking for shutdown.
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

pub struct CdevTrigger {
    handle: LineHandle,
}

impl TriggerLine for CdevTrigger {
    fn set_level(&mut self, level: Level) -> Result<()> {
        self.handle
            .set_value(level.as_raw())
            .map_err(RangingError::gpio)
    }
}

pub struct CdevEcho {
    handle: LineHandle,
}

impl EchoLine for CdevEcho {
    fn level(&self) -> Result<Level> {
        self.handle
            .get_value()
            .map(Level::from_raw)
            .map_err(RangingError::gpio)
    }
}

/// `Ok(true)` when the fd is readable, `Ok(false)` on timeout or signal.
fn poll_with_timeout(fd: i32, timeout: Duration) -> Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI,
        revents: 0,
    };

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    match unsafe { libc::poll(&mut pollfd, 1, timeout_ms) } {
        -1 => {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(RangingError::gpio(err))
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Thread that turns kernel line events on the echo pin into slot stamps.
/// Stops and joins on drop.
pub struct EdgeWatcher {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EdgeWatcher {
    pub fn spawn(events: LineEventHandle, notifier: EchoNotifier) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("hcsr04-echo".to_string())
            .spawn(move || watch(events, notifier, flag))
            .map_err(|e| RangingError::Worker(e.to_string()))?;
        Ok(EdgeWatcher {
            stop,
            worker: Some(worker),
        })
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("echo watcher panicked");
            }
        }
    }
}

fn watch(mut events: LineEventHandle, notifier: EchoNotifier, stop: Arc<AtomicBool>) {
    let fd = events.as_raw_fd();
    debug!("echo watcher running");
    while !stop.load(Ordering::Acquire) {
        match poll_with_timeout(fd, WATCH_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                error!(error = %err, "echo event poll failed; watcher exiting");
                break;
            }
        }
        match events.get_event() {
            Ok(event) => {
                let edge = match event.event_type() {
                    EventType::RisingEdge => Edge::Rising,
                    EventType::FallingEdge => Edge::Falling,
                };
                notifier.notify(EdgeEvent {
                    edge,
                    timestamp: Instant::from_nanos(event.timestamp()),
                });
            }
            Err(err) => warn!(error = %err, "could not read echo event"),
        }
    }
    debug!("echo watcher stopped");
}

/// Interrupt-driven source bundled with the watcher feeding it.
pub struct CdevEdgeSource {
    source: InterruptSource<MonotonicClock>,
    _watcher: EdgeWatcher,
}

impl EdgeSource for CdevEdgeSource {
    fn arm(&mut self) {
        self.source.arm();
    }

    fn await_edge(&mut self, expected: Edge, timeout: Duration) -> Result<EdgeWait> {
        self.source.await_edge(expected, timeout)
    }
}

fn not_ready(what: &str, err: impl std::fmt::Display) -> RangingError {
    error!("cannot acquire {}: {}", what, err);
    RangingError::NotReady
}

fn open_chip(settings: &Settings) -> Result<Chip> {
    Chip::new(&settings.chip).map_err(|e| not_ready(&settings.chip, e))
}

fn request_trigger(chip: &mut Chip, offset: u32) -> Result<CdevTrigger> {
    let line = chip
        .get_line(offset)
        .map_err(|e| not_ready("trigger line", e))?;
    let handle = line
        .request(LineRequestFlags::OUTPUT, 0, TRIGGER_CONSUMER)
        .map_err(|e| not_ready("trigger line", e))?;
    Ok(CdevTrigger { handle })
}

/// Trigger plus a busy-wait echo source.
pub fn open_polling(settings: &Settings) -> Result<(CdevTrigger, PollingSource<CdevEcho, MonotonicClock>)> {
    let poll = settings.poll_config()?;
    let mut chip = open_chip(settings)?;
    let trigger = request_trigger(&mut chip, settings.trigger_line)?;
    let echo = chip
        .get_line(settings.echo_line)
        .and_then(|line| line.request(LineRequestFlags::INPUT, 0, ECHO_CONSUMER))
        .map_err(|e| not_ready("echo line", e))?;
    Ok((
        trigger,
        PollingSource::new(CdevEcho { handle: echo }, MonotonicClock, poll),
    ))
}

/// Trigger plus an edge-event echo source with its watcher thread running.
pub fn open_interrupt(settings: &Settings) -> Result<(CdevTrigger, CdevEdgeSource)> {
    let mut chip = open_chip(settings)?;
    let trigger = request_trigger(&mut chip, settings.trigger_line)?;
    let events = chip
        .get_line(settings.echo_line)
        .and_then(|line| {
            line.events(
                LineRequestFlags::INPUT,
                EventRequestFlags::BOTH_EDGES,
                ECHO_CONSUMER,
            )
        })
        .map_err(|e| not_ready("echo events", e))?;
    let source = InterruptSource::new(MonotonicClock);
    let watcher = EdgeWatcher::spawn(events, source.notifier())?;
    Ok((
        trigger,
        CdevEdgeSource {
            source,
            _watcher: watcher,
        },
    ))
}

/// Acquire both lines with the configured strategy.
pub fn open_sensor(settings: &Settings) -> Result<SensorHandle<CdevTrigger, Box<dyn EdgeSource>>> {
    let handle: SensorHandle<CdevTrigger, Box<dyn EdgeSource>> = match settings.strategy {
        Strategy::Interrupt => {
            let (trigger, source) = open_interrupt(settings)?;
            SensorHandle::new(trigger, Box::new(source))
        }
        Strategy::Poll => {
            let (trigger, source) = open_polling(settings)?;
            SensorHandle::new(trigger, Box::new(source))
        }
    };
    info!(
        chip = %settings.chip,
        trigger = settings.trigger_line,
        echo = settings.echo_line,
        strategy = ?settings.strategy,
        "sensor lines acquired"
    );
    Ok(handle)
}
