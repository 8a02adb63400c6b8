//! Busy-wait strategy.
//!
//! Deadlines are counted in coarse scheduler ticks rather than raw wall-clock
//! time: the budget for a wait is `ceil(timeout / tick)` ticks, and only whole
//! elapsed ticks count against it. The tick length depends on the platform's
//! scheduler frequency and is therefore configuration, not a constant. The
//! default of 4 ms matches a 250 Hz kernel, so the default 100 ms rising-edge
//! timeout is 25 ticks and the 500 ms falling-edge timeout is 125 ticks.

use std::time::Duration;

use tracing::trace;

use super::{EdgeSource, EdgeWait};
use crate::clock::{Clock, Instant};
use crate::error::{RangingError, Result};
use crate::line::{Edge, EdgeEvent, EchoLine};

pub const DEFAULT_TICK: Duration = Duration::from_millis(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    tick: Duration,
}

impl PollConfig {
    pub fn new(tick: Duration) -> Result<Self> {
        if tick.is_zero() {
            return Err(RangingError::invalid("poll tick must be non-zero"));
        }
        Ok(PollConfig { tick })
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Number of whole ticks a wait of `timeout` is allowed.
    pub fn ticks_for(&self, timeout: Duration) -> u64 {
        let tick = self.tick.as_nanos();
        let ticks = timeout.as_nanos().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    fn ticks_between(&self, start: Instant, now: Instant) -> u64 {
        let elapsed = (now - start).as_nanos() / self.tick.as_nanos();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig { tick: DEFAULT_TICK }
    }
}

/// Samples the echo level until it matches the expected edge or the tick
/// budget runs out.
pub struct PollingSource<E, C> {
    echo: E,
    clock: C,
    config: PollConfig,
}

impl<E: EchoLine, C: Clock> PollingSource<E, C> {
    pub fn new(echo: E, clock: C, config: PollConfig) -> Self {
        PollingSource {
            echo,
            clock,
            config,
        }
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }
}

impl<E: EchoLine, C: Clock> EdgeSource for PollingSource<E, C> {
    fn arm(&mut self) {}

    fn await_edge(&mut self, expected: Edge, timeout: Duration) -> Result<EdgeWait> {
        let target = expected.settled_level();
        let budget = self.config.ticks_for(timeout);
        let start = self.clock.now();
        let mut samples: u64 = 0;

        loop {
            let now = self.clock.now();
            if self.echo.level()? == target {
                trace!(?expected, samples, "edge observed");
                return Ok(EdgeWait::Seen(EdgeEvent {
                    edge: expected,
                    timestamp: now,
                }));
            }
            if self.config.ticks_between(start, now) >= budget {
                trace!(?expected, samples, budget, "tick budget exhausted");
                return Ok(EdgeWait::TimedOut);
            }
            samples += 1;
            self.clock.relax();
        }
    }
}
