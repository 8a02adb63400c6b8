//! Edge-notification strategy.
//!
//! The notifier runs in a context that must not block or allocate: the
//! gpio-cdev watcher thread on Linux, or a simulated sensor in tests. It only
//! stamps timestamps into the [`EchoSlot`]; the engine turns them into a
//! pulse width.
//!
//! The slot holds one measurement's worth of edges. The notifier is its only
//! writer (Release stores), the engine its only reader (Acquire loads). The
//! engine clears it before each trigger pulse and reads it only until the
//! next one, so no further locking is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::trace;

use super::{EdgeSource, EdgeWait};
use crate::clock::{Clock, Instant};
use crate::error::Result;
use crate::line::{Edge, EdgeEvent};

const EMPTY: u64 = u64::MAX;

pub const DEFAULT_RESOLUTION: Duration = Duration::from_micros(100);

#[derive(Debug)]
pub struct EchoSlot {
    rising: AtomicU64,
    falling: AtomicU64,
}

impl EchoSlot {
    pub fn new() -> Self {
        EchoSlot {
            rising: AtomicU64::new(EMPTY),
            falling: AtomicU64::new(EMPTY),
        }
    }

    /// Rising goes first: a falling edge stamped mid-clear then finds no
    /// rising edge and is dropped.
    pub fn clear(&self) {
        self.rising.store(EMPTY, Ordering::Release);
        self.falling.store(EMPTY, Ordering::Release);
    }

    /// Record an edge. Only the first rising edge after a clear is kept, and a
    /// falling edge only counts once a rising edge at or before it is on record.
    pub fn stamp(&self, event: EdgeEvent) -> bool {
        let nanos = event.timestamp.as_nanos();
        if nanos == EMPTY {
            return false;
        }
        match event.edge {
            Edge::Rising => self
                .rising
                .compare_exchange(EMPTY, nanos, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Edge::Falling => {
                let rising = self.rising.load(Ordering::Acquire);
                if rising == EMPTY || nanos < rising {
                    return false;
                }
                self.falling
                    .compare_exchange(EMPTY, nanos, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
        }
    }

    pub fn peek(&self, edge: Edge) -> Option<Instant> {
        let cell = match edge {
            Edge::Rising => &self.rising,
            Edge::Falling => &self.falling,
        };
        match cell.load(Ordering::Acquire) {
            EMPTY => None,
            nanos => Some(Instant::from_nanos(nanos)),
        }
    }
}

impl Default for EchoSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Write end of an [`EchoSlot`], handed to whatever observes line transitions.
#[derive(Debug, Clone)]
pub struct EchoNotifier {
    slot: Arc<EchoSlot>,
}

impl EchoNotifier {
    /// Non-blocking and allocation-free.
    pub fn notify(&self, event: EdgeEvent) -> bool {
        self.slot.stamp(event)
    }
}

/// Waits for the notifier to fill the slot.
pub struct InterruptSource<C> {
    slot: Arc<EchoSlot>,
    clock: C,
    resolution: Duration,
}

impl<C: Clock> InterruptSource<C> {
    pub fn new(clock: C) -> Self {
        InterruptSource {
            slot: Arc::new(EchoSlot::new()),
            clock,
            resolution: DEFAULT_RESOLUTION,
        }
    }

    /// How long to sleep between checks of the slot.
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution.max(Duration::from_nanos(1));
        self
    }

    pub fn notifier(&self) -> EchoNotifier {
        EchoNotifier {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C: Clock> EdgeSource for InterruptSource<C> {
    fn arm(&mut self) {
        self.slot.clear();
    }

    fn await_edge(&mut self, expected: Edge, timeout: Duration) -> Result<EdgeWait> {
        let start = self.clock.now();
        loop {
            if let Some(timestamp) = self.slot.peek(expected) {
                trace!(?expected, ts = timestamp.as_nanos(), "edge stamped");
                return Ok(EdgeWait::Seen(EdgeEvent {
                    edge: expected,
                    timestamp,
                }));
            }
            let waited = self.clock.now() - start;
            if waited >= timeout {
                return Ok(EdgeWait::TimedOut);
            }
            self.clock.sleep(self.resolution.min(timeout - waited));
        }
    }
}
