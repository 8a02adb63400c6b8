//! Where echo edge timestamps come from.
//!
//! Two interchangeable strategies sit behind [`EdgeSource`]: [`PollingSource`]
//! samples the echo level in a bounded busy-wait, [`InterruptSource`] waits for
//! an asynchronous notifier to stamp edges into an [`EchoSlot`].

pub mod interrupt;
pub mod poll;

use std::time::Duration;

use crate::error::Result;
use crate::line::{Edge, EdgeEvent};

pub use interrupt::{EchoNotifier, EchoSlot, InterruptSource};
pub use poll::{PollConfig, PollingSource};

/// Outcome of waiting for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWait {
    Seen(EdgeEvent),
    TimedOut,
}

pub trait EdgeSource: Send {
    /// Forget anything observed for a previous cycle. Called right before the
    /// trigger pulse.
    fn arm(&mut self);

    /// Wait at most `timeout` for `expected`. Never retries internally.
    fn await_edge(&mut self, expected: Edge, timeout: Duration) -> Result<EdgeWait>;
}

impl<S: EdgeSource + ?Sized> EdgeSource for Box<S> {
    fn arm(&mut self) {
        (**self).arm()
    }

    fn await_edge(&mut self, expected: Edge, timeout: Duration) -> Result<EdgeWait> {
        (**self).await_edge(expected, timeout)
    }
}
