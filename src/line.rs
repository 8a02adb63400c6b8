//! GPIO capabilities the engine consumes.

use crate::clock::Instant;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_raw(value: u8) -> Self {
        if value == 0 { Level::Low } else { Level::High }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Line level once this edge has happened.
    pub fn settled_level(self) -> Level {
        match self {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
        }
    }
}

/// A transition on the echo line and when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub edge: Edge,
    pub timestamp: Instant,
}

/// Output side of the sensor.
pub trait TriggerLine: Send {
    fn set_level(&mut self, level: Level) -> Result<()>;
}

/// Input side of the sensor, sampled on demand.
pub trait EchoLine: Send {
    fn level(&self) -> Result<Level>;
}

impl<T: TriggerLine + ?Sized> TriggerLine for Box<T> {
    fn set_level(&mut self, level: Level) -> Result<()> {
        (**self).set_level(level)
    }
}
