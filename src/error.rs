use thiserror::Error;

pub type Result<T> = std::result::Result<T, RangingError>;

/// Everything that can go wrong between pulsing the trigger and publishing a distance.
///
/// None of these are fatal: the next measurement cycle starts from a clean slate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangingError {
    /// The echo line never went high. Nothing reflected, or the sensor is unplugged.
    #[error("no echo received before the rising-edge deadline")]
    NoEcho,
    /// The echo line went high and never came back down.
    #[error("echo line stuck high past the falling-edge deadline")]
    EchoStuck,
    /// Another measurement is already in flight on this sensor.
    #[error("a measurement is already in flight")]
    Busy,
    /// The lines were never acquired, or have been released.
    #[error("sensor lines are not available")]
    NotReady,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("gpio i/o failed: {0}")]
    Gpio(String),
    #[error("cannot start worker thread: {0}")]
    Worker(String),
}

impl RangingError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RangingError::InvalidConfig(msg.into())
    }

    pub(crate) fn gpio(err: impl std::fmt::Display) -> Self {
        RangingError::Gpio(err.to_string())
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RangingError::NoEcho | RangingError::EchoStuck | RangingError::Busy
        )
    }
}
