//! Echo-ranging engine for the HC-SR04 ultrasonic sensor.
//!
//! A [`Ranger`] pulses the trigger line, times the echo pulse through an
//! [`EdgeSource`] and converts the width to millimetres with a configurable
//! [`Calibration`]. A [`DistanceMeter`] adds periodic re-triggering and a
//! start/stop gate on top. On Linux the lines come from the GPIO character
//! device via [`cdev`].
//!
//! ```no_run
//! use hcsr04_ranging::{cdev, DistanceMeter, MonotonicClock, Ranger, Settings};
//!
//! # fn main() -> Result<(), hcsr04_ranging::RangingError> {
//! let settings = Settings::load(Some("hcsr04.toml"))?;
//! let handle = cdev::open_sensor(&settings)?;
//! let ranger = Ranger::new(handle, MonotonicClock, settings.ranging_config()?)?;
//! let meter = DistanceMeter::new(ranger, settings.cycle_config()?, settings.settle());
//!
//! meter.start()?;
//! println!("{} mm", meter.read_last_distance_mm());
//! meter.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod cdev;
pub mod clock;
pub mod config;
pub mod control;
pub mod cycle;
pub mod edge;
pub mod error;
pub mod line;
pub mod mock;
pub mod ranging;
pub mod timer;


pub use clock::{Clock, Instant, MonotonicClock};
pub use config::{Settings, Strategy};
pub use control::{Command, DistanceMeter, parse_period_ms};
pub use cycle::{CycleConfig, CycleScheduler};
pub use edge::{EchoNotifier, EdgeSource, EdgeWait, InterruptSource, PollConfig, PollingSource};
pub use error::{RangingError, Result};
pub use line::{EchoLine, Edge, EdgeEvent, Level, TriggerLine};
pub use ranging::{Calibration, Measurement, Ranger, RangingConfig, RangingState, Reading, SensorHandle};
