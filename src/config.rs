//! Settings for a deployed sensor, from TOML plus `HCSR04_*` environment overrides.

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::{error, info};

use crate::control::DEFAULT_SETTLE;
use crate::cycle::{CycleConfig, DEFAULT_FLOOR, DEFAULT_PERIOD};
use crate::edge::PollConfig;
use crate::edge::poll::DEFAULT_TICK;
use crate::error::{RangingError, Result};
use crate::ranging::{
    Calibration, DATASHEET_NS_PER_MM, DEFAULT_FALLING_TIMEOUT, DEFAULT_RISING_TIMEOUT,
    DEFAULT_TRIGGER_PULSE, RangingConfig,
};

const ENV_PREFIX: &str = "HCSR04";

/// How echo edges are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Kernel-stamped line events.
    #[default]
    Interrupt,
    /// Busy-wait sampling of the echo level.
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chip: String,
    pub trigger_line: u32,
    pub echo_line: u32,
    pub strategy: Strategy,
    /// Echo nanoseconds per millimetre. 5400 per datasheet; calibrate per unit.
    pub ns_per_mm: u32,
    pub trigger_pulse_us: u64,
    pub rising_timeout_ms: u64,
    pub falling_timeout_ms: u64,
    /// Scheduler tick used to count polling deadlines.
    pub poll_tick_us: u64,
    /// 0 measures once per start.
    pub cycle_period_ms: u64,
    pub min_cycle_period_ms: u64,
    pub settle_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            chip: "/dev/gpiochip4".to_string(),
            trigger_line: 21,
            echo_line: 20,
            strategy: Strategy::default(),
            ns_per_mm: DATASHEET_NS_PER_MM,
            trigger_pulse_us: DEFAULT_TRIGGER_PULSE.as_micros() as u64,
            rising_timeout_ms: DEFAULT_RISING_TIMEOUT.as_millis() as u64,
            falling_timeout_ms: DEFAULT_FALLING_TIMEOUT.as_millis() as u64,
            poll_tick_us: DEFAULT_TICK.as_micros() as u64,
            cycle_period_ms: DEFAULT_PERIOD.as_millis() as u64,
            min_cycle_period_ms: DEFAULT_FLOOR.as_millis() as u64,
            settle_ms: DEFAULT_SETTLE.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Settings> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading sensor settings from {}", path);
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(true));
        }
        let built = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build();
        Self::deserialize_from(built)
    }

    pub fn from_toml_str(toml: &str) -> Result<Settings> {
        let built = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build();
        Self::deserialize_from(built)
    }

    fn deserialize_from(built: std::result::Result<Config, config::ConfigError>) -> Result<Settings> {
        let settings = built
            .and_then(|config| config.try_deserialize::<Settings>())
            .map_err(|e| {
                error!("Failed to load sensor settings: {}", e);
                RangingError::invalid(e.to_string())
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every derived configuration without building anything.
    pub fn validate(&self) -> Result<()> {
        self.ranging_config()?;
        self.cycle_config()?;
        self.poll_config()?;
        if self.trigger_line == self.echo_line {
            return Err(RangingError::invalid(format!(
                "trigger and echo share line {}",
                self.trigger_line
            )));
        }
        Ok(())
    }

    pub fn ranging_config(&self) -> Result<RangingConfig> {
        let config = RangingConfig {
            calibration: Calibration::new(self.ns_per_mm)?,
            trigger_pulse: Duration::from_micros(self.trigger_pulse_us),
            rising_timeout: Duration::from_millis(self.rising_timeout_ms),
            falling_timeout: Duration::from_millis(self.falling_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn cycle_config(&self) -> Result<CycleConfig> {
        CycleConfig::new(
            Duration::from_millis(self.cycle_period_ms),
            Duration::from_millis(self.min_cycle_period_ms),
        )
    }

    pub fn poll_config(&self) -> Result<PollConfig> {
        PollConfig::new(Duration::from_micros(self.poll_tick_us))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
