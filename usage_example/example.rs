use hcsr04_ranging::{DistanceMeter, MonotonicClock, Ranger, Reading, Settings, cdev};
use std::{thread::sleep, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const READINGS: usize = 50;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // optional TOML path as the first argument; HCSR04_* env vars override
    let path = std::env::args().nth(1);
    let settings = Settings::load(path.as_deref())?;

    let handle = cdev::open_sensor(&settings)?;
    let ranger = Ranger::new(handle, MonotonicClock, settings.ranging_config()?)?;
    let meter = DistanceMeter::new(ranger, settings.cycle_config()?, settings.settle());

    match meter.measure_now() {
        Ok(m) => info!("One-shot: {} mm ({:?} echo)", m.distance_mm(), m.pulse_width()),
        Err(e) => warn!("One-shot measurement failed: {}", e),
    }

    meter.start()?;
    for _ in 0..READINGS {
        sleep(meter.cycle_period().max(Duration::from_millis(200)));
        match meter.last_reading() {
            Reading::Ready(m) => println!("Distance: {:4}mm", m.distance_mm()),
            Reading::Failed(e) => error!("Last cycle failed: {}", e),
            Reading::Empty => println!("Distance: ----"),
        }
    }
    meter.stop()?;
    Ok(())
}
