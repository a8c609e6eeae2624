//! Line-oriented sensor producer.
//!
//! Each line from the device is a comma-separated list of values. A line is
//! kept only if it forms a valid JSON array once bracketed; anything else
//! clears the cached reading so the guest never sees stale data.

use eea_core::{Error, LatestReading, Result, SensorConfig};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Turn one raw sensor line into a JSON array string.
pub fn parse_reading(line: &str) -> Result<String> {
    let reading = format!("[{}]", line.trim());
    let value: serde_json::Value = serde_json::from_str(&reading)?;
    if !value.is_array() {
        return Err(Error::Decode(format!("sensor line is not a list: {}", line)));
    }
    Ok(reading)
}

/// Pull lines from `source` into `slot` until it ends or fails.
///
/// Returns `Ok` at end of input. A malformed line clears the slot and ends
/// the pass so the caller can back off.
pub fn read_lines(source: impl BufRead, slot: &LatestReading, running: &AtomicBool) -> Result<()> {
    for line in source.lines() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match parse_reading(&line?) {
            Ok(reading) => slot.replace(reading),
            Err(e) => {
                slot.clear();
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Keep (re)opening the configured device and feeding `slot`.
pub fn run(config: SensorConfig, slot: Arc<LatestReading>, running: Arc<AtomicBool>) {
    info!(path = ?config.path, "Sensor reader started");
    let backoff = Duration::from_millis(config.retry_ms);

    while running.load(Ordering::SeqCst) {
        let result = File::open(&config.path)
            .map_err(Error::from)
            .and_then(|file| read_lines(BufReader::new(file), &slot, &running));

        match result {
            Ok(()) => debug!("Sensor stream ended"),
            Err(e) => warn!("Sensor read failed: {}", e),
        }
        slot.clear();
        std::thread::sleep(backoff);
    }
    info!("Sensor reader stopped");
}
