use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// One GPS observation. Only the latest sample is live; newer samples
/// overwrite older ones atomically and consumers always receive a full copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    /// Whether the receiver reported a valid fix for this sample
    pub fix: bool,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(latitude: f64, longitude: f64, speed_kmh: f64, fix: bool) -> Self {
        Self {
            latitude,
            longitude,
            speed_kmh,
            fix,
            timestamp: Utc::now(),
        }
    }

    /// Sample published before the first acquisition succeeds.
    pub fn no_fix() -> Self {
        Self::new(0.0, 0.0, 0.0, false)
    }
}

/// Thread-safe holder of the latest telemetry sample.
///
/// The GPS monitor is the only writer; any number of readers may call
/// [`read`](TelemetryStore::read) concurrently. The whole sample is swapped
/// under the lock and reads copy out, so a reader sees either the old or the
/// new sample in full, never a mix of fields from two writes.
pub struct TelemetryStore {
    current: RwLock<TelemetrySample>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(TelemetrySample::no_fix()),
        }
    }

    /// Replace the live sample. Single-writer by contract.
    pub fn update(&self, sample: TelemetrySample) {
        *self.current.write() = sample;
    }

    /// Copy out the latest sample.
    pub fn read(&self) -> TelemetrySample {
        self.current.read().clone()
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}
