use crate::config::GpsConfig;
use crate::error::GpsError;
use crate::telemetry::{TelemetrySample, TelemetryStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

const KNOTS_TO_KMH: f64 = 1.852;

/// Capability interface for location acquisition. Two implementations:
/// the serial NMEA receiver and the deterministic simulation generator.
#[async_trait]
pub trait GpsSource: Send {
    /// Produce the next valid sample. Blocks until one is available.
    /// An `Err` means the source itself has failed (device gone, read
    /// error); individual malformed sentences are skipped internally and
    /// never surface here.
    async fn next_sample(&mut self) -> Result<TelemetrySample, GpsError>;

    /// Release the underlying device handle, if any.
    async fn release(&mut self) {}
}

/// Reads RMC sentences from a serial NMEA receiver.
///
/// Only the RMC fields the core consumes are parsed (status, position,
/// ground speed); full NMEA grammar is out of scope. The line discipline
/// (baud rate) is expected to be configured on the device beforehand.
pub struct SerialGpsSource {
    device: String,
    baud_rate: u32,
    lines: Option<Lines<BufReader<File>>>,
}

impl SerialGpsSource {
    pub fn new(config: &GpsConfig) -> Self {
        Self {
            device: config.device.clone(),
            baud_rate: config.baud_rate,
            lines: None,
        }
    }

    async fn ensure_open(&mut self) -> Result<(), GpsError> {
        if self.lines.is_none() {
            let file = File::open(&self.device)
                .await
                .map_err(|e| GpsError::DeviceOpen {
                    device: self.device.clone(),
                    details: e.to_string(),
                })?;
            info!(
                "GPS receiver opened on {} (line configured for {} baud)",
                self.device, self.baud_rate
            );
            self.lines = Some(BufReader::new(file).lines());
        }
        Ok(())
    }
}

#[async_trait]
impl GpsSource for SerialGpsSource {
    async fn next_sample(&mut self) -> Result<TelemetrySample, GpsError> {
        self.ensure_open().await?;
        let lines = self.lines.as_mut().expect("opened above");

        loop {
            let line = lines.next_line().await.map_err(|e| GpsError::Read {
                details: e.to_string(),
            })?;
            let line = line.ok_or_else(|| GpsError::Read {
                details: "receiver stream ended".to_string(),
            })?;
            let line = line.trim();

            if !(line.starts_with("$GPRMC") || line.starts_with("$GNRMC")) {
                continue;
            }

            // Malformed sentences are dropped without disturbing the last
            // valid sample (last-known-good policy).
            match parse_rmc(line) {
                Some(sample) => return Ok(sample),
                None => trace!("Discarding malformed RMC sentence"),
            }
        }
    }

    async fn release(&mut self) {
        self.lines = None;
        debug!("GPS receiver on {} released", self.device);
    }
}

/// Parse the subset of an RMC sentence the core consumes.
///
/// Field layout: `$xxRMC,time,status,lat,N/S,lon,E/W,speed_knots,track,date,...`
/// Returns `None` for anything structurally invalid. A sentence with void
/// status (`V`) but parseable coordinates still yields a sample with
/// `fix == false`, matching what the receiver reports while searching.
pub fn parse_rmc(sentence: &str) -> Option<TelemetrySample> {
    let body = sentence.split('*').next()?;
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 8 {
        return None;
    }

    let fix = match fields[2] {
        "A" => true,
        "V" => false,
        _ => return None,
    };

    let latitude = parse_coordinate(fields[3], fields[4], 2)?;
    let longitude = parse_coordinate(fields[5], fields[6], 3)?;
    let speed_kmh = if fields[7].is_empty() {
        0.0
    } else {
        fields[7].parse::<f64>().ok()? * KNOTS_TO_KMH
    };

    Some(TelemetrySample::new(latitude, longitude, speed_kmh, fix))
}

/// Convert NMEA ddmm.mmmm / dddmm.mmmm plus hemisphere into signed degrees.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = value[..degree_digits].parse().ok()?;
    let minutes: f64 = value[degree_digits..].parse().ok()?;
    let magnitude = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(magnitude),
        "S" | "W" => Some(-magnitude),
        _ => None,
    }
}

/// Deterministic stand-in for the hardware receiver: advances latitude
/// north at a fixed step once per second with longitude held, synthesizing
/// a plausible urban speed, so downstream consumers always have a varying
/// value to exercise.
pub struct SimulatedGpsSource {
    latitude: f64,
    longitude: f64,
    tick: u64,
    interval: Duration,
}

impl SimulatedGpsSource {
    const START_LATITUDE: f64 = 49.198;
    const START_LONGITUDE: f64 = -123.000;
    const LATITUDE_STEP: f64 = 0.0001;

    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            latitude: Self::START_LATITUDE,
            longitude: Self::START_LONGITUDE,
            tick: 0,
            interval,
        }
    }
}

impl Default for SimulatedGpsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpsSource for SimulatedGpsSource {
    async fn next_sample(&mut self) -> Result<TelemetrySample, GpsError> {
        sleep(self.interval).await;
        self.latitude += Self::LATITUDE_STEP;
        self.tick += 1;
        // 32..48 km/h, deterministic
        let speed_kmh = 40.0 + 8.0 * (self.tick as f64 * 0.7).sin();
        Ok(TelemetrySample::new(
            self.latitude,
            self.longitude,
            speed_kmh,
            true,
        ))
    }
}

/// Acquisition loop: pumps samples from the active source into the store.
///
/// On any source failure it falls back permanently to the simulation
/// generator; it never fails the process.
pub struct GpsMonitor {
    store: Arc<TelemetryStore>,
    source: Box<dyn GpsSource>,
    fallen_back: bool,
}

impl GpsMonitor {
    pub fn new(config: &GpsConfig, store: Arc<TelemetryStore>) -> Self {
        let (source, fallen_back): (Box<dyn GpsSource>, bool) = if config.force_simulation {
            info!("GPS simulation mode forced by configuration");
            (Box::new(SimulatedGpsSource::new()), true)
        } else {
            (Box::new(SerialGpsSource::new(config)), false)
        };
        Self {
            store,
            source,
            fallen_back,
        }
    }

    /// Inject a specific source (tests, alternate hardware).
    pub fn with_source(store: Arc<TelemetryStore>, source: Box<dyn GpsSource>) -> Self {
        Self {
            store,
            source,
            fallen_back: false,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("GPS monitor started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                result = self.source.next_sample() => result,
                _ = cancel.cancelled() => break,
            };

            match result {
                Ok(sample) => {
                    trace!(
                        "Telemetry update: ({:.5}, {:.5}) {:.1} km/h fix={}",
                        sample.latitude,
                        sample.longitude,
                        sample.speed_kmh,
                        sample.fix
                    );
                    self.store.update(sample);
                }
                Err(e) if !self.fallen_back => {
                    error!("GPS acquisition failed: {}; falling back to simulation", e);
                    self.source.release().await;
                    self.source = Box::new(SimulatedGpsSource::new());
                    self.fallen_back = true;
                }
                Err(e) => {
                    // The simulation never fails; guard anyway.
                    error!("GPS source error after fallback: {}", e);
                    break;
                }
            }
        }

        self.source.release().await;
        info!("GPS monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rmc_with_fix() {
        let sentence =
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        let sample = parse_rmc(sentence).unwrap();
        assert!(sample.fix);
        assert!((sample.latitude - 48.1173).abs() < 1e-4);
        assert!((sample.longitude - 11.5166).abs() < 1e-4);
        assert!((sample.speed_kmh - 22.4 * KNOTS_TO_KMH).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rmc_southern_western_hemispheres() {
        let sentence = "$GNRMC,123519,A,4912.000,S,12300.060,W,010.0,084.4,230394,,*00";
        let sample = parse_rmc(sentence).unwrap();
        assert!((sample.latitude + 49.2).abs() < 1e-6);
        assert!((sample.longitude + 123.001).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rmc_void_status_keeps_position_without_fix() {
        let sentence = "$GPRMC,123519,V,4807.038,N,01131.000,E,000.0,084.4,230394,,*6A";
        let sample = parse_rmc(sentence).unwrap();
        assert!(!sample.fix);
    }

    #[test]
    fn test_parse_rmc_rejects_malformed() {
        assert!(parse_rmc("$GPRMC,garbage").is_none());
        assert!(parse_rmc("$GPRMC,123519,X,4807.038,N,01131.000,E,0,0,230394").is_none());
        assert!(parse_rmc("$GPRMC,123519,A,xx07.038,N,01131.000,E,0,0,230394").is_none());
        assert!(parse_rmc("$GPRMC,123519,A,4807.038,Q,01131.000,E,0,0,230394").is_none());
        assert!(parse_rmc("").is_none());
    }

    #[test]
    fn test_parse_rmc_empty_speed_defaults_to_zero() {
        let sentence = "$GPRMC,123519,A,4807.038,N,01131.000,E,,084.4,230394,,*6A";
        let sample = parse_rmc(sentence).unwrap();
        assert_eq!(sample.speed_kmh, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_advances_latitude_monotonically() {
        let mut sim = SimulatedGpsSource::new();
        let first = sim.next_sample().await.unwrap();
        let second = sim.next_sample().await.unwrap();
        let third = sim.next_sample().await.unwrap();

        assert!(second.latitude > first.latitude);
        assert!(third.latitude > second.latitude);
        assert_eq!(first.longitude, second.longitude);
        assert!(first.fix);
        assert!(first.speed_kmh > 30.0 && first.speed_kmh < 50.0);
    }

    #[test]
    fn test_serial_source_carries_configured_baud_rate() {
        let config = GpsConfig {
            baud_rate: 4800,
            ..GpsConfig::default()
        };
        let source = SerialGpsSource::new(&config);
        assert_eq!(source.baud_rate, 4800);
        assert_eq!(source.device, config.device);
    }

    /// Always fails, standing in for an unplugged receiver.
    struct FailingSource;

    #[async_trait]
    impl GpsSource for FailingSource {
        async fn next_sample(&mut self) -> Result<TelemetrySample, GpsError> {
            Err(GpsError::Read {
                details: "device unplugged".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_falls_back_to_simulation_on_source_failure() {
        let store = Arc::new(TelemetryStore::new());
        let monitor = GpsMonitor::with_source(Arc::clone(&store), Box::new(FailingSource));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor.run(cancel.clone()));

        // Give the fallback simulation time to publish a few samples.
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();

        let sample = store.read();
        assert!(sample.fix);
        assert!(sample.latitude > SimulatedGpsSource::START_LATITUDE);
        assert_eq!(sample.longitude, SimulatedGpsSource::START_LONGITUDE);
    }

    #[tokio::test]
    async fn test_monitor_cancellation_stops_loop() {
        let store = Arc::new(TelemetryStore::new());
        let monitor =
            GpsMonitor::with_source(Arc::clone(&store), Box::new(SimulatedGpsSource::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Returns promptly despite the source's 1s tick.
        monitor.run(cancel).await;
        assert!(!store.read().fix);
    }
}
