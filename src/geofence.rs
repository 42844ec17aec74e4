use crate::config::{ScheduleConfig, ZoneConfig};
use crate::telemetry::TelemetrySample;
use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use config::ConfigError;
use serde::Serialize;
use tracing::{debug, info};

/// A named enforcement polygon. Vertices are (latitude, longitude) pairs in
/// order; the ring is implicitly closed. Immutable after load.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    pub polygon: Vec<(f64, f64)>,
}

impl Zone {
    /// Point-in-polygon containment via the even-odd ray-casting rule.
    ///
    /// Boundary convention (half-open): a point exactly on the zone's
    /// minimum-latitude or minimum-longitude edge counts as inside, a point
    /// on the maximum-latitude or maximum-longitude edge counts as outside.
    /// Adjacent zones sharing an edge therefore never both claim a point.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        let ring = &self.polygon;
        let n = ring.len();
        if n < 3 {
            return false;
        }

        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (lat_i, lon_i) = ring[i];
            let (lat_j, lon_j) = ring[j];
            if (lat_i > latitude) != (lat_j > latitude) {
                let lon_cross =
                    (lon_j - lon_i) * (latitude - lat_i) / (lat_j - lat_i) + lon_i;
                if longitude < lon_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Time window gating zone enforcement. Applied globally to all zones.
#[derive(Debug, Clone)]
pub struct ScheduleWindow {
    pub weekdays: Vec<Weekday>,
    pub start: NaiveTime,
    /// Exclusive end of the window
    pub end: NaiveTime,
}

impl ScheduleWindow {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ConfigError> {
        let mut weekdays = Vec::with_capacity(config.weekdays.len());
        for day in &config.weekdays {
            let parsed: Weekday = day.parse().map_err(|_| {
                ConfigError::Message(format!("Unrecognized schedule weekday '{}'", day))
            })?;
            if !weekdays.contains(&parsed) {
                weekdays.push(parsed);
            }
        }

        let start = parse_time(&config.start)?;
        let end = parse_time(&config.end)?;
        if start >= end {
            return Err(ConfigError::Message(format!(
                "Schedule start {} must be before end {}",
                config.start, config.end
            )));
        }

        Ok(Self {
            weekdays,
            start,
            end,
        })
    }

    /// Whether `now` falls on an active weekday within [start, end).
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        if !self.weekdays.contains(&now.weekday()) {
            return false;
        }
        let time = now.time();
        time >= self.start && time < self.end
    }
}

fn parse_time(text: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .map_err(|_| ConfigError::Message(format!("Invalid schedule time '{}'", text)))
}

/// Result of a geofence check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneMatch {
    pub matched: bool,
    pub zone_name: Option<String>,
}

impl ZoneMatch {
    fn none() -> Self {
        Self {
            matched: false,
            zone_name: None,
        }
    }

    fn zone(name: &str) -> Self {
        Self {
            matched: true,
            zone_name: Some(name.to_string()),
        }
    }
}

/// Evaluates telemetry samples against the loaded zones, gated by the
/// schedule window. Stateless between calls: the gate is re-evaluated on
/// every check, never cached.
pub struct GeofenceEvaluator {
    zones: Vec<Zone>,
    window: ScheduleWindow,
}

impl GeofenceEvaluator {
    pub fn new(zones: Vec<Zone>, window: ScheduleWindow) -> Self {
        info!(
            "Geofence evaluator loaded {} zone(s), window {}-{}",
            zones.len(),
            window.start,
            window.end
        );
        Self { zones, window }
    }

    pub fn from_config(
        zones: &[ZoneConfig],
        schedule: &ScheduleConfig,
    ) -> Result<Self, ConfigError> {
        let window = ScheduleWindow::from_config(schedule)?;
        let zones = zones
            .iter()
            .map(|z| Zone {
                name: z.name.clone(),
                polygon: z.polygon.iter().map(|v| (v[0], v[1])).collect(),
            })
            .collect();
        Ok(Self::new(zones, window))
    }

    /// Check a sample against the zones at the current wall-clock time.
    pub fn check(&self, sample: &TelemetrySample) -> ZoneMatch {
        self.check_at(sample, Local::now().naive_local())
    }

    /// Check with an explicit clock. The schedule gate short-circuits before
    /// any geometry is evaluated; zones are tested in load order and the
    /// first containing zone wins.
    pub fn check_at(&self, sample: &TelemetrySample, now: NaiveDateTime) -> ZoneMatch {
        if !self.window.contains(now) {
            return ZoneMatch::none();
        }

        for zone in &self.zones {
            if zone.contains(sample.latitude, sample.longitude) {
                debug!(
                    "Sample ({:.5}, {:.5}) inside zone '{}'",
                    sample.latitude, sample.longitude, zone.name
                );
                return ZoneMatch::zone(&zone.name);
            }
        }

        ZoneMatch::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn mock_zone() -> Zone {
        Zone {
            name: "Mock Elementary".to_string(),
            polygon: vec![
                (49.199, -123.001),
                (49.199, -122.999),
                (49.201, -122.999),
                (49.201, -123.001),
            ],
        }
    }

    fn school_window() -> ScheduleWindow {
        ScheduleWindow::from_config(&ScheduleConfig::default()).unwrap()
    }

    fn evaluator() -> GeofenceEvaluator {
        GeofenceEvaluator::new(vec![mock_zone()], school_window())
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn sample(lat: f64, lon: f64) -> TelemetrySample {
        TelemetrySample::new(lat, lon, 30.0, true)
    }

    #[test]
    fn test_inside_zone_during_school_hours() {
        // 2024-06-04 is a Tuesday
        let result = evaluator().check_at(&sample(49.2, -123.0), at(2024, 6, 4, 9, 0));
        assert!(result.matched);
        assert_eq!(result.zone_name.as_deref(), Some("Mock Elementary"));
    }

    #[test]
    fn test_gate_closed_at_night_regardless_of_position() {
        let result = evaluator().check_at(&sample(49.2, -123.0), at(2024, 6, 4, 22, 0));
        assert_eq!(result, ZoneMatch::none());
    }

    #[test]
    fn test_gate_closed_on_weekend() {
        // 2024-06-08 is a Saturday
        let result = evaluator().check_at(&sample(49.2, -123.0), at(2024, 6, 8, 9, 0));
        assert_eq!(result, ZoneMatch::none());
    }

    #[test]
    fn test_outside_all_zones() {
        let result = evaluator().check_at(&sample(49.5, -123.5), at(2024, 6, 4, 9, 0));
        assert_eq!(result, ZoneMatch::none());
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let result = evaluator().check_at(&sample(49.2, -123.0), at(2024, 6, 4, 17, 0));
        assert_eq!(result, ZoneMatch::none());

        let result = evaluator().check_at(&sample(49.2, -123.0), at(2024, 6, 4, 16, 59));
        assert!(result.matched);
    }

    #[test]
    fn test_window_start_is_inclusive() {
        let result = evaluator().check_at(&sample(49.2, -123.0), at(2024, 6, 4, 8, 0));
        assert!(result.matched);
    }

    #[test]
    fn test_boundary_convention_is_half_open() {
        let zone = mock_zone();

        // Minimum-latitude (south) and minimum-longitude (west) edges: inside
        assert!(zone.contains(49.199, -123.0));
        assert!(zone.contains(49.2, -123.001));

        // Maximum-latitude (north) and maximum-longitude (east) edges: outside
        assert!(!zone.contains(49.201, -123.0));
        assert!(!zone.contains(49.2, -122.999));
    }

    #[test]
    fn test_first_matching_zone_wins_in_load_order() {
        let overlapping = Zone {
            name: "Overlap".to_string(),
            polygon: mock_zone().polygon,
        };
        let eval = GeofenceEvaluator::new(vec![mock_zone(), overlapping], school_window());
        let result = eval.check_at(&sample(49.2, -123.0), at(2024, 6, 4, 9, 0));
        assert_eq!(result.zone_name.as_deref(), Some("Mock Elementary"));
    }

    #[test]
    fn test_degenerate_polygon_never_matches() {
        let zone = Zone {
            name: "Line".to_string(),
            polygon: vec![(49.0, -123.0), (49.1, -123.0)],
        };
        assert!(!zone.contains(49.05, -123.0));
    }

    #[test]
    fn test_weekday_parsing() {
        let mut config = ScheduleConfig::default();
        config.weekdays = vec!["monday".to_string(), "tue".to_string()];
        let window = ScheduleWindow::from_config(&config).unwrap();
        assert_eq!(window.weekdays, vec![Weekday::Mon, Weekday::Tue]);

        config.weekdays = vec!["noday".to_string()];
        assert!(ScheduleWindow::from_config(&config).is_err());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let mut config = ScheduleConfig::default();
        config.start = "17:00".to_string();
        config.end = "08:00".to_string();
        assert!(ScheduleWindow::from_config(&config).is_err());
    }
}
