use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SentinelConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default = "default_zones")]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub thermal: ThermalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Capture width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Capture height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Frames per second
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// H.264 encoder bitrate in bits per second
    #[serde(default = "default_bitrate")]
    pub encoding_bitrate: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    /// Directory where evidence segments are written
    #[serde(default = "default_recording_dir")]
    pub directory: String,

    /// Segment rotation period in seconds
    #[serde(default = "default_chunk_seconds")]
    pub chunk_seconds: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PowerConfig {
    /// BCM pin number carrying the UPS power-loss signal
    #[serde(default = "default_power_pin")]
    pub gpio_pin: u32,

    /// Electrical convention: when true, a low line level means power absent.
    /// The UPS HAT polarity is not verified against hardware documentation,
    /// so it is configurable rather than hardcoded.
    #[serde(default = "default_active_low")]
    pub active_low: bool,

    /// Consecutive "power absent" readings required before shutdown
    #[serde(default = "default_debounce_threshold")]
    pub debounce_threshold: u32,

    /// Grace period between commit and power-off, in seconds
    #[serde(default = "default_shutdown_delay")]
    pub shutdown_delay_seconds: u64,

    /// Seconds between line reads
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Log the power-off instead of executing it (dev/test)
    #[serde(default = "default_simulate_poweroff")]
    pub simulate_poweroff: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpsConfig {
    /// Serial device delivering NMEA sentences
    #[serde(default = "default_gps_device")]
    pub device: String,

    /// Baud rate the receiver is expected to be configured for
    #[serde(default = "default_gps_baud")]
    pub baud_rate: u32,

    /// Skip the hardware receiver and run the simulation generator
    #[serde(default)]
    pub force_simulation: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    /// Active weekdays, lowercase English names ("mon".."sun" or full names)
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<String>,

    /// Start of the enforcement window, "HH:MM"
    #[serde(default = "default_schedule_start")]
    pub start: String,

    /// End of the enforcement window, "HH:MM" (exclusive)
    #[serde(default = "default_schedule_end")]
    pub end: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ZoneConfig {
    pub name: String,
    /// Ordered (latitude, longitude) vertices, implicitly closed
    pub polygon: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    /// IP address to bind to
    #[serde(default = "default_stream_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_stream_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ThermalConfig {
    /// Sysfs file exposing the CPU temperature in millidegrees
    #[serde(default = "default_thermal_zone")]
    pub sensor_path: String,

    /// Sysfs PWM file the fan duty is written to
    #[serde(default = "default_fan_path")]
    pub fan_path: String,

    /// Seconds between temperature reads
    #[serde(default = "default_thermal_interval")]
    pub poll_interval_seconds: u64,
}

impl SentinelConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("maplecam.toml")
    }

    /// Load configuration from a specific file path. The file is optional;
    /// missing sections fall back to defaults, then `MAPLECAM_` environment
    /// variables are applied on top.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("MAPLECAM").separator("_"))
            .build()?;

        let config: SentinelConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values. Construction errors are fatal to
    /// startup, so every range check lives here rather than in the
    /// components.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Message(
                "Camera dimensions must be greater than 0".to_string(),
            ));
        }

        if self.camera.framerate == 0 {
            return Err(ConfigError::Message(
                "Camera framerate must be greater than 0".to_string(),
            ));
        }

        if self.camera.encoding_bitrate == 0 {
            return Err(ConfigError::Message(
                "Encoding bitrate must be greater than 0".to_string(),
            ));
        }

        if self.recording.directory.is_empty() {
            return Err(ConfigError::Message(
                "Recording directory must not be empty".to_string(),
            ));
        }

        if self.recording.chunk_seconds == 0 {
            return Err(ConfigError::Message(
                "Recording chunk_seconds must be greater than 0".to_string(),
            ));
        }

        if self.power.debounce_threshold == 0 {
            return Err(ConfigError::Message(
                "Power debounce_threshold must be greater than 0".to_string(),
            ));
        }

        if self.power.poll_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Power poll_interval_seconds must be greater than 0".to_string(),
            ));
        }

        for zone in &self.zones {
            if zone.polygon.len() < 3 {
                return Err(ConfigError::Message(format!(
                    "Zone '{}' needs at least 3 polygon vertices",
                    zone.name
                )));
            }
        }

        // Schedule strings must parse; the conversion is shared with the
        // geofence evaluator so the same rules apply at runtime.
        crate::geofence::ScheduleWindow::from_config(&self.schedule)?;

        Ok(())
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            recording: RecordingConfig::default(),
            power: PowerConfig::default(),
            gps: GpsConfig::default(),
            schedule: ScheduleConfig::default(),
            zones: default_zones(),
            stream: StreamConfig::default(),
            thermal: ThermalConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            encoding_bitrate: default_bitrate(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: default_recording_dir(),
            chunk_seconds: default_chunk_seconds(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            gpio_pin: default_power_pin(),
            active_low: default_active_low(),
            debounce_threshold: default_debounce_threshold(),
            shutdown_delay_seconds: default_shutdown_delay(),
            poll_interval_seconds: default_poll_interval(),
            simulate_poweroff: default_simulate_poweroff(),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            device: default_gps_device(),
            baud_rate: default_gps_baud(),
            force_simulation: false,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            weekdays: default_weekdays(),
            start: default_schedule_start(),
            end: default_schedule_end(),
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        default_zones().remove(0)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ip: default_stream_ip(),
            port: default_stream_port(),
        }
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            sensor_path: default_thermal_zone(),
            fan_path: default_fan_path(),
            poll_interval_seconds: default_thermal_interval(),
        }
    }
}

// Default value functions
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_framerate() -> u32 {
    30
}
fn default_bitrate() -> u32 {
    4_000_000
}

fn default_recording_dir() -> String {
    "./recordings".to_string()
}
fn default_chunk_seconds() -> u32 {
    60
}

fn default_power_pin() -> u32 {
    6
}
fn default_active_low() -> bool {
    true
}
fn default_debounce_threshold() -> u32 {
    3
}
fn default_shutdown_delay() -> u64 {
    5
}
fn default_poll_interval() -> u64 {
    1
}
fn default_simulate_poweroff() -> bool {
    true
}

fn default_gps_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_gps_baud() -> u32 {
    9600
}

fn default_weekdays() -> Vec<String> {
    vec!["mon", "tue", "wed", "thu", "fri"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_schedule_start() -> String {
    "08:00".to_string()
}
fn default_schedule_end() -> String {
    "17:00".to_string()
}

fn default_zones() -> Vec<ZoneConfig> {
    // Placeholder enforcement area until real zone data is loaded.
    vec![ZoneConfig {
        name: "Mock Elementary".to_string(),
        polygon: vec![
            [49.199, -123.001],
            [49.199, -122.999],
            [49.201, -122.999],
            [49.201, -123.001],
        ],
    }]
}

fn default_stream_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_stream_port() -> u16 {
    5000
}

fn default_thermal_zone() -> String {
    "/sys/class/thermal/thermal_zone0/temp".to_string()
}
fn default_fan_path() -> String {
    "/sys/class/hwmon/hwmon0/pwm1".to_string()
}
fn default_thermal_interval() -> u64 {
    2
}
