pub mod config;
pub mod error;
pub mod telemetry;
pub mod gps;
pub mod geofence;
pub mod power;
pub mod preview;
pub mod evidence;
pub mod pipeline;
pub mod status;
pub mod thermal;
pub mod orchestrator;

#[cfg(feature = "web")]
pub mod web;

pub use config::SentinelConfig;
pub use error::{GpsError, PipelineError, PowerError, Result, SentinelError};
pub use geofence::{GeofenceEvaluator, ScheduleWindow, Zone, ZoneMatch};
pub use gps::{GpsMonitor, GpsSource, SerialGpsSource, SimulatedGpsSource};
pub use orchestrator::{SentinelOrchestrator, ShutdownReason};
pub use pipeline::{CapturePipeline, PipelineConfig, PipelineEvent, PipelineState};
pub use power::{
    DebounceState, GpioPowerLine, LogOnlyPowerOff, PowerLine, PowerSentinel, SentinelOutcome,
    ShutdownAction, SignalLevel, SystemPowerOff,
};
pub use preview::{PreviewFrame, PreviewSlot};
pub use status::{StatusQuery, StatusReport};
pub use telemetry::{TelemetrySample, TelemetryStore};
pub use thermal::{FanControl, ThermalMonitor};

#[cfg(feature = "web")]
pub use web::WebServer;
