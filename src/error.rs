use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Power sentinel error: {0}")]
    Power(#[from] PowerError),

    #[error("GPS error: {0}")]
    Gps(#[from] GpsError),

    #[error("System error: {message}")]
    System { message: String },
}

impl SentinelError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

/// Errors raised by the capture pipeline manager.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to build pipeline: {details}")]
    Build { details: String },

    #[error("Failed to start pipeline: {details}")]
    Start { details: String },

    #[error("Operation not valid in pipeline state {state}")]
    InvalidState { state: &'static str },
}

/// Errors raised by the power-loss sentinel.
#[derive(Error, Debug)]
pub enum PowerError {
    #[error("Failed to set up power line: {details}")]
    LineSetup { details: String },

    #[error("Failed to read power line: {details}")]
    LineRead { details: String },

    #[error("Power-off command failed: {details}")]
    PowerOff { details: String },
}

/// Errors raised by GPS acquisition. Any of these triggers the permanent
/// fallback to the simulated source; they never crash the process.
#[derive(Error, Debug)]
pub enum GpsError {
    #[error("Failed to open GPS device {device}: {details}")]
    DeviceOpen { device: String, details: String },

    #[error("GPS read failed: {details}")]
    Read { details: String },
}

pub type Result<T> = std::result::Result<T, SentinelError>;
