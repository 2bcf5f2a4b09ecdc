use std::path::PathBuf;

use rastercompiler_backend::ScanError;
use thiserror::Error;

pub type AcqResult<T> = Result<T, AcquisitionError>;

/// Failures of a hardware acquisition or of the scan orchestration around it.
///
/// By the time any of these reaches the caller, every task created for the failed acquisition
/// has been stopped and released.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionError {
    #[error("Hardware rejected the configuration while {stage}: {msg}")]
    HardwareConfiguration { stage: String, msg: String },
    #[error("{task} task did not finish within {timeout:.3} s")]
    AcquisitionTimeout { task: String, timeout: f64 },
    #[error("Hardware fault while {stage}: {msg}")]
    HardwareFault { stage: String, msg: String },
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Scan was cancelled before the hardware started")]
    Cancelled,
    #[error("Delay stage error: {0}")]
    Stage(String),
    #[error("Invalid delay sweep: {0}")]
    InvalidSweep(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file path {0} does not exist")]
    BadFilePath(PathBuf),
    #[error("Failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
