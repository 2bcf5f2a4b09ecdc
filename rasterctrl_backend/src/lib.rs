//! # Raster-scan control backend
//!
//! Runs galvo raster scans on DAQ hardware: the drive waveforms compiled by
//! [`rastercompiler_backend`] are played on an analog output task while an analog input task,
//! clocked from the output sample clock, records the detector signals sample by sample. The raw
//! input is then reconstructed into one image per input channel.
//!
//! ## Modules
//!
//! - [`hardware`]: the [`DaqDevice`] / [`DaqTask`] traits and the task teardown guard.
//! - [`nidaqmx`]: NI-DAQmx implementation of those traits (feature `nidaqmx`).
//! - [`sim`]: in-memory simulated device.
//! - [`acquisition`]: the synchronized output / input acquisition of one frame.
//! - [`scanner`]: device-owning orchestration, multi-frame scans and delay sweeps.
//! - [`worker`]: continuous scanning on a background thread.
//! - [`config`]: YAML scan configuration.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod scanner;
pub mod sim;
pub mod utils;
pub mod worker;

pub use acquisition::SyncAcquisition;
pub use config::{ScanConfig, TriggerConfig};
pub use error::{AcqResult, AcquisitionError, ConfigError};
pub use hardware::{DaqDevice, DaqTask, TaskError};
pub use scanner::{delay_positions, DelayStage, ImageSink, ScanFrame, ScanRequest, Scanner};
pub use utils::CancelToken;
pub use worker::ScanWorker;
