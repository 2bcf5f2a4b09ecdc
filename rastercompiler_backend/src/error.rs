//! Error type shared by the pure (hardware-free) parts of the scan pipeline.
//!
//! Every variant is fatal to the scan that produced it: geometry, reconstruction and mask
//! problems are detected before (or independently of) any hardware interaction, and retrying
//! with the same inputs can never succeed.

use thiserror::Error;

/// Convenience alias for results of scan compilation and reconstruction.
pub type ScanResult<T> = Result<T, ScanError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanError {
    #[error("Invalid scan geometry: {0}")]
    InvalidGeometry(String),
    #[error(
        "Raw sample count {found} does not match {total_y} rows x {total_x} columns x {pixel_samples} samples per pixel (expected {expected})"
    )]
    ReconstructionShape {
        found: usize,
        expected: usize,
        total_y: usize,
        total_x: usize,
        pixel_samples: usize,
    },
    #[error("Trigger mask does not fit the scan geometry: {0}")]
    MaskDimension(String),
    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),
}
