//! # Raster-scan compiler backend
//!
//! Pure computation for a two-axis galvo scanning microscope: everything that turns scan
//! parameters into drive waveforms and raw input streams back into images, with no hardware
//! in the loop.
//!
//! ## Modules
//!
//! - [`geometry`]: [`ScanParams`] and the validated [`ScanGeometry`] with its derived sample
//!   counts.
//! - [`waveform`]: compiles a geometry into the `[x, y]` galvo drive signals.
//! - [`reconstruct`]: averages dwell samples and crops padding to recover images.
//! - [`ttl`]: trigger waveforms derived from mask images.
//! - [`instruction`]: single-channel test waveforms (sine, triangle, square, sawtooth).
//! - [`error`]: the [`ScanError`] type shared by all of the above.
//!
//! With the `python` feature the crate also builds a Python extension module of the same name.

pub mod error;
pub mod geometry;
pub mod instruction;
pub mod reconstruct;
pub mod ttl;
pub mod utils;
pub mod waveform;

#[cfg(feature = "python")]
mod python;

pub use error::*;
pub use geometry::*;
pub use instruction::*;
pub use reconstruct::*;
pub use ttl::*;
pub use utils::*;
pub use waveform::*;
