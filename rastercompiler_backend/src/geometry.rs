//! Implements the scan geometry of a two-axis galvo raster scan. See [`ScanGeometry`] for
//! the derived sample counts.
//!
//! ## Parameters and derived quantities
//!
//! A raster scan is described by a plain parameter struct, [`ScanParams`], which can be
//! deserialized from a configuration file. Validating it with [`ScanGeometry::new`] produces an
//! immutable [`ScanGeometry`], from which every other stage of the pipeline reads its sample
//! counts:
//!
//! - `pixel_samples = max(1, round(dwell_time * sample_rate))`: clock ticks spent on every
//!   (x, y) position.
//! - `total_x = numsteps_x + 2 * padding_steps`: fast-axis positions actually driven. The
//!   padding positions let the mirror settle and are cropped from the final image.
//! - `total_y = numsteps_y`: the slow axis is never padded.
//! - `total_samples = total_x * total_y * pixel_samples`: length of one frame, on every output
//!   and input channel.
//!
//! The derived counts are recomputed from the parameters on every call, so a geometry can never
//! hold counts that disagree with its parameters. A different scan needs a new geometry.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::error::{ScanError, ScanResult};

/// Spacing of the voltage levels along the fast axis.
///
/// With `EndpointExclusive`, `n` levels split `[start, stop)` into `n` equal steps, so the
/// last level sits one step short of `stop` and consecutive sweeps tile without repeating the
/// wrap-around sample. `EndpointInclusive` places the last level exactly on `stop`.
///
/// The slow axis does not wrap within a frame, so its scan lines always include both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSpacing {
    #[default]
    EndpointExclusive,
    EndpointInclusive,
}

impl RowSpacing {
    /// Returns `num` evenly spaced levels running from `start` towards `stop`.
    ///
    /// A single level is always `start`.
    pub fn levels(&self, start: f64, stop: f64, num: usize) -> Array1<f64> {
        match self {
            RowSpacing::EndpointInclusive => Array1::linspace(start, stop, num),
            RowSpacing::EndpointExclusive => {
                let step = (stop - start) / num.max(1) as f64;
                Array1::from_shape_fn(num, |i| start + step * i as f64)
            }
        }
    }
}

/// User-facing raster scan parameters.
///
/// All fields have defaults, so configuration files only need to name the parameters that
/// differ from the rig's usual settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    /// Peak fast-axis amplitude in volts, symmetric about `offset_x`.
    pub amp_x: f64,
    /// Peak slow-axis amplitude in volts, symmetric about `offset_y`.
    pub amp_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    /// Imaged positions along the fast axis.
    pub numsteps_x: usize,
    /// Imaged positions (scan lines) along the slow axis.
    pub numsteps_y: usize,
    /// Settling positions added on both ends of every fast-axis sweep.
    pub padding_steps: usize,
    /// Time in seconds spent on every (x, y) position.
    pub dwell_time: f64,
    /// Output and input sample clock rate in Hz.
    pub sample_rate: f64,
    /// Fast-axis level spacing.
    pub spacing: RowSpacing,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            amp_x: 0.5,
            amp_y: 0.5,
            offset_x: -1.2,
            offset_y: 1.5,
            numsteps_x: 100,
            numsteps_y: 100,
            padding_steps: 100,
            dwell_time: 10e-6,
            sample_rate: 1e6,
            spacing: RowSpacing::EndpointExclusive,
        }
    }
}

/// Validated, immutable geometry of one raster frame.
///
/// # Examples
///
/// ```
/// use rastercompiler_backend::geometry::*;
///
/// let geometry = ScanGeometry::new(ScanParams {
///     numsteps_x: 4,
///     numsteps_y: 2,
///     padding_steps: 0,
///     dwell_time: 1e-6,
///     sample_rate: 1e6,
///     ..ScanParams::default()
/// })
/// .unwrap();
/// assert_eq!(geometry.pixel_samples(), 1);
/// assert_eq!(geometry.total_samples(), 8);
/// ```
///
/// Invalid parameters are rejected before anything else is computed:
///
/// ```
/// # use rastercompiler_backend::geometry::*;
/// let params = ScanParams { sample_rate: 0.0, ..ScanParams::default() };
/// assert!(ScanGeometry::new(params).is_err());
/// ```
#[cfg_attr(feature = "python", pyclass)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanGeometry {
    params: ScanParams,
}

impl ScanGeometry {
    /// Validates `params` and wraps them into a geometry.
    ///
    /// Fails with [`ScanError::InvalidGeometry`] when a step count is zero, the sample rate is
    /// not strictly positive, an amplitude is negative, the dwell time is negative, any
    /// floating-point parameter is not finite, or the frame would not fit in memory.
    pub fn new(params: ScanParams) -> ScanResult<Self> {
        let invalid = |msg: String| Err(ScanError::InvalidGeometry(msg));

        for (name, value) in [
            ("amp_x", params.amp_x),
            ("amp_y", params.amp_y),
            ("offset_x", params.offset_x),
            ("offset_y", params.offset_y),
            ("dwell_time", params.dwell_time),
            ("sample_rate", params.sample_rate),
        ] {
            if !value.is_finite() {
                return invalid(format!("{name} must be finite, got {value}"));
            }
        }
        if params.sample_rate <= 0.0 {
            return invalid(format!(
                "sample_rate must be positive, got {}",
                params.sample_rate
            ));
        }
        if params.numsteps_x < 1 || params.numsteps_y < 1 {
            return invalid(format!(
                "numsteps_x and numsteps_y must be at least 1, got {}x{}",
                params.numsteps_x, params.numsteps_y
            ));
        }
        if params.amp_x < 0.0 || params.amp_y < 0.0 {
            return invalid(format!(
                "amplitudes must be non-negative, got amp_x={} amp_y={}",
                params.amp_x, params.amp_y
            ));
        }
        if params.dwell_time < 0.0 {
            return invalid(format!(
                "dwell_time must be non-negative, got {}",
                params.dwell_time
            ));
        }

        let dwell_ticks = (params.dwell_time * params.sample_rate).round();
        if dwell_ticks > u32::MAX as f64 {
            return invalid(format!(
                "dwell_time {} s at {} Hz gives {} samples per pixel",
                params.dwell_time, params.sample_rate, dwell_ticks
            ));
        }
        let geometry = Self { params };
        if geometry.checked_total_samples().is_none() {
            return invalid(format!(
                "{}x{} positions with {} samples per pixel overflow the sample counter",
                geometry.total_x(),
                geometry.total_y(),
                geometry.pixel_samples()
            ));
        }
        Ok(geometry)
    }

    fn checked_total_samples(&self) -> Option<usize> {
        self.params
            .padding_steps
            .checked_mul(2)?
            .checked_add(self.params.numsteps_x)?
            .checked_mul(self.total_y())?
            .checked_mul(self.pixel_samples())
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }
    pub fn amp_x(&self) -> f64 {
        self.params.amp_x
    }
    pub fn amp_y(&self) -> f64 {
        self.params.amp_y
    }
    pub fn offset_x(&self) -> f64 {
        self.params.offset_x
    }
    pub fn offset_y(&self) -> f64 {
        self.params.offset_y
    }
    pub fn numsteps_x(&self) -> usize {
        self.params.numsteps_x
    }
    pub fn numsteps_y(&self) -> usize {
        self.params.numsteps_y
    }
    pub fn padding_steps(&self) -> usize {
        self.params.padding_steps
    }
    pub fn dwell_time(&self) -> f64 {
        self.params.dwell_time
    }
    pub fn sample_rate(&self) -> f64 {
        self.params.sample_rate
    }
    pub fn spacing(&self) -> RowSpacing {
        self.params.spacing
    }

    /// Clock ticks spent on every (x, y) position, never less than one.
    pub fn pixel_samples(&self) -> usize {
        let ticks = (self.params.dwell_time * self.params.sample_rate).round() as usize;
        ticks.max(1)
    }
    /// Fast-axis positions driven per scan line, padding included.
    pub fn total_x(&self) -> usize {
        self.params.numsteps_x + 2 * self.params.padding_steps
    }
    /// Scan lines per frame.
    pub fn total_y(&self) -> usize {
        self.params.numsteps_y
    }
    /// Samples per channel in one frame.
    pub fn total_samples(&self) -> usize {
        self.total_x() * self.total_y() * self.pixel_samples()
    }
    /// Shape `(rows, columns)` of a reconstructed, cropped image.
    pub fn image_shape(&self) -> (usize, usize) {
        (self.total_y(), self.numsteps_x())
    }
    /// Duration of one frame in seconds.
    pub fn frame_duration(&self) -> f64 {
        self.total_samples() as f64 / self.params.sample_rate
    }
    /// Voltage span swept by the scan as `[x_min, x_max, y_min, y_max]`.
    ///
    /// The first and last scan lines sit exactly on `y_max` and `y_min`. With exclusive
    /// spacing the last fast-axis level stops one step short of `x_max`.
    pub fn voltage_extent(&self) -> [f64; 4] {
        let p = &self.params;
        [
            p.offset_x - p.amp_x,
            p.offset_x + p.amp_x,
            p.offset_y - p.amp_y,
            p.offset_y + p.amp_y,
        ]
    }
}
