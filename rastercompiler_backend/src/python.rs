//! Python bindings for the scan GUI, built with the `python` feature.
//!
//! The bindings only wrap the pure computation of this crate: geometry, waveform compilation,
//! trigger masks and reconstruction. Arrays cross the boundary as numpy arrays.
//!
//! ```python
//! from rastercompiler_backend import ScanGeometry, raster_waveform, reconstruct
//!
//! geometry = ScanGeometry(numsteps_x=64, numsteps_y=64, padding_steps=8)
//! waveform = raster_waveform(geometry)          # shape (2, geometry.total_samples)
//! images = reconstruct(raw, geometry)           # raw: (n_channels, geometry.total_samples)
//! ```

use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::error::ScanError;
use crate::geometry::{RowSpacing, ScanGeometry, ScanParams};
use crate::instruction::{sample_instruction, Instruction};

impl From<ScanError> for PyErr {
    fn from(err: ScanError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

#[pymethods]
impl ScanGeometry {
    #[new]
    #[pyo3(signature = (
        amp_x = 0.5,
        amp_y = 0.5,
        offset_x = -1.2,
        offset_y = 1.5,
        numsteps_x = 100,
        numsteps_y = 100,
        padding_steps = 100,
        dwell_time = 10e-6,
        sample_rate = 1e6,
        endpoint_inclusive = false
    ))]
    #[allow(clippy::too_many_arguments)]
    fn py_new(
        amp_x: f64,
        amp_y: f64,
        offset_x: f64,
        offset_y: f64,
        numsteps_x: usize,
        numsteps_y: usize,
        padding_steps: usize,
        dwell_time: f64,
        sample_rate: f64,
        endpoint_inclusive: bool,
    ) -> PyResult<Self> {
        let spacing = if endpoint_inclusive {
            RowSpacing::EndpointInclusive
        } else {
            RowSpacing::EndpointExclusive
        };
        Ok(ScanGeometry::new(ScanParams {
            amp_x,
            amp_y,
            offset_x,
            offset_y,
            numsteps_x,
            numsteps_y,
            padding_steps,
            dwell_time,
            sample_rate,
            spacing,
        })?)
    }

    #[getter(pixel_samples)]
    fn py_pixel_samples(&self) -> usize {
        self.pixel_samples()
    }
    #[getter(total_x)]
    fn py_total_x(&self) -> usize {
        self.total_x()
    }
    #[getter(total_y)]
    fn py_total_y(&self) -> usize {
        self.total_y()
    }
    #[getter(total_samples)]
    fn py_total_samples(&self) -> usize {
        self.total_samples()
    }
    #[getter(image_shape)]
    fn py_image_shape(&self) -> (usize, usize) {
        self.image_shape()
    }
    #[getter(frame_duration)]
    fn py_frame_duration(&self) -> f64 {
        self.frame_duration()
    }
    /// Imaged voltage span `[x_min, x_max, y_min, y_max]`, usable as a matplotlib extent.
    #[getter(voltage_extent)]
    fn py_voltage_extent(&self) -> [f64; 4] {
        self.voltage_extent()
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.params())
    }
}

/// Two-row `[x, y]` drive waveform of one frame.
#[pyfunction]
fn raster_waveform<'py>(py: Python<'py>, geometry: PyRef<ScanGeometry>) -> &'py PyArray2<f64> {
    PyArray2::from_owned_array(py, crate::waveform::raster_waveform(&geometry))
}

/// One cropped image per row of `raw`, in row order.
#[pyfunction]
fn reconstruct<'py>(
    py: Python<'py>,
    raw: PyReadonlyArray2<f64>,
    geometry: PyRef<ScanGeometry>,
) -> PyResult<Vec<&'py PyArray2<f64>>> {
    let images = crate::reconstruct::reconstruct(raw.as_array(), &geometry)?;
    Ok(images
        .into_iter()
        .map(|image| PyArray2::from_owned_array(py, image))
        .collect())
}

/// Single-channel image reconstruction from a flat sample stream.
#[pyfunction]
fn reconstruct_channel<'py>(
    py: Python<'py>,
    raw: PyReadonlyArray1<f64>,
    geometry: PyRef<ScanGeometry>,
) -> PyResult<&'py PyArray2<f64>> {
    let image = crate::reconstruct::reconstruct_channel(raw.as_array(), &geometry)?;
    Ok(PyArray2::from_owned_array(py, image))
}

/// Trigger waveform of an 8-bit grayscale mask.
#[pyfunction]
#[pyo3(signature = (mask, geometry, high_voltage = 5.0))]
fn ttl_waveform<'py>(
    py: Python<'py>,
    mask: PyReadonlyArray2<u8>,
    geometry: PyRef<ScanGeometry>,
    high_voltage: f64,
) -> PyResult<&'py PyArray1<f64>> {
    let ttl = crate::ttl::ttl_waveform(mask.as_array(), &geometry, high_voltage)?;
    Ok(PyArray1::from_owned_array(py, ttl))
}

/// Samples a single-channel test waveform, returning `(t, signal)`.
///
/// `kind` is one of `"const"`, `"sine"`, `"triangle"`, `"square"`, `"sawtooth"`; for `"const"`
/// the amplitude is the constant value.
#[pyfunction]
fn test_waveform<'py>(
    py: Python<'py>,
    kind: &str,
    amplitude: f64,
    freq: f64,
    duration: f64,
    samp_rate: f64,
) -> PyResult<(&'py PyArray1<f64>, &'py PyArray1<f64>)> {
    let instr = match kind {
        "const" => Instruction::Const { value: amplitude },
        "sine" => Instruction::Sine { amplitude, freq },
        "triangle" => Instruction::Triangle { amplitude, freq },
        "square" => Instruction::Square { amplitude, freq },
        "sawtooth" => Instruction::Sawtooth { amplitude, freq },
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown waveform kind {other:?}"
            )))
        }
    };
    let (t, signal) = sample_instruction(&instr, duration, samp_rate)?;
    Ok((
        PyArray1::from_owned_array(py, t),
        PyArray1::from_owned_array(py, signal),
    ))
}

#[pymodule]
fn rastercompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<ScanGeometry>()?;
    m.add_function(wrap_pyfunction!(raster_waveform, m)?)?;
    m.add_function(wrap_pyfunction!(reconstruct, m)?)?;
    m.add_function(wrap_pyfunction!(reconstruct_channel, m)?)?;
    m.add_function(wrap_pyfunction!(ttl_waveform, m)?)?;
    m.add_function(wrap_pyfunction!(test_waveform, m)?)?;
    Ok(())
}
