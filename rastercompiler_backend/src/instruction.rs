//! Provides single-channel test waveforms for driving one galvo (or any analog output) on its
//! own, e.g. while calibrating mirror response or checking wiring on the bench.
//!
//! ## Main Structures:
//!
//! - [`Instruction`]: a periodic (or constant) waveform shape together with its parameters.
//!   Instructions are evaluated in place on an array of sample times.
//!
//! - [`sample_instruction`]: samples an instruction over a finite duration at a given clock rate,
//!   returning the sample times and values.
//!
//! Sample times are endpoint-exclusive: a duration `T` at rate `R` gives `round(R * T)` samples at
//! `t_i = i / R`, so back-to-back repetitions of the buffer do not duplicate the wrap-around sample.

use std::f64::consts::PI;
use std::fmt;

use ndarray::{Array1, ArrayViewMut1};

use crate::error::{ScanError, ScanResult};

/// Waveform shapes, with amplitude `amplitude` (volts) and frequency `freq` (Hz).
///
/// ## Implemented shapes:
/// 1. `Const`: `value`
/// 2. `Sine`: `amplitude * sin(2π f t)`
/// 3. `Triangle`: `amplitude * (2 |2 frac(f t) - 1| - 1)`
/// 4. `Square`: `amplitude * sign(sin(2π f t))`
/// 5. `Sawtooth`: `amplitude * (2 frac(f t) - 1)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Const { value: f64 },
    Sine { amplitude: f64, freq: f64 },
    Triangle { amplitude: f64, freq: f64 },
    Square { amplitude: f64, freq: f64 },
    Sawtooth { amplitude: f64, freq: f64 },
}

impl Instruction {
    /// Evaluates the instruction and replaces every sample time in `t_arr` with the signal value.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndarray::array;
    /// use rastercompiler_backend::instruction::Instruction;
    ///
    /// let mut t = array![0.0, 0.25, 0.5, 0.75];
    /// Instruction::Sawtooth { amplitude: 2.0, freq: 1.0 }.eval_inplace(&mut t.view_mut());
    /// assert_eq!(t, array![-2.0, -1.0, 0.0, 1.0]);
    /// ```
    pub fn eval_inplace(&self, t_arr: &mut ArrayViewMut1<f64>) {
        let frac = |x: f64| x - x.floor();
        match *self {
            Instruction::Const { value } => t_arr.fill(value),
            Instruction::Sine { amplitude, freq } => {
                t_arr.mapv_inplace(|t| amplitude * (2.0 * PI * freq * t).sin())
            }
            Instruction::Triangle { amplitude, freq } => t_arr.mapv_inplace(|t| {
                amplitude * (2.0 * (2.0 * frac(t * freq) - 1.0).abs() - 1.0)
            }),
            Instruction::Square { amplitude, freq } => t_arr.mapv_inplace(|t| {
                let s = (2.0 * PI * freq * t).sin();
                // sign(0) is 0, matching the zero crossings of the sine
                if s > 0.0 {
                    amplitude
                } else if s < 0.0 {
                    -amplitude
                } else {
                    0.0
                }
            }),
            Instruction::Sawtooth { amplitude, freq } => {
                t_arr.mapv_inplace(|t| amplitude * (2.0 * frac(t * freq) - 1.0))
            }
        }
    }

    /// Largest absolute value the instruction can produce.
    pub fn peak(&self) -> f64 {
        match *self {
            Instruction::Const { value } => value.abs(),
            Instruction::Sine { amplitude, .. }
            | Instruction::Triangle { amplitude, .. }
            | Instruction::Square { amplitude, .. }
            | Instruction::Sawtooth { amplitude, .. } => amplitude.abs(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::Const { value } => write!(f, "[CONST, {{value: {value}}}]"),
            Instruction::Sine { amplitude, freq } => {
                write!(f, "[SINE, {{amplitude: {amplitude}, freq: {freq}}}]")
            }
            Instruction::Triangle { amplitude, freq } => {
                write!(f, "[TRIANGLE, {{amplitude: {amplitude}, freq: {freq}}}]")
            }
            Instruction::Square { amplitude, freq } => {
                write!(f, "[SQUARE, {{amplitude: {amplitude}, freq: {freq}}}]")
            }
            Instruction::Sawtooth { amplitude, freq } => {
                write!(f, "[SAWTOOTH, {{amplitude: {amplitude}, freq: {freq}}}]")
            }
        }
    }
}

/// Samples `instr` for `duration` seconds at `samp_rate` Hz, returning `(t, signal)`.
///
/// Fails with [`ScanError::InvalidInstruction`] when the rate or duration is not a positive
/// finite number.
pub fn sample_instruction(
    instr: &Instruction,
    duration: f64,
    samp_rate: f64,
) -> ScanResult<(Array1<f64>, Array1<f64>)> {
    if !(samp_rate.is_finite() && samp_rate > 0.0) {
        return Err(ScanError::InvalidInstruction(format!(
            "{instr} sample rate must be positive, got {samp_rate}"
        )));
    }
    if !(duration.is_finite() && duration > 0.0) {
        return Err(ScanError::InvalidInstruction(format!(
            "{instr} duration must be positive, got {duration}"
        )));
    }
    let nsamps = (duration * samp_rate).round() as usize;
    let t = Array1::from_shape_fn(nsamps, |i| i as f64 / samp_rate);
    let mut signal = t.clone();
    instr.eval_inplace(&mut signal.view_mut());
    Ok((t, signal))
}
