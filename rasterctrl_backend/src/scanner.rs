//! Device-owning scan orchestration: compile, acquire, reconstruct.
//!
//! ## Overview
//!
//! A [`Scanner`] owns one [`DaqDevice`] behind a mutex. Every acquisition locks the device for
//! its whole lifetime, from task creation to teardown, so concurrent scan requests run one
//! after another and never share hardware tasks.
//!
//! A single frame ([`Scanner::scan`]) goes through:
//!
//! 1. [`ScanGeometry::new`] on the request parameters.
//! 2. [`raster_waveform`], plus a trigger row from the request mask when a trigger channel is
//!    configured. Mask errors surface here, before the device is touched.
//! 3. [`SyncAcquisition::run`] with the device locked.
//! 4. [`reconstruct`] of every input channel.
//!
//! Multi-frame acquisitions ([`Scanner::scan_frames`]), delay-stage sweeps
//! ([`Scanner::delay_sweep`]) and delay calibration ([`Scanner::delay_calibration`]) repeat that
//! pipeline and hand every frame to an [`ImageSink`].

use ndarray::Array2;
use parking_lot::Mutex;

use rastercompiler_backend::{
    append_trigger_row, raster_waveform, reconstruct, ttl_waveform, ScanGeometry, ScanParams,
    TickTimer,
};

use crate::acquisition::{SyncAcquisition, DEFAULT_TIMEOUT_MARGIN};
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::DaqDevice;
use crate::utils::CancelToken;

/// Trigger output gated by a mask image.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    /// Output channel carrying the trigger, e.g. `ao2`.
    pub chan: String,
    /// Grayscale mask of any size; resized to the scan grid.
    pub mask: Array2<u8>,
    pub high_voltage: f64,
}

/// Everything needed to acquire one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub params: ScanParams,
    /// Output channels driving the `[x, y]` galvo mirrors, in that order.
    pub ao_chans: Vec<String>,
    /// Input channels, one reconstructed image each.
    pub ai_chans: Vec<String>,
    pub trigger: Option<TriggerSpec>,
    pub timeout_margin: f64,
}

impl ScanRequest {
    pub fn new(params: ScanParams, ao_chans: &[&str], ai_chans: &[&str]) -> Self {
        Self {
            params,
            ao_chans: ao_chans.iter().map(|s| s.to_string()).collect(),
            ai_chans: ai_chans.iter().map(|s| s.to_string()).collect(),
            trigger: None,
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
        }
    }

    pub fn with_trigger(mut self, chan: &str, mask: Array2<u8>, high_voltage: f64) -> Self {
        self.trigger = Some(TriggerSpec {
            chan: chan.to_string(),
            mask,
            high_voltage,
        });
        self
    }
}

/// Images of one frame, in input channel order, with the geometry that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFrame {
    pub images: Vec<Array2<f64>>,
    pub geometry: ScanGeometry,
    pub channels: Vec<String>,
}

impl ScanFrame {
    /// Mean of the image of input `channel`.
    pub fn mean_intensity(&self, channel: usize) -> Option<f64> {
        self.images.get(channel).and_then(|image| image.mean())
    }
}

/// Consumer of acquired frames.
pub trait ImageSink {
    /// Receives frame number `index` of the current acquisition.
    fn consume(&mut self, index: usize, frame: &ScanFrame);
}

impl<F: FnMut(usize, &ScanFrame)> ImageSink for F {
    fn consume(&mut self, index: usize, frame: &ScanFrame) {
        self(index, frame)
    }
}

/// Motorised delay line positioned in micrometres.
pub trait DelayStage {
    fn move_absolute_um(&mut self, position_um: f64) -> Result<(), String>;
}

/// `n` evenly spaced positions from `start` to `stop` inclusive.
///
/// # Examples
///
/// ```
/// use rasterctrl_backend::scanner::delay_positions;
///
/// assert_eq!(delay_positions(0.0, 10.0, 3).unwrap(), vec![0.0, 5.0, 10.0]);
/// assert_eq!(delay_positions(4.0, 10.0, 1).unwrap(), vec![4.0]);
/// assert!(delay_positions(0.0, 10.0, 0).is_err());
/// ```
pub fn delay_positions(start: f64, stop: f64, n: usize) -> AcqResult<Vec<f64>> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(AcquisitionError::InvalidSweep(format!(
            "sweep bounds must be finite, got {start}..{stop}"
        )));
    }
    match n {
        0 => Err(AcquisitionError::InvalidSweep(
            "a sweep needs at least one position".into(),
        )),
        1 => Ok(vec![start]),
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            Ok((0..n).map(|i| start + step * i as f64).collect())
        }
    }
}

pub struct Scanner<D: DaqDevice> {
    device: Mutex<D>,
}

impl<D: DaqDevice> Scanner<D> {
    pub fn new(device: D) -> Self {
        Self {
            device: Mutex::new(device),
        }
    }

    pub fn device_name(&self) -> String {
        self.device.lock().name().to_string()
    }

    pub fn reset_device(&self) -> AcqResult<()> {
        let device = self.device.lock();
        log::info!("Resetting device {}", device.name());
        device
            .reset()
            .map_err(|err| AcquisitionError::HardwareFault {
                stage: "resetting device".into(),
                msg: err.to_string(),
            })
    }

    /// Compiles the output waveform and channel list of `request`.
    fn compile(&self, request: &ScanRequest) -> AcqResult<(ScanGeometry, Array2<f64>, Vec<String>)> {
        let geometry = ScanGeometry::new(request.params)?;
        let waveform = raster_waveform(&geometry);
        let mut ao_chans = request.ao_chans.clone();
        let waveform = match &request.trigger {
            Some(trigger) => {
                let ttl = ttl_waveform(trigger.mask.view(), &geometry, trigger.high_voltage)?;
                ao_chans.push(trigger.chan.clone());
                append_trigger_row(&waveform, ttl.view())?
            }
            None => waveform,
        };
        Ok((geometry, waveform, ao_chans))
    }

    /// Acquires and reconstructs one frame.
    pub fn scan(&self, request: &ScanRequest, cancel: &CancelToken) -> AcqResult<ScanFrame> {
        let mut timer = TickTimer::new();
        let (geometry, waveform, ao_chans) = self.compile(request)?;
        let acq = SyncAcquisition::new(&ao_chans, &request.ai_chans)?
            .with_timeout_margin(request.timeout_margin);
        timer.tick_log("compile");

        let raw = {
            let device = self.device.lock();
            timer.tick_log("wait for device");
            log::info!(
                "{}: scanning {}x{} (+{} padding) at {} samples per pixel, {:.3} s",
                device.name(),
                geometry.numsteps_x(),
                geometry.numsteps_y(),
                geometry.padding_steps(),
                geometry.pixel_samples(),
                geometry.frame_duration()
            );
            acq.run(&*device, &waveform, geometry.sample_rate(), cancel)?
        };
        timer.tick_log("acquire");

        let images = reconstruct(raw.view(), &geometry)?;
        timer.tick_log("reconstruct");
        Ok(ScanFrame {
            images,
            geometry,
            channels: request.ai_chans.clone(),
        })
    }

    /// Acquires up to `nframes` frames, handing each to `sink`. Returns the number of frames
    /// acquired; cancellation ends the loop early without an error.
    pub fn scan_frames<S: ImageSink + ?Sized>(
        &self,
        request: &ScanRequest,
        nframes: usize,
        cancel: &CancelToken,
        sink: &mut S,
    ) -> AcqResult<usize> {
        let mut count = 0;
        for index in 0..nframes {
            if cancel.is_cancelled() {
                break;
            }
            match self.scan(request, cancel) {
                Ok(frame) => sink.consume(index, &frame),
                Err(AcquisitionError::Cancelled) => break,
                Err(err) => return Err(err),
            }
            count += 1;
        }
        log::info!("Acquired {count} of {nframes} frames");
        Ok(count)
    }

    /// Moves `stage` to every position in turn and acquires one frame there.
    pub fn delay_sweep<S: ImageSink + ?Sized, St: DelayStage + ?Sized>(
        &self,
        request: &ScanRequest,
        stage: &mut St,
        positions: &[f64],
        cancel: &CancelToken,
        sink: &mut S,
    ) -> AcqResult<usize> {
        let mut count = 0;
        for (index, &position) in positions.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            log::info!("Delay stage to {position} um ({}/{})", index + 1, positions.len());
            stage
                .move_absolute_um(position)
                .map_err(AcquisitionError::Stage)?;
            match self.scan(request, cancel) {
                Ok(frame) => sink.consume(index, &frame),
                Err(AcquisitionError::Cancelled) => break,
                Err(err) => return Err(err),
            }
            count += 1;
        }
        Ok(count)
    }

    /// Runs a delay sweep and returns `(position, mean intensity of the first input)` pairs.
    pub fn delay_calibration<St: DelayStage + ?Sized>(
        &self,
        request: &ScanRequest,
        stage: &mut St,
        positions: &[f64],
        cancel: &CancelToken,
    ) -> AcqResult<Vec<(f64, f64)>> {
        let mut curve = Vec::with_capacity(positions.len());
        let mut sink = |index: usize, frame: &ScanFrame| {
            if let Some(mean) = frame.mean_intensity(0) {
                curve.push((positions[index], mean));
            }
        };
        self.delay_sweep(request, stage, positions, cancel, &mut sink)?;
        Ok(curve)
    }
}
