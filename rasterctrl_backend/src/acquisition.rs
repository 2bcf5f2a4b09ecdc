//! Synchronized output / input acquisition of one raster frame.
//!
//! ## Protocol
//!
//! [`SyncAcquisition::run`] drives one finite acquisition on a [`DaqDevice`]:
//!
//! 1. An output task is created with one voltage channel per waveform row and a finite onboard
//!    sample clock of `total_samples` samples at `sample_rate`.
//! 2. An input task is created with the requested input channels, clocked from the output
//!    task's sample clock terminal ([`DaqDevice::output_clock_terminal`]). Input sample `i` is
//!    therefore taken on the same clock edge that generates output sample `i`.
//! 3. The waveform is written to the output buffer without starting the task.
//! 4. The input task is started first so that it is armed before the first clock edge, then the
//!    output task.
//! 5. Both tasks are awaited with a timeout of `total_samples / sample_rate + margin`.
//! 6. Exactly `total_samples` samples are read from every input channel.
//!
//! Both tasks are held in [`TaskGuard`]s, so whatever step fails, the output task is stopped
//! and both tasks are cleared before the error reaches the caller. Configuration errors are
//! never retried.

use ndarray::Array2;
use regex::Regex;

use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::{physical_chan, DaqDevice, DaqTask, TaskError, TaskGuard};
use crate::utils::CancelToken;

/// Seconds added to the nominal frame duration before a wait is considered timed out.
pub const DEFAULT_TIMEOUT_MARGIN: f64 = 5.0;

/// Maps a driver error raised while `stage` into the acquisition error taxonomy.
fn classify(task: &str, stage: &str) -> impl Fn(TaskError) -> AcquisitionError {
    let task = task.to_string();
    let stage = stage.to_string();
    move |err| match err {
        TaskError::Rejected(msg) => AcquisitionError::HardwareConfiguration {
            stage: stage.clone(),
            msg,
        },
        TaskError::Timeout(timeout) => AcquisitionError::AcquisitionTimeout {
            task: task.clone(),
            timeout,
        },
        TaskError::Fault(msg) => AcquisitionError::HardwareFault {
            stage: stage.clone(),
            msg,
        },
    }
}

/// Channel lists and timing margin of a synchronized acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncAcquisition {
    ao_chans: Vec<String>,
    ai_chans: Vec<String>,
    timeout_margin: f64,
}

impl SyncAcquisition {
    /// Validates the channel names (`ao<N>` outputs, `ai<N>` inputs) and builds an acquisition
    /// with the default timeout margin.
    ///
    /// # Examples
    ///
    /// ```
    /// use rasterctrl_backend::acquisition::SyncAcquisition;
    ///
    /// let acq = SyncAcquisition::new(&["ao0", "ao1"], &["ai0"]).unwrap();
    /// assert_eq!(acq.ai_chans(), ["ai0"]);
    /// assert!(SyncAcquisition::new(&["ao0", "ao1"], &[] as &[&str]).is_err());
    /// assert!(SyncAcquisition::new(&["ai0"], &["ai1"]).is_err());
    /// ```
    pub fn new<S: AsRef<str>>(ao_chans: &[S], ai_chans: &[S]) -> AcqResult<Self> {
        let check = |chans: &[S], pattern: &str, kind: &str| -> AcqResult<Vec<String>> {
            let re = Regex::new(pattern).map_err(|err| AcquisitionError::HardwareConfiguration {
                stage: "validating channels".into(),
                msg: err.to_string(),
            })?;
            if chans.is_empty() {
                return Err(AcquisitionError::HardwareConfiguration {
                    stage: "validating channels".into(),
                    msg: format!("at least one {kind} channel is required"),
                });
            }
            chans
                .iter()
                .map(|chan| {
                    let chan = chan.as_ref();
                    if re.is_match(chan) {
                        Ok(chan.to_string())
                    } else {
                        Err(AcquisitionError::HardwareConfiguration {
                            stage: "validating channels".into(),
                            msg: format!("{chan} is not a valid {kind} channel name"),
                        })
                    }
                })
                .collect()
        };
        let ao_chans = check(ao_chans, r"^ao\d+$", "analog output")?;
        let ai_chans = check(ai_chans, r"^ai\d+$", "analog input")?;
        Ok(Self {
            ao_chans,
            ai_chans,
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
        })
    }

    pub fn with_timeout_margin(mut self, margin: f64) -> Self {
        self.timeout_margin = margin;
        self
    }

    pub fn ao_chans(&self) -> &[String] {
        &self.ao_chans
    }
    pub fn ai_chans(&self) -> &[String] {
        &self.ai_chans
    }
    pub fn timeout_margin(&self) -> f64 {
        self.timeout_margin
    }

    /// Timeout in seconds of a frame of `nsamps` samples at `samp_rate`.
    pub fn timeout(&self, nsamps: usize, samp_rate: f64) -> f64 {
        nsamps as f64 / samp_rate + self.timeout_margin
    }

    /// Plays `waveform` (one row per output channel) and returns the `(ai_chans, samples)` input
    /// recorded on the same clock.
    ///
    /// Returns [`AcquisitionError::Cancelled`] without starting any task when `cancel` is set
    /// before the tasks start.
    pub fn run<D: DaqDevice>(
        &self,
        device: &D,
        waveform: &Array2<f64>,
        samp_rate: f64,
        cancel: &CancelToken,
    ) -> AcqResult<Array2<f64>> {
        let (nchans, nsamps) = waveform.dim();
        if nchans != self.ao_chans.len() {
            return Err(AcquisitionError::HardwareConfiguration {
                stage: "validating channels".into(),
                msg: format!(
                    "waveform has {} rows for {} output channels",
                    nchans,
                    self.ao_chans.len()
                ),
            });
        }
        if nsamps == 0 {
            return Err(AcquisitionError::HardwareConfiguration {
                stage: "validating channels".into(),
                msg: "waveform is empty".into(),
            });
        }
        let timeout = self.timeout(nsamps, samp_rate);
        let dev = device.name();
        log::debug!(
            "{dev}: acquiring {nsamps} samples on {:?} -> {:?} at {samp_rate} Hz (timeout {timeout:.3} s)",
            self.ao_chans,
            self.ai_chans
        );

        // Output task: onboard clock, finite generation
        let mut ao = TaskGuard::new(
            device
                .create_task("output")
                .map_err(classify("output", "creating output task"))?,
            "output",
        );
        for chan in &self.ao_chans {
            ao.create_ao_chan(&physical_chan(dev, chan))
                .map_err(classify("output", "adding output channels"))?;
        }
        ao.cfg_sample_clk("", samp_rate, nsamps as u64)
            .map_err(classify("output", "configuring output clock"))?;

        // Input task: borrows the output sample clock
        let mut ai = TaskGuard::new(
            device
                .create_task("input")
                .map_err(classify("input", "creating input task"))?,
            "input",
        );
        for chan in &self.ai_chans {
            ai.create_ai_chan(&physical_chan(dev, chan))
                .map_err(classify("input", "adding input channels"))?;
        }
        ai.cfg_sample_clk(&device.output_clock_terminal(), samp_rate, nsamps as u64)
            .map_err(classify("input", "configuring input clock"))?;

        let written = ao
            .write_analog(waveform)
            .map_err(classify("output", "writing output waveform"))?;
        if written != nsamps {
            return Err(AcquisitionError::HardwareFault {
                stage: "writing output waveform".into(),
                msg: format!("driver accepted {written} of {nsamps} samples per channel"),
            });
        }

        if cancel.is_cancelled() {
            log::info!("{dev}: scan cancelled before start");
            return Err(AcquisitionError::Cancelled);
        }
        ai.start().map_err(classify("input", "starting input task"))?;
        ao.start().map_err(classify("output", "starting output task"))?;

        ao.wait_until_done(timeout)
            .map_err(classify("output", "waiting for output task"))?;
        ai.wait_until_done(timeout)
            .map_err(classify("input", "waiting for input task"))?;

        let data = ai
            .read_analog(self.ai_chans.len(), nsamps, timeout)
            .map_err(classify("input", "reading input samples"))?;
        if data.dim() != (self.ai_chans.len(), nsamps) {
            return Err(AcquisitionError::HardwareFault {
                stage: "reading input samples".into(),
                msg: format!(
                    "driver returned {:?} samples, expected {:?}",
                    data.dim(),
                    (self.ai_chans.len(), nsamps)
                ),
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimFault, SimOp, SimResponse};
    use ndarray::array;

    fn acq() -> SyncAcquisition {
        SyncAcquisition::new(&["ao0", "ao1"], &["ai0", "ai1"]).unwrap()
    }

    #[test]
    fn rejects_bad_channel_names() {
        for (ao, ai) in [
            (vec!["ao0"], vec!["ao1"]),
            (vec!["Dev1/ao0"], vec!["ai0"]),
            (vec!["ao"], vec!["ai0"]),
            (vec![], vec!["ai0"]),
        ] {
            assert!(matches!(
                SyncAcquisition::new(&ao, &ai),
                Err(AcquisitionError::HardwareConfiguration { .. })
            ));
        }
    }

    #[test]
    fn loopback_reads_the_written_waveform() {
        let device = SimDevice::new("Dev1", SimResponse::Loopback { row: 1 });
        let waveform = array![[0., 1., 2., 3.], [4., 5., 6., 7.]];
        let data = acq().run(&device, &waveform, 1e6, &CancelToken::new()).unwrap();
        assert_eq!(data.dim(), (2, 4));
        assert_eq!(data.row(0), waveform.row(1));
        assert_eq!(data.row(1), waveform.row(1));
    }

    #[test]
    fn input_is_armed_before_output_starts() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        let waveform = Array2::zeros((2, 8));
        acq().run(&device, &waveform, 1e6, &CancelToken::new()).unwrap();

        let starts: Vec<String> = device
            .events()
            .into_iter()
            .filter(|e| e.op == SimOp::Start)
            .map(|e| e.task)
            .collect();
        assert_eq!(starts, vec!["input", "output"]);
        assert_eq!(device.live_tasks(), 0);
    }

    #[test]
    fn cancelled_scan_never_starts() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = acq().run(&device, &Array2::zeros((2, 8)), 1e6, &cancel);
        assert_eq!(result, Err(AcquisitionError::Cancelled));
        assert!(device.events().iter().all(|e| e.op != SimOp::Start));
        assert_eq!(device.live_tasks(), 0);
    }

    #[test]
    fn timeout_is_distinct_and_tears_down() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        device.inject_fault(SimFault::TimeoutOnWait);
        let acq = acq().with_timeout_margin(0.5);
        let result = acq.run(&device, &Array2::zeros((2, 1000)), 1e6, &CancelToken::new());
        match result {
            Err(AcquisitionError::AcquisitionTimeout { task, timeout }) => {
                assert_eq!(task, "output");
                assert!((timeout - 0.501).abs() < 1e-9);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        let events = device.events();
        let output_stop = events
            .iter()
            .position(|e| e.task == "output" && e.op == SimOp::Stop);
        assert!(output_stop.is_some());
        assert_eq!(device.live_tasks(), 0);
    }

    #[test]
    fn rejected_channel_is_a_configuration_error() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        device.inject_fault(SimFault::RejectChannel("ai1".into()));
        let result = acq().run(&device, &Array2::zeros((2, 8)), 1e6, &CancelToken::new());
        assert!(matches!(
            result,
            Err(AcquisitionError::HardwareConfiguration { .. })
        ));
        assert!(device.events().iter().all(|e| e.op != SimOp::Start));
        assert_eq!(device.live_tasks(), 0);
    }

    #[test]
    fn waveform_rows_must_match_outputs() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        let result = acq().run(&device, &Array2::zeros((3, 8)), 1e6, &CancelToken::new());
        assert!(matches!(
            result,
            Err(AcquisitionError::HardwareConfiguration { .. })
        ));
        assert!(device.events().is_empty());
    }
}
