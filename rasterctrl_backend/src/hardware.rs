//! Hardware task abstraction used by the acquisition layer.
//!
//! ## Overview
//!
//! The acquisition protocol needs a small slice of what a DAQ driver offers: finite analog
//! output and input tasks, a sample clock that the input task can borrow from the output task,
//! and the usual write / start / wait / read / stop / clear lifecycle. These operations are
//! captured by two traits:
//!
//! - [`DaqDevice`]: a named device that creates tasks and knows the terminal name of its output
//!   sample clock.
//! - [`DaqTask`]: a single hardware task. Methods mirror the NI-DAQmx C calls they map to
//!   (see [`crate::nidaqmx`]), and every call reports failures as a [`TaskError`].
//!
//! [`crate::sim::SimDevice`] implements the same traits in memory, so the whole scan pipeline can
//! be exercised without hardware.
//!
//! ## Task lifetime
//!
//! Tasks are owned through a [`TaskGuard`]. Dropping the guard stops the task if it was started
//! and then clears it, on success and error paths alike. Errors during teardown are logged and
//! never mask the error that caused the teardown.

use std::fmt;
use std::ops::Deref;

use ndarray::Array2;

/// Failure of a single driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The driver refused a channel, timing or buffer configuration.
    Rejected(String),
    /// A wait or read did not complete within the given number of seconds.
    Timeout(f64),
    /// Any other runtime failure reported by the driver.
    Fault(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskError::Rejected(msg) => write!(f, "rejected: {msg}"),
            TaskError::Timeout(timeout) => write!(f, "timed out after {timeout} s"),
            TaskError::Fault(msg) => write!(f, "fault: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

/// One finite hardware task.
pub trait DaqTask {
    /// Adds an analog output voltage channel by physical name, e.g. `/Dev1/ao0`.
    fn create_ao_chan(&self, name: &str) -> Result<(), TaskError>;
    /// Adds an analog input voltage channel by physical name, e.g. `/Dev1/ai0`.
    fn create_ai_chan(&self, name: &str) -> Result<(), TaskError>;
    /// Configures a finite sample clock of `seq_len` samples per channel. An empty `clk_src`
    /// selects the task's onboard clock.
    fn cfg_sample_clk(&self, clk_src: &str, samp_rate: f64, seq_len: u64) -> Result<(), TaskError>;
    /// Writes a `(channels, samples)` array without starting the task. Returns the number of
    /// samples per channel accepted by the driver.
    fn write_analog(&self, signal_arr: &Array2<f64>) -> Result<usize, TaskError>;
    fn start(&self) -> Result<(), TaskError>;
    fn stop(&self) -> Result<(), TaskError>;
    fn wait_until_done(&self, timeout: f64) -> Result<(), TaskError>;
    /// Reads `nsamps` samples from each of `nchans` channels as a `(nchans, nsamps)` array.
    fn read_analog(&self, nchans: usize, nsamps: usize, timeout: f64) -> Result<Array2<f64>, TaskError>;
    /// Releases the task. Clearing an already cleared task is a no-op.
    fn clear(&self) -> Result<(), TaskError>;
}

/// A DAQ device able to create tasks.
pub trait DaqDevice: Send {
    type Task: DaqTask;

    fn name(&self) -> &str;
    /// Creates an empty task. `label` is only used for logging and diagnostics.
    fn create_task(&self, label: &str) -> Result<Self::Task, TaskError>;
    /// Terminal carrying the analog output sample clock, used to clock input tasks.
    fn output_clock_terminal(&self) -> String {
        format!("/{}/ao/SampleClock", self.name())
    }
    /// Aborts all tasks on the device and returns it to its power-on state.
    fn reset(&self) -> Result<(), TaskError>;
}

/// Physical channel name of `chan` on device `dev`, e.g. `/Dev1/ao0`.
pub fn physical_chan(dev: &str, chan: &str) -> String {
    format!("/{}/{}", dev, chan)
}

/// Owns a task and tears it down when dropped.
pub struct TaskGuard<T: DaqTask> {
    task: T,
    label: String,
    started: bool,
}

impl<T: DaqTask> TaskGuard<T> {
    pub fn new(task: T, label: &str) -> Self {
        Self {
            task,
            label: label.to_string(),
            started: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Starts the task and arms the stop-on-drop.
    pub fn start(&mut self) -> Result<(), TaskError> {
        self.task.start()?;
        self.started = true;
        Ok(())
    }
}

impl<T: DaqTask> Deref for TaskGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.task
    }
}

impl<T: DaqTask> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        if self.started {
            if let Err(err) = self.task.stop() {
                log::warn!("Failed to stop {} task: {}", self.label, err);
            }
        }
        if let Err(err) = self.task.clear() {
            log::warn!("Failed to clear {} task: {}", self.label, err);
        }
    }
}
