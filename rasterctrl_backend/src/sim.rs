//! In-memory stand-in for a DAQ device, used by the tests and by the `rasterctrl` binary when no
//! NI hardware is available.
//!
//! ## Behaviour
//!
//! [`SimDevice`] validates channel names and clock sources the way the driver does, keeps the
//! tasks it creates in a shared state, and records each driver call as a [`SimEvent`], so tests
//! can assert on call ordering and teardown. Input data is synthesised from the waveform of the
//! running output task according to a [`SimResponse`]:
//!
//! - `Loopback`: every input channel reads back one output row.
//! - `Pattern`: the galvo voltages of every tick index into a 2D image spanning a voltage
//!   extent, which makes a full scan reproduce the image (input channel `k` is scaled by `k + 1`).
//! - `Constant`: a fixed level.
//!
//! An input task clocked from the output sample clock only completes once an output task has
//! been started; otherwise waits and reads time out, like on hardware. Faults can be injected
//! with [`SimDevice::inject_fault`].
//!
//! Cleared tasks are forgotten, and only the most recent [`EVENT_LOG_CAPACITY`] events are kept,
//! so a device scanning continuously holds a bounded amount of memory.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::Array2;
use parking_lot::Mutex;
use rastercompiler_backend::ScanGeometry;
use regex::Regex;

use crate::hardware::{DaqDevice, DaqTask, TaskError};
use crate::scanner::DelayStage;

/// Number of driver calls kept in the event log.
pub const EVENT_LOG_CAPACITY: usize = 4096;

/// Source of the synthesised input samples.
#[derive(Debug, Clone, PartialEq)]
pub enum SimResponse {
    Loopback { row: usize },
    /// `extent` is `[x_min, x_max, y_min, y_max]`; row 0 of `image` sits at `y_max`.
    Pattern { image: Array2<f64>, extent: [f64; 4] },
    Constant(f64),
}

/// Injectable failures.
#[derive(Debug, Clone, PartialEq)]
pub enum SimFault {
    /// Adding a channel with this short name (e.g. `ai1`) is rejected.
    RejectChannel(String),
    /// Every wait times out.
    TimeoutOnWait,
    /// Sample clocks faster than this rate are rejected.
    RateLimit(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    Create,
    AddChannel,
    ConfigureClock,
    Write,
    Start,
    Wait,
    Read,
    Stop,
    Clear,
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub struct SimEvent {
    /// Label the task was created with.
    pub task: String,
    pub op: SimOp,
}

#[derive(Debug, Default)]
struct TaskRecord {
    ao_chans: Vec<String>,
    ai_chans: Vec<String>,
    clk_src: String,
    seq_len: u64,
    written: Option<Arc<Array2<f64>>>,
    started: bool,
}

#[derive(Debug)]
struct SimState {
    response: SimResponse,
    fault: Option<SimFault>,
    /// Records of the tasks not yet cleared, by task id.
    tasks: HashMap<usize, TaskRecord>,
    next_id: usize,
    events: VecDeque<SimEvent>,
    /// Waveform of the output task currently generating, if any.
    generated: Option<(usize, Arc<Array2<f64>>)>,
    last_written: Option<Arc<Array2<f64>>>,
    peak_live: usize,
    resets: usize,
}

impl SimState {
    fn log(&mut self, task: &str, op: SimOp) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(SimEvent {
            task: task.to_string(),
            op,
        });
    }
}

/// Simulated device. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SimDevice {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new(name: &str, response: SimResponse) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(SimState {
                response,
                fault: None,
                tasks: HashMap::new(),
                next_id: 0,
                events: VecDeque::new(),
                generated: None,
                last_written: None,
                peak_live: 0,
                resets: 0,
            })),
        }
    }

    /// Device imaging a [`test_pattern`] that fills the field scanned by `geometry`.
    pub fn for_geometry(name: &str, geometry: &ScanGeometry) -> Self {
        let (rows, cols) = geometry.image_shape();
        Self::new(
            name,
            SimResponse::Pattern {
                image: test_pattern(rows, cols),
                extent: geometry.voltage_extent(),
            },
        )
    }

    pub fn inject_fault(&self, fault: SimFault) {
        self.state.lock().fault = Some(fault);
    }

    pub fn clear_fault(&self) {
        self.state.lock().fault = None;
    }

    pub fn set_response(&self, response: SimResponse) {
        self.state.lock().response = response;
    }

    /// Most recent driver calls, oldest first.
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Tasks created and not yet cleared.
    pub fn live_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Largest number of simultaneously live tasks seen so far.
    pub fn peak_live_tasks(&self) -> usize {
        self.state.lock().peak_live
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    /// Last waveform written to an output task.
    pub fn last_output(&self) -> Option<Array2<f64>> {
        self.state
            .lock()
            .last_written
            .as_deref()
            .cloned()
    }
}

impl DaqDevice for SimDevice {
    type Task = SimTask;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_task(&self, label: &str) -> Result<SimTask, TaskError> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(id, TaskRecord::default());
        state.peak_live = state.peak_live.max(state.tasks.len());
        state.log(label, SimOp::Create);
        Ok(SimTask {
            id,
            label: label.to_string(),
            device: self.name.clone(),
            clock_terminal: self.output_clock_terminal(),
            state: self.state.clone(),
        })
    }

    fn reset(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock();
        state.resets += 1;
        state.generated = None;
        Ok(())
    }
}

/// Task handle of a [`SimDevice`].
#[derive(Debug)]
pub struct SimTask {
    id: usize,
    label: String,
    device: String,
    clock_terminal: String,
    state: Arc<Mutex<SimState>>,
}

impl SimTask {
    /// Runs `f` on the device state after logging `op`. Cleared tasks refuse every call.
    fn with_record<R>(
        &self,
        op: SimOp,
        f: impl FnOnce(&mut SimState, &mut TaskRecord) -> Result<R, TaskError>,
    ) -> Result<R, TaskError> {
        let mut state = self.state.lock();
        // Taken out while `f` runs so it can borrow the rest of the state
        let Some(mut record) = state.tasks.remove(&self.id) else {
            return Err(TaskError::Fault(format!("{} task used after clear", self.label)));
        };
        state.log(&self.label, op);
        let result = f(&mut *state, &mut record);
        state.tasks.insert(self.id, record);
        result
    }

    fn add_chan(&self, name: &str, kind: &str) -> Result<(), TaskError> {
        let re = Regex::new(&format!(r"^/([^/]+)/({kind}\d+)$"))
            .map_err(|err| TaskError::Fault(err.to_string()))?;
        let device = self.device.clone();
        let name = name.to_string();
        let kind = kind.to_string();
        self.with_record(SimOp::AddChannel, move |state, task| {
            let caps = re
                .captures(&name)
                .ok_or_else(|| TaskError::Rejected(format!("invalid physical channel {name}")))?;
            if &caps[1] != device {
                return Err(TaskError::Rejected(format!(
                    "{name} does not belong to device {device}"
                )));
            }
            if let Some(SimFault::RejectChannel(chan)) = &state.fault {
                if *chan == caps[2] {
                    return Err(TaskError::Rejected(format!("{name} is not available")));
                }
            }
            if kind == "ao" {
                task.ao_chans.push(name.clone());
            } else {
                task.ai_chans.push(name.clone());
            }
            Ok(())
        })
    }

    /// Whether this task borrows the output clock and no output is generating.
    fn starved(state: &SimState, task: &TaskRecord, clock_terminal: &str) -> bool {
        task.clk_src == clock_terminal && state.generated.is_none()
    }

    fn synthesize(
        response: &SimResponse,
        generated: &Array2<f64>,
        nchans: usize,
        nsamps: usize,
    ) -> Result<Array2<f64>, TaskError> {
        match response {
            SimResponse::Constant(v) => Ok(Array2::from_elem((nchans, nsamps), *v)),
            SimResponse::Loopback { row } => {
                if *row >= generated.nrows() {
                    return Err(TaskError::Fault(format!(
                        "loopback row {row} not generated ({} rows)",
                        generated.nrows()
                    )));
                }
                Ok(Array2::from_shape_fn((nchans, nsamps), |(_, j)| {
                    generated[[*row, j]]
                }))
            }
            SimResponse::Pattern { image, extent } => {
                if generated.nrows() < 2 {
                    return Err(TaskError::Fault(
                        "pattern response needs x and y output rows".into(),
                    ));
                }
                let [x_min, x_max, y_min, y_max] = *extent;
                let (rows, cols) = image.dim();
                let index = |frac: f64, len: usize| {
                    let i = (frac * len as f64 + 1e-9).floor();
                    (i.max(0.0) as usize).min(len.saturating_sub(1))
                };
                Ok(Array2::from_shape_fn((nchans, nsamps), |(k, j)| {
                    let (x, y) = (generated[[0, j]], generated[[1, j]]);
                    let col = index((x - x_min) / (x_max - x_min), cols);
                    let row = index((y_max - y) / (y_max - y_min), rows);
                    image[[row, col]] * (k + 1) as f64
                }))
            }
        }
    }
}

impl DaqTask for SimTask {
    fn create_ao_chan(&self, name: &str) -> Result<(), TaskError> {
        self.add_chan(name, "ao")
    }

    fn create_ai_chan(&self, name: &str) -> Result<(), TaskError> {
        self.add_chan(name, "ai")
    }

    fn cfg_sample_clk(&self, clk_src: &str, samp_rate: f64, seq_len: u64) -> Result<(), TaskError> {
        let clock_terminal = self.clock_terminal.clone();
        self.with_record(SimOp::ConfigureClock, |state, task| {
            if !(samp_rate > 0.0) || seq_len == 0 {
                return Err(TaskError::Rejected(format!(
                    "invalid timing: {samp_rate} Hz, {seq_len} samples"
                )));
            }
            if let Some(SimFault::RateLimit(max)) = state.fault {
                if samp_rate > max {
                    return Err(TaskError::Rejected(format!(
                        "sample rate {samp_rate} Hz exceeds device maximum {max} Hz"
                    )));
                }
            }
            if !clk_src.is_empty() && clk_src != clock_terminal {
                return Err(TaskError::Rejected(format!("unknown clock source {clk_src}")));
            }
            task.clk_src = clk_src.to_string();
            task.seq_len = seq_len;
            Ok(())
        })
    }

    fn write_analog(&self, signal_arr: &Array2<f64>) -> Result<usize, TaskError> {
        self.with_record(SimOp::Write, |state, task| {
            if signal_arr.nrows() != task.ao_chans.len() {
                return Err(TaskError::Rejected(format!(
                    "{} rows written to {} output channels",
                    signal_arr.nrows(),
                    task.ao_chans.len()
                )));
            }
            if signal_arr.ncols() as u64 != task.seq_len {
                return Err(TaskError::Rejected(format!(
                    "{} samples written to a {}-sample buffer",
                    signal_arr.ncols(),
                    task.seq_len
                )));
            }
            let written = Arc::new(signal_arr.clone());
            state.last_written = Some(written.clone());
            task.written = Some(written);
            Ok(signal_arr.ncols())
        })
    }

    fn start(&self) -> Result<(), TaskError> {
        let id = self.id;
        self.with_record(SimOp::Start, |state, task| {
            if task.ao_chans.is_empty() && task.ai_chans.is_empty() {
                return Err(TaskError::Rejected("task has no channels".into()));
            }
            if !task.ao_chans.is_empty() && task.written.is_none() {
                return Err(TaskError::Rejected("output buffer is empty".into()));
            }
            task.started = true;
            if let Some(written) = task.written.clone() {
                state.generated = Some((id, written));
            }
            Ok(())
        })
    }

    fn stop(&self) -> Result<(), TaskError> {
        let id = self.id;
        self.with_record(SimOp::Stop, |state, task| {
            task.started = false;
            if matches!(state.generated, Some((gen_id, _)) if gen_id == id) {
                state.generated = None;
            }
            Ok(())
        })
    }

    fn wait_until_done(&self, timeout: f64) -> Result<(), TaskError> {
        let clock_terminal = self.clock_terminal.clone();
        self.with_record(SimOp::Wait, |state, task| {
            if state.fault == Some(SimFault::TimeoutOnWait)
                || !task.started
                || Self::starved(state, task, &clock_terminal)
            {
                return Err(TaskError::Timeout(timeout));
            }
            Ok(())
        })
    }

    fn read_analog(&self, nchans: usize, nsamps: usize, timeout: f64) -> Result<Array2<f64>, TaskError> {
        let clock_terminal = self.clock_terminal.clone();
        self.with_record(SimOp::Read, |state, task| {
            if nchans != task.ai_chans.len() {
                return Err(TaskError::Fault(format!(
                    "read of {nchans} channels from a task with {}",
                    task.ai_chans.len()
                )));
            }
            if nsamps as u64 > task.seq_len {
                return Err(TaskError::Timeout(timeout));
            }
            if Self::starved(state, task, &clock_terminal) {
                return Err(TaskError::Timeout(timeout));
            }
            match &state.generated {
                Some((_, generated)) => {
                    if generated.ncols() < nsamps {
                        return Err(TaskError::Timeout(timeout));
                    }
                    Self::synthesize(&state.response, generated, nchans, nsamps)
                }
                // Onboard-clocked input with nothing generating
                None => Self::synthesize(
                    &state.response,
                    &Array2::zeros((2, nsamps)),
                    nchans,
                    nsamps,
                ),
            }
        })
    }

    fn clear(&self) -> Result<(), TaskError> {
        let mut state = self.state.lock();
        if state.tasks.remove(&self.id).is_none() {
            return Ok(());
        }
        state.log(&self.label, SimOp::Clear);
        if matches!(state.generated, Some((gen_id, _)) if gen_id == self.id) {
            state.generated = None;
        }
        Ok(())
    }
}

/// Delay stage that records the positions it was moved to.
#[derive(Debug, Default)]
pub struct SimStage {
    positions: Vec<f64>,
    fail_after: Option<usize>,
}

impl SimStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stage that refuses every move after the first `moves`.
    pub fn failing_after(moves: usize) -> Self {
        Self {
            positions: Vec::new(),
            fail_after: Some(moves),
        }
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }
}

impl DelayStage for SimStage {
    fn move_absolute_um(&mut self, position_um: f64) -> Result<(), String> {
        if self.fail_after.is_some_and(|n| self.positions.len() >= n) {
            return Err(format!("stage did not reach {position_um} um"));
        }
        self.positions.push(position_um);
        Ok(())
    }
}

/// Ring test target in `[0, 1]`, standing in for a specimen.
pub fn test_pattern(rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let y = (r as f64 + 0.5) / rows as f64 - 0.5;
        let x = (c as f64 + 0.5) / cols as f64 - 0.5;
        0.5 + 0.5 * (2.0 * PI * 3.0 * x.hypot(y)).cos()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ready_output(device: &SimDevice, waveform: &Array2<f64>) -> SimTask {
        let task = device.create_task("output").unwrap();
        for k in 0..waveform.nrows() {
            task.create_ao_chan(&format!("/Dev1/ao{k}")).unwrap();
        }
        task.cfg_sample_clk("", 1e6, waveform.ncols() as u64).unwrap();
        task.write_analog(waveform).unwrap();
        task
    }

    fn clocked_input(device: &SimDevice, nsamps: u64) -> SimTask {
        let task = device.create_task("input").unwrap();
        task.create_ai_chan("/Dev1/ai0").unwrap();
        task.cfg_sample_clk(&device.output_clock_terminal(), 1e6, nsamps)
            .unwrap();
        task
    }

    #[test]
    fn validates_channel_names() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        let task = device.create_task("output").unwrap();
        assert!(task.create_ao_chan("/Dev1/ao0").is_ok());
        assert!(matches!(task.create_ao_chan("/Dev2/ao0"), Err(TaskError::Rejected(_))));
        assert!(matches!(task.create_ao_chan("/Dev1/ai0"), Err(TaskError::Rejected(_))));
        assert!(matches!(task.create_ai_chan("Dev1/ai0"), Err(TaskError::Rejected(_))));
        assert!(matches!(
            task.cfg_sample_clk("/Dev1/PFI0", 1e6, 10),
            Err(TaskError::Rejected(_))
        ));
    }

    #[test]
    fn clocked_input_starves_without_output() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(1.0));
        let input = clocked_input(&device, 4);
        input.start().unwrap();
        assert_eq!(input.wait_until_done(2.0), Err(TaskError::Timeout(2.0)));
        assert!(matches!(input.read_analog(1, 4, 2.0), Err(TaskError::Timeout(_))));
    }

    #[test]
    fn loopback_follows_output() {
        let device = SimDevice::new("Dev1", SimResponse::Loopback { row: 0 });
        let waveform = array![[1., 2., 3.], [4., 5., 6.]];
        let output = ready_output(&device, &waveform);
        let input = clocked_input(&device, 3);
        input.start().unwrap();
        output.start().unwrap();
        input.wait_until_done(1.0).unwrap();
        assert_eq!(input.read_analog(1, 3, 1.0).unwrap(), array![[1., 2., 3.]]);
        assert_eq!(device.last_output(), Some(waveform));
    }

    #[test]
    fn pattern_samples_image_at_galvo_voltage() {
        let image = array![[1., 2.], [3., 4.]];
        let device = SimDevice::new(
            "Dev1",
            SimResponse::Pattern {
                image,
                extent: [-1.0, 1.0, -1.0, 1.0],
            },
        );
        // (x, y): top-left, top-right, bottom-left, bottom-right
        let waveform = array![[-1.0, 0.0, -1.0, 0.0], [1.0, 1.0, 0.0, 0.0]];
        let output = ready_output(&device, &waveform);
        let input = clocked_input(&device, 4);
        input.start().unwrap();
        output.start().unwrap();
        assert_eq!(input.read_analog(1, 4, 1.0).unwrap(), array![[1., 2., 3., 4.]]);
    }

    #[test]
    fn clear_is_idempotent_and_final() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        let task = device.create_task("output").unwrap();
        assert_eq!(device.live_tasks(), 1);
        task.clear().unwrap();
        task.clear().unwrap();
        assert_eq!(device.live_tasks(), 0);
        assert!(matches!(task.start(), Err(TaskError::Fault(_))));
        let clears = device.events().iter().filter(|e| e.op == SimOp::Clear).count();
        assert_eq!(clears, 1);
    }

    #[test]
    fn cleared_tasks_release_their_buffers() {
        let device = SimDevice::new("Dev1", SimResponse::Loopback { row: 0 });
        for frame in 0..20 {
            let waveform = Array2::from_elem((2, 1000), frame as f64);
            let output = ready_output(&device, &waveform);
            let input = clocked_input(&device, 1000);
            input.start().unwrap();
            output.start().unwrap();
            input.read_analog(1, 1000, 1.0).unwrap();
            output.stop().unwrap();
            output.clear().unwrap();
            input.clear().unwrap();
        }
        let state = device.state.lock();
        assert!(state.tasks.is_empty());
        assert!(state.generated.is_none());
        // Only the latest waveform is still referenced
        let last = state.last_written.as_ref().unwrap();
        assert_eq!(Arc::strong_count(last), 1);
        assert!(last.iter().all(|&v| v == 19.0));
    }

    #[test]
    fn event_log_keeps_the_latest_calls() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        for _ in 0..EVENT_LOG_CAPACITY {
            device.create_task("output").unwrap().clear().unwrap();
        }
        let events = device.events();
        assert_eq!(events.len(), EVENT_LOG_CAPACITY);
        assert_eq!(events.last().map(|e| e.op), Some(SimOp::Clear));
        assert_eq!(device.live_tasks(), 0);
    }

    #[test]
    fn rate_limit_rejects_fast_clocks() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        device.inject_fault(SimFault::RateLimit(5e5));
        let task = device.create_task("output").unwrap();
        assert!(matches!(task.cfg_sample_clk("", 1e6, 10), Err(TaskError::Rejected(_))));
        device.clear_fault();
        assert!(task.cfg_sample_clk("", 1e6, 10).is_ok());
    }

    #[test]
    fn stage_records_and_fails() {
        let mut stage = SimStage::failing_after(2);
        stage.move_absolute_um(1.0).unwrap();
        stage.move_absolute_um(2.0).unwrap();
        assert!(stage.move_absolute_um(3.0).is_err());
        assert_eq!(stage.positions(), [1.0, 2.0]);
    }

    #[test]
    fn geometry_device_spans_the_scanned_field() {
        let params = rastercompiler_backend::ScanParams {
            numsteps_x: 12,
            numsteps_y: 9,
            ..Default::default()
        };
        let geometry = ScanGeometry::new(params).unwrap();
        let device = SimDevice::for_geometry("Dev1", &geometry);
        match &device.state.lock().response {
            SimResponse::Pattern { image, extent } => {
                assert_eq!(image.dim(), (9, 12));
                assert_eq!(*extent, geometry.voltage_extent());
                assert_eq!(extent[2..], [1.0, 2.0]);
            }
            other => panic!("expected a pattern response, got {other:?}"),
        };
    }

    #[test]
    fn test_pattern_is_bounded() {
        let pattern = test_pattern(16, 24);
        assert_eq!(pattern.dim(), (16, 24));
        assert!(pattern.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
