//! Provides a minimal rust wrapper for the parts of the NI-DAQmx C library used by raster scans.
//!
//! ## Overview
//!
//! [`NiTask`] wraps an NI-DAQmx task handle and implements [`DaqTask`] by calling the matching
//! DAQmx C-functions: analog output and input voltage channels, finite sample clock timing,
//! analog writes and reads, and the start / wait / stop / clear lifecycle. [`NiDevice`]
//! implements [`DaqDevice`] for a device name as shown in NI MAX.
//!
//! Every C call goes through [`daqmx_call`], which turns a negative status code into a
//! [`DAQmxError`] carrying the driver's extended error message. `NiTask` then classifies the
//! error by the call that produced it:
//!
//! - channel, timing, write and start calls report [`TaskError::Rejected`];
//! - wait and read calls report [`TaskError::Timeout`] for the driver's timeout codes and
//!   [`TaskError::Fault`] otherwise;
//! - stop and clear report [`TaskError::Fault`].
//!
//! This module is only built with the `nidaqmx` feature, which links against `NIDAQmx`.
//!
//! ## Cleanup and Resource Management
//!
//! `NiTask` clears its handle on drop. [`DaqTask::clear`] is idempotent, so an explicit clear
//! followed by the drop releases the handle exactly once.
//!
//! ## Further Reading
//!
//! For more details on the NI-DAQmx C driver and its capabilities, please refer to the
//! [NI-DAQmx C Reference](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html).

use std::cell::Cell;
use std::ffi::{CStr, CString};

use ndarray::Array2;
use thiserror::Error;

use crate::hardware::{DaqDevice, DaqTask, TaskError};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
pub const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;

/// `DAQmxErrorSamplesNotYetAvailable`
pub const DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE: CInt32 = -200284;
/// `DAQmxErrorWaitUntilDoneDoesNotIndicateDone`
pub const DAQMX_ERROR_WAIT_UNTIL_DONE: CInt32 = -200560;

/// Output and input voltage range of the galvo and detector channels.
const VOLTAGE_RANGE: (CFloat64, CFloat64) = (-10.0, 10.0);
/// Seconds a buffer write may block. A finite frame fits the buffer, so writes return at once.
const WRITE_TIMEOUT: CFloat64 = 10.0;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxWaitUntilTaskDone(handle: TaskHandle, timeToWait: CFloat64) -> CInt32;
    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateAIVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;

    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxReadAnalogF64(
        handle: TaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut CFloat64,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

/// A negative DAQmx status code with the driver's extended error message.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("DAQmx error {code}: {msg}")]
pub struct DAQmxError {
    pub code: i32,
    pub msg: String,
}

impl DAQmxError {
    fn rejected(self) -> TaskError {
        TaskError::Rejected(self.to_string())
    }

    fn fault(self) -> TaskError {
        TaskError::Fault(self.to_string())
    }

    fn runtime(self, timeout: f64) -> TaskError {
        match self.code {
            DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE | DAQMX_ERROR_WAIT_UNTIL_DONE => {
                TaskError::Timeout(timeout)
            }
            _ => self.fault(),
        }
    }
}

/// Calls a DAQmx C-function and converts a negative status code into a [`DAQmxError`].
///
/// Every DAQmx C-function returns an `int32` which, if negative, indicates an error. The
/// extended error information is fetched with `DAQmxGetExtendedErrorInfo` and logged.
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<(), DAQmxError> {
    let err_code = func();
    if err_code >= 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), err_buff.len() as CUint32);
    }
    let msg = unsafe { CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    log::error!("DAQmx error {}: {}", err_code, msg);
    Err(DAQmxError {
        code: err_code,
        msg,
    })
}

fn c_string(value: &str) -> Result<CString, TaskError> {
    CString::new(value).map_err(|_| TaskError::Rejected(format!("{value:?} contains a NUL byte")))
}

/// Resets a National Instruments (NI) device, aborting all of its tasks.
pub fn reset_ni_device(name: &str) -> Result<(), TaskError> {
    let name_cstr = c_string(name)?;
    daqmx_call(|| unsafe { DAQmxResetDevice(name_cstr.as_ptr()) }).map_err(DAQmxError::fault)
}

/// Represents a National Instruments (NI) DAQmx task.
pub struct NiTask {
    handle: TaskHandle,
    cleared: Cell<bool>,
}

impl NiTask {
    pub fn new() -> Result<Self, TaskError> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = c_string("")?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })
            .map_err(DAQmxError::rejected)?;
        Ok(Self {
            handle: taskhandle,
            cleared: Cell::new(false),
        })
    }
}

impl DaqTask for NiTask {
    fn create_ao_chan(&self, name: &str) -> Result<(), TaskError> {
        let name_cstr = c_string(name)?;
        let assigned_name_cstr = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                VOLTAGE_RANGE.0,
                VOLTAGE_RANGE.1,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
        .map_err(DAQmxError::rejected)
    }

    fn create_ai_chan(&self, name: &str) -> Result<(), TaskError> {
        let name_cstr = c_string(name)?;
        let assigned_name_cstr = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAIVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CFG_DEFAULT,
                VOLTAGE_RANGE.0,
                VOLTAGE_RANGE.1,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
        .map_err(DAQmxError::rejected)
    }

    fn cfg_sample_clk(&self, clk_src: &str, samp_rate: f64, seq_len: u64) -> Result<(), TaskError> {
        let src_cstring = c_string(clk_src)?;
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                seq_len as CUint64,
            )
        })
        .map_err(DAQmxError::rejected)
    }

    fn write_analog(&self, signal_arr: &Array2<f64>) -> Result<usize, TaskError> {
        // Row-major (channels, samples) data is laid out channel by channel
        let data = signal_arr.as_standard_layout();
        let seq_len = CInt32::try_from(data.ncols())
            .map_err(|_| TaskError::Rejected(format!("{} samples per channel", data.ncols())))?;
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                seq_len,
                false as CBool32,
                WRITE_TIMEOUT,
                DAQMX_VAL_GROUPBYCHANNEL,
                data.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })
        .map_err(DAQmxError::rejected)?;
        Ok(nwritten as usize)
    }

    fn start(&self) -> Result<(), TaskError> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) }).map_err(DAQmxError::rejected)
    }

    fn stop(&self) -> Result<(), TaskError> {
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) }).map_err(DAQmxError::fault)
    }

    fn wait_until_done(&self, timeout: f64) -> Result<(), TaskError> {
        daqmx_call(|| unsafe { DAQmxWaitUntilTaskDone(self.handle, timeout as CFloat64) })
            .map_err(|err| err.runtime(timeout))
    }

    fn read_analog(&self, nchans: usize, nsamps: usize, timeout: f64) -> Result<Array2<f64>, TaskError> {
        let mut buf = vec![0.0; nchans * nsamps];
        let samps_per_chan = CInt32::try_from(nsamps)
            .map_err(|_| TaskError::Rejected(format!("{nsamps} samples per channel")))?;
        let buf_len = CUint32::try_from(buf.len())
            .map_err(|_| TaskError::Rejected(format!("{} sample read buffer", buf.len())))?;
        let mut nread: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxReadAnalogF64(
                self.handle,
                samps_per_chan,
                timeout as CFloat64,
                DAQMX_VAL_GROUPBYCHANNEL,
                buf.as_mut_ptr(),
                buf_len,
                &mut nread as *mut CInt32,
                std::ptr::null_mut(),
            )
        })
        .map_err(|err| err.runtime(timeout))?;
        if nread as usize != nsamps {
            return Err(TaskError::Fault(format!(
                "read {nread} of {nsamps} samples per channel"
            )));
        }
        Array2::from_shape_vec((nchans, nsamps), buf).map_err(|err| TaskError::Fault(err.to_string()))
    }

    fn clear(&self) -> Result<(), TaskError> {
        if self.cleared.replace(true) {
            return Ok(());
        }
        daqmx_call(|| unsafe { DAQmxClearTask(self.handle) }).map_err(DAQmxError::fault)
    }
}

impl Drop for NiTask {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            log::warn!("Failed to clear DAQmx task: {}", err);
        }
    }
}

/// An NI device addressed by its NI MAX name, e.g. `Dev1` or `PXI1Slot3`.
#[derive(Debug, Clone)]
pub struct NiDevice {
    name: String,
}

impl NiDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl DaqDevice for NiDevice {
    type Task = NiTask;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_task(&self, label: &str) -> Result<NiTask, TaskError> {
        log::debug!("Creating DAQmx {} task on {}", label, self.name);
        NiTask::new()
    }

    fn reset(&self) -> Result<(), TaskError> {
        reset_ni_device(&self.name)
    }
}
