//! Continuous (live view) scanning on a background thread.
//!
//! [`ScanWorker::spawn`] repeats the same [`ScanRequest`] back to back and publishes every frame,
//! or the error that ended the loop, on a crossbeam channel. [`ScanWorker::stop`] only sets the
//! cancel token: a frame already running on the hardware completes (or times out) before the
//! worker exits.
//!
//! The channel holds at most [`FRAME_QUEUE_CAPACITY`] frames. When the consumer falls behind,
//! the oldest queued frame is dropped so a live view always receives the newest ones.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::DaqDevice;
use crate::scanner::{ScanFrame, ScanRequest, Scanner};
use crate::utils::CancelToken;

/// Frames kept waiting for the consumer.
pub const FRAME_QUEUE_CAPACITY: usize = 4;

/// Queues `item`, evicting the oldest queued item when the queue is full.
fn publish<T>(sender: &Sender<T>, evict: &Receiver<T>, item: T) {
    if let Err(TrySendError::Full(item)) = sender.try_send(item) {
        log::debug!("Frame queue full, dropping the oldest frame");
        let _ = evict.try_recv();
        let _ = sender.try_send(item);
    }
}

pub struct ScanWorker {
    handle: Option<JoinHandle<AcqResult<usize>>>,
    cancel: CancelToken,
    frames: Receiver<AcqResult<ScanFrame>>,
}

impl ScanWorker {
    pub fn spawn<D: DaqDevice + 'static>(scanner: Arc<Scanner<D>>, request: ScanRequest) -> Self {
        let cancel = CancelToken::new();
        let (sender, frames) = bounded(FRAME_QUEUE_CAPACITY);
        let evict = frames.clone();
        let worker_cancel = cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut count = 0;
            while !worker_cancel.is_cancelled() {
                match scanner.scan(&request, &worker_cancel) {
                    Ok(frame) => {
                        count += 1;
                        publish(&sender, &evict, Ok(frame));
                    }
                    Err(AcquisitionError::Cancelled) => break,
                    Err(err) => {
                        log::error!("Scan worker stopped: {err}");
                        publish(&sender, &evict, Err(err.clone()));
                        return Err(err);
                    }
                }
            }
            log::info!("Scan worker finished after {count} frames");
            Ok(count)
        });
        Self {
            handle: Some(handle),
            cancel,
            frames,
        }
    }

    /// Frames in acquisition order, at most [`FRAME_QUEUE_CAPACITY`] of them queued.
    pub fn frames(&self) -> &Receiver<AcqResult<ScanFrame>> {
        &self.frames
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Stops the worker and waits for it. Returns the number of frames acquired, or the error
    /// that ended the loop.
    pub fn join(mut self) -> AcqResult<usize> {
        self.stop();
        self.wait()
    }

    fn wait(&mut self) -> AcqResult<usize> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(AcquisitionError::HardwareFault {
                    stage: "continuous scan".into(),
                    msg: "scan worker panicked".into(),
                })
            }),
            None => Ok(0),
        }
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        self.stop();
        if let Err(err) = self.wait() {
            log::warn!("Scan worker ended with error: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimFault, SimOp, SimResponse};
    use rastercompiler_backend::ScanParams;
    use std::time::Duration;

    fn request() -> ScanRequest {
        ScanRequest::new(
            ScanParams {
                numsteps_x: 3,
                numsteps_y: 2,
                padding_steps: 0,
                dwell_time: 1e-6,
                ..ScanParams::default()
            },
            &["ao0", "ao1"],
            &["ai0"],
        )
    }

    #[test]
    fn streams_frames_until_stopped() {
        let scanner = Arc::new(Scanner::new(SimDevice::new("Dev1", SimResponse::Constant(2.0))));
        let worker = ScanWorker::spawn(scanner, request());
        for _ in 0..3 {
            let frame = worker
                .frames()
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap();
            assert_eq!(frame.mean_intensity(0), Some(2.0));
        }
        let count = worker.join().unwrap();
        assert!(count >= 3);
    }

    #[test]
    fn slow_consumer_keeps_the_newest_frames() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(1.0));
        let worker = ScanWorker::spawn(Arc::new(Scanner::new(device.clone())), request());
        let enough = 2 * (FRAME_QUEUE_CAPACITY + 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let starts = || device.events().iter().filter(|e| e.op == SimOp::Start).count();
        // Two started tasks per frame
        while starts() < 2 * enough && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        while !worker.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(worker.frames().len(), FRAME_QUEUE_CAPACITY);
        let count = worker.join().unwrap();
        assert!(count >= enough);
    }

    #[test]
    fn error_is_published_and_ends_loop() {
        let device = SimDevice::new("Dev1", SimResponse::Constant(0.0));
        device.inject_fault(SimFault::TimeoutOnWait);
        let worker = ScanWorker::spawn(Arc::new(Scanner::new(device.clone())), request());
        let first = worker.frames().recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, Err(AcquisitionError::AcquisitionTimeout { .. })));
        assert!(matches!(
            worker.join(),
            Err(AcquisitionError::AcquisitionTimeout { .. })
        ));
        assert_eq!(device.live_tasks(), 0);
    }
}
