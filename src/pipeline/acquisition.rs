//! Consumer-side acquisition workers.
//!
//! Two flavours share one state machine:
//!
//! * streaming: claims the latest fast-mode frame from the [`FrameExchange`], converts it and
//!   hands it to the render sink, until cancelled or the camera reports an error;
//! * single-shot: polls the camera until one exposure is ready, fetches, converts and renders
//!   it once.
//!
//! Cancellation is checked at every loop boundary, after every claim and between pixel blocks
//! of a conversion.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::{CameraState, Device, DeviceError, Frame};
use crate::display::{ExposureStatus, PixelConverter, RenderSink, StatusEvent, StatusSink};
use crate::pipeline::{CancelToken, FrameExchange};
use crate::{Error, PipelineConfig, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    Idle = 0,
    WaitingForReady = 1,
    Converting = 2,
    Published = 3,
    Stopped = 4,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WaitingForReady,
            2 => Self::Converting,
            3 => Self::Published,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Shared view of a worker's current state
#[derive(Debug, Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn get(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: AcquisitionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// How a worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    /// The single exposure was rendered
    Completed,
    Cancelled,
    /// The camera failed or aborted the exposure
    DeviceFailed(DeviceError),
    /// The fetched buffer did not match its geometry
    Malformed,
}

/// Handle to a running acquisition worker thread
pub struct AcquisitionLoop {
    cancel: CancelToken,
    state: StateCell,
    handle: Option<JoinHandle<AcquisitionOutcome>>,
}

impl AcquisitionLoop {
    /// Start the streaming consumer for fast-mode frames.
    ///
    /// A camera error only stops the stream while `fast_mode` is set; otherwise the error
    /// belongs to some other acquisition and the stream keeps waiting.
    pub fn spawn_streaming<D: Device + ?Sized>(
        device: Arc<D>,
        exchange: Arc<FrameExchange>,
        fast_mode: Arc<AtomicBool>,
        render: Arc<dyn RenderSink>,
        status: Arc<dyn StatusSink>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let worker = StreamWorker {
            converter: PixelConverter::new(config.cancel_check_pixels),
            wait: Duration::from_millis(config.stream_wait_ms),
            exchange,
            fast_mode,
            render,
            status,
        };
        Self::spawn("acquisition-stream", move |state, cancel| {
            worker.run(&*device, state, cancel)
        })
    }

    /// Wait for the exposure already started on `device`, then render it once
    pub fn spawn_single_shot<D: Device + ?Sized>(
        device: Arc<D>,
        render: Arc<dyn RenderSink>,
        status: Arc<dyn StatusSink>,
        config: &PipelineConfig,
        sequence: u64,
    ) -> Result<Self> {
        let worker = SingleShotWorker {
            converter: PixelConverter::new(config.cancel_check_pixels),
            poll: Duration::from_millis(config.ready_poll_ms),
            render,
            status,
            sequence,
        };
        Self::spawn("acquisition-exposure", move |state, cancel| {
            worker.run(&*device, state, cancel)
        })
    }

    fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(&StateCell, &CancelToken) -> AcquisitionOutcome + Send + 'static,
    {
        let cancel = CancelToken::new();
        let state = StateCell::default();

        let handle = {
            let cancel = cancel.clone();
            let state = state.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || body(&state, &cancel))?
        };

        Ok(Self {
            cancel,
            state,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> AcquisitionState {
        self.state.get()
    }

    /// Request a cooperative stop. Does not wait.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker to finish on its own
    pub fn join(mut self) -> Result<AcquisitionOutcome> {
        self.join_inner()
    }

    /// Cancel and wait for the worker
    pub fn stop(self) -> Result<AcquisitionOutcome> {
        self.cancel.cancel();
        self.join()
    }

    fn join_inner(&mut self) -> Result<AcquisitionOutcome> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::WorkerPanicked("acquisition")),
            None => Ok(AcquisitionOutcome::Cancelled),
        }
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
            let _ = self.join_inner();
        }
    }
}

struct StreamWorker {
    converter: PixelConverter,
    /// Bounded wait on the exchange between cancellation checks
    wait: Duration,
    exchange: Arc<FrameExchange>,
    /// Set while the camera is exposing in fast mode
    fast_mode: Arc<AtomicBool>,
    render: Arc<dyn RenderSink>,
    status: Arc<dyn StatusSink>,
}

impl StreamWorker {
    #[instrument(name = "stream", skip_all)]
    fn run<D: Device + ?Sized>(
        &self,
        device: &D,
        state: &StateCell,
        cancel: &CancelToken,
    ) -> AcquisitionOutcome {
        info!("Streaming acquisition started");
        state.set(AcquisitionState::WaitingForReady);

        let outcome = loop {
            if cancel.is_cancelled() {
                break AcquisitionOutcome::Cancelled;
            }

            let Some(frame) = self.exchange.claim_timeout(self.wait) else {
                if self.fast_mode.load(Ordering::Acquire)
                    && device.camera_state() == CameraState::Error
                {
                    warn!("Camera reported an error, stopping stream");
                    self.status
                        .publish(StatusEvent::Fault(DeviceError::ExposureFailed));
                    self.status
                        .publish(StatusEvent::Exposure(ExposureStatus::Aborted));
                    break AcquisitionOutcome::DeviceFailed(DeviceError::ExposureFailed);
                }
                continue;
            };

            // A frame claimed after cancellation is released unconverted
            if cancel.is_cancelled() {
                break AcquisitionOutcome::Cancelled;
            }

            state.set(AcquisitionState::Converting);
            match self.converter.convert_cancellable(&frame, cancel) {
                Ok(Some(display)) => {
                    metrics::histogram!("frame_latency_ms")
                        .record(frame.captured_at.elapsed().as_secs_f64() * 1000.0);
                    drop(frame);
                    self.render.render(display);
                    state.set(AcquisitionState::Published);
                }
                Ok(None) => break AcquisitionOutcome::Cancelled,
                Err(e) => warn!("Skipping frame {}: {}", frame.sequence, e),
            }
            state.set(AcquisitionState::WaitingForReady);
        };

        state.set(AcquisitionState::Stopped);
        info!("Streaming acquisition stopped: {:?}", outcome);
        outcome
    }
}

struct SingleShotWorker {
    converter: PixelConverter,
    /// Interval between image-ready polls
    poll: Duration,
    render: Arc<dyn RenderSink>,
    status: Arc<dyn StatusSink>,
    sequence: u64,
}

impl SingleShotWorker {
    #[instrument(name = "exposure", skip_all, fields(sequence = self.sequence))]
    fn run<D: Device + ?Sized>(
        &self,
        device: &D,
        state: &StateCell,
        cancel: &CancelToken,
    ) -> AcquisitionOutcome {
        state.set(AcquisitionState::WaitingForReady);
        self.status
            .publish(StatusEvent::Exposure(ExposureStatus::Waiting));

        let outcome = self.wait_and_render(device, state, cancel);
        match outcome {
            AcquisitionOutcome::Completed => {
                self.status.publish(StatusEvent::Exposure(ExposureStatus::Idle));
                state.set(AcquisitionState::Idle);
            }
            AcquisitionOutcome::DeviceFailed(e) => {
                self.status.publish(StatusEvent::Fault(e));
                self.status
                    .publish(StatusEvent::Exposure(ExposureStatus::Aborted));
                state.set(AcquisitionState::Idle);
            }
            AcquisitionOutcome::Malformed => {
                self.status
                    .publish(StatusEvent::Exposure(ExposureStatus::Aborted));
                state.set(AcquisitionState::Idle);
            }
            AcquisitionOutcome::Cancelled => state.set(AcquisitionState::Stopped),
        }
        debug!("Single exposure finished: {:?}", outcome);
        outcome
    }

    fn wait_and_render<D: Device + ?Sized>(
        &self,
        device: &D,
        state: &StateCell,
        cancel: &CancelToken,
    ) -> AcquisitionOutcome {
        loop {
            if cancel.is_cancelled() {
                return AcquisitionOutcome::Cancelled;
            }
            if device.image_ready() {
                break;
            }
            if device.camera_state() == CameraState::Error {
                return AcquisitionOutcome::DeviceFailed(DeviceError::ExposureFailed);
            }
            if cancel.sleep(self.poll) {
                return AcquisitionOutcome::Cancelled;
            }
        }

        let (geometry, raw) = match device.fetch_image() {
            Ok(image) => image,
            Err(e) => return AcquisitionOutcome::DeviceFailed(e),
        };

        self.status
            .publish(StatusEvent::Exposure(ExposureStatus::Converting));
        state.set(AcquisitionState::Converting);

        let mut frame = match Frame::new(geometry, raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding exposure: {}", e);
                return AcquisitionOutcome::Malformed;
            }
        };
        frame.sequence = self.sequence;

        match self.converter.convert_cancellable(&frame, cancel) {
            Ok(Some(display)) => {
                self.render.render(display);
                state.set(AcquisitionState::Published);
                AcquisitionOutcome::Completed
            }
            Ok(None) => AcquisitionOutcome::Cancelled,
            Err(e) => {
                warn!("Discarding exposure: {}", e);
                AcquisitionOutcome::Malformed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameGeometry, SimulatedCamera};
    use crate::display::{DisplayFrame, NullSink};
    use crate::pipeline::{FpsMeter, FrameProducer};
    use crate::SimulatorConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Render sink that records the sequences it was handed
    #[derive(Default)]
    struct Recorder {
        sequences: Mutex<Vec<u64>>,
        rendered: AtomicUsize,
    }

    impl RenderSink for Recorder {
        fn render(&self, frame: DisplayFrame) {
            self.sequences.lock().unwrap().push(frame.sequence);
            self.rendered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            ready_poll_ms: 5,
            stream_wait_ms: 5,
            ..PipelineConfig::default()
        }
    }

    fn sim(width: u32, height: u32) -> Arc<SimulatedCamera> {
        Arc::new(SimulatedCamera::new(SimulatorConfig {
            width,
            height,
            frame_interval_ms: 1,
            ..SimulatorConfig::default()
        }))
    }

    fn fast_mode_on() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn streaming_renders_in_publish_order() {
        let camera = sim(8, 8);
        let exchange = Arc::new(FrameExchange::new());
        let geometry = FrameGeometry::new(8, 8);
        let mut producer = FrameProducer::new(
            Arc::clone(&exchange),
            geometry,
            Arc::new(FpsMeter::new(Duration::from_secs(1))),
        );
        let recorder = Arc::new(Recorder::default());

        let acquisition = AcquisitionLoop::spawn_streaming(
            camera,
            Arc::clone(&exchange),
            fast_mode_on(),
            recorder.clone(),
            Arc::new(NullSink),
            &config(),
        )
        .unwrap();

        let raw = vec![0x11; geometry.raw_len()];
        for _ in 0..200 {
            producer.on_frame(geometry, &raw);
            thread::sleep(Duration::from_micros(200));
        }
        // The final frame is never superseded, so it must reach the sink
        assert!(wait_until(
            || recorder.sequences.lock().unwrap().last() == Some(&200)
        ));

        assert_eq!(acquisition.stop().unwrap(), AcquisitionOutcome::Cancelled);

        let sequences = recorder.sequences.lock().unwrap();
        assert!(!sequences.is_empty());
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn cancel_while_waiting_never_converts() {
        let camera = sim(4, 4);
        let exchange = Arc::new(FrameExchange::new());
        let recorder = Arc::new(Recorder::default());

        let acquisition = AcquisitionLoop::spawn_streaming(
            camera,
            Arc::clone(&exchange),
            fast_mode_on(),
            recorder.clone(),
            Arc::new(NullSink),
            &config(),
        )
        .unwrap();
        assert!(wait_until(
            || acquisition.state() == AcquisitionState::WaitingForReady
        ));

        acquisition.request_stop();
        assert!(wait_until(|| acquisition.is_finished()));
        assert_eq!(acquisition.state(), AcquisitionState::Stopped);

        // Published after the stop: must never be picked up
        let geometry = FrameGeometry::new(4, 4);
        let mut producer = FrameProducer::new(
            Arc::clone(&exchange),
            geometry,
            Arc::new(FpsMeter::new(Duration::from_secs(1))),
        );
        producer.on_frame(geometry, &vec![1; geometry.raw_len()]);

        assert_eq!(acquisition.join().unwrap(), AcquisitionOutcome::Cancelled);
        assert_eq!(recorder.rendered.load(Ordering::SeqCst), 0);
        assert_eq!(exchange.stats().claimed, 0);
    }

    #[test]
    fn malformed_frame_does_not_stop_streaming() {
        let camera = sim(4, 4);
        let exchange = Arc::new(FrameExchange::new());
        let recorder = Arc::new(Recorder::default());

        let acquisition = AcquisitionLoop::spawn_streaming(
            camera,
            Arc::clone(&exchange),
            fast_mode_on(),
            recorder.clone(),
            Arc::new(NullSink),
            &config(),
        )
        .unwrap();

        // Publish a frame whose buffer disagrees with its geometry, then a good one
        let mut bad = Frame::new(FrameGeometry::new(2, 2), vec![0; 8]).unwrap();
        bad.data.truncate(6);
        exchange.publish(bad);
        assert!(wait_until(|| !exchange.has_unconsumed()));

        let mut good = Frame::new(FrameGeometry::new(2, 2), vec![3; 8]).unwrap();
        good.sequence = 9;
        exchange.publish(good);
        assert!(wait_until(|| recorder.rendered.load(Ordering::SeqCst) == 1));

        acquisition.stop().unwrap();
        assert_eq!(*recorder.sequences.lock().unwrap(), vec![9]);
    }

    #[test]
    fn streaming_stops_on_camera_error() {
        let camera = sim(4, 4);
        let (tx, rx) = flume::unbounded::<StatusEvent>();
        camera.fail_next_exposure();
        camera.start_fast_exposure(Duration::from_millis(1)).unwrap();

        let acquisition = AcquisitionLoop::spawn_streaming(
            Arc::clone(&camera),
            Arc::new(FrameExchange::new()),
            fast_mode_on(),
            Arc::new(NullSink),
            Arc::new(tx),
            &config(),
        )
        .unwrap();

        assert_eq!(
            acquisition.join().unwrap(),
            AcquisitionOutcome::DeviceFailed(DeviceError::ExposureFailed)
        );
        let events: Vec<_> = rx.drain().collect();
        assert!(events.contains(&StatusEvent::Fault(DeviceError::ExposureFailed)));
        assert!(events.contains(&StatusEvent::Exposure(ExposureStatus::Aborted)));
    }

    #[test]
    fn camera_error_outside_fast_mode_leaves_stream_waiting() {
        let camera = sim(4, 4);
        let (tx, rx) = flume::unbounded::<StatusEvent>();
        let fast_mode = Arc::new(AtomicBool::new(false));
        // A failed single exposure puts the camera in its error state
        camera.fail_next_exposure();
        camera.start_exposure(0.01).unwrap();

        let acquisition = AcquisitionLoop::spawn_streaming(
            Arc::clone(&camera),
            Arc::new(FrameExchange::new()),
            Arc::clone(&fast_mode),
            Arc::new(NullSink),
            Arc::new(tx),
            &config(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(!acquisition.is_finished());
        assert_eq!(acquisition.state(), AcquisitionState::WaitingForReady);
        assert!(rx.is_empty());

        // The same error during fast mode is the stream's own
        fast_mode.store(true, Ordering::Release);
        assert_eq!(
            acquisition.join().unwrap(),
            AcquisitionOutcome::DeviceFailed(DeviceError::ExposureFailed)
        );
    }

    #[test]
    fn single_shot_renders_one_frame() {
        let camera = sim(6, 3);
        let (render_tx, render_rx) = flume::bounded::<DisplayFrame>(1);
        let (status_tx, status_rx) = flume::unbounded::<StatusEvent>();
        camera.start_exposure(0.01).unwrap();

        let acquisition = AcquisitionLoop::spawn_single_shot(
            Arc::clone(&camera),
            Arc::new(render_tx),
            Arc::new(status_tx),
            &config(),
            7,
        )
        .unwrap();

        assert_eq!(acquisition.join().unwrap(), AcquisitionOutcome::Completed);
        let frame = render_rx.try_recv().unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!((frame.width(), frame.height()), (6, 3));
        assert_eq!(frame.data.len(), 6 * 3 * 3);

        let statuses: Vec<_> = status_rx.drain().collect();
        assert_eq!(
            statuses,
            vec![
                StatusEvent::Exposure(ExposureStatus::Waiting),
                StatusEvent::Exposure(ExposureStatus::Converting),
                StatusEvent::Exposure(ExposureStatus::Idle),
            ]
        );
    }

    #[test]
    fn single_shot_reports_aborted_exposure() {
        let camera = sim(4, 4);
        let (status_tx, status_rx) = flume::unbounded::<StatusEvent>();
        camera.fail_next_exposure();
        camera.start_exposure(0.01).unwrap();

        let acquisition = AcquisitionLoop::spawn_single_shot(
            Arc::clone(&camera),
            Arc::new(NullSink),
            Arc::new(status_tx),
            &config(),
            1,
        )
        .unwrap();

        assert!(wait_until(|| acquisition.is_finished()));
        // Back to Idle, ready for the caller's next exposure
        assert_eq!(acquisition.state(), AcquisitionState::Idle);
        assert_eq!(
            acquisition.join().unwrap(),
            AcquisitionOutcome::DeviceFailed(DeviceError::ExposureFailed)
        );
        let statuses: Vec<_> = status_rx.drain().collect();
        assert_eq!(
            statuses.last(),
            Some(&StatusEvent::Exposure(ExposureStatus::Aborted))
        );
    }

    #[test]
    fn single_shot_stops_promptly_when_cancelled() {
        let camera = sim(4, 4);
        camera.start_exposure(3600.0).unwrap();
        let recorder = Arc::new(Recorder::default());

        let acquisition = AcquisitionLoop::spawn_single_shot(
            camera,
            recorder.clone(),
            Arc::new(NullSink),
            &PipelineConfig::default(),
            1,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        assert_eq!(acquisition.stop().unwrap(), AcquisitionOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(recorder.rendered.load(Ordering::SeqCst), 0);
    }
}
