//! Connected-camera session: wires the device, the frame exchange and the worker loops together
//! and exposes the start/stop controls a user interface drives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::options::{encode_flag, encode_word};
use crate::capture::{
    CameraOption, CameraOptions, Device, DeviceError, GoPreset, OptionRange, SENSOR_COUNT_CHANNEL,
};
use crate::display::{ExposureStatus, RenderSink, StatusEvent, StatusSink};
use crate::pipeline::{
    AcquisitionLoop, AcquisitionState, FpsMeter, FrameExchange, FrameProducer, StatusPoller,
};
use crate::{Config, Error, Metrics, Result};

pub struct CameraSession<D: Device> {
    device: Arc<D>,
    config: Config,
    render: Arc<dyn RenderSink>,
    status: Arc<dyn StatusSink>,
    exchange: Arc<FrameExchange>,
    fps: Arc<FpsMeter>,
    options: CameraOptions,
    poller: Option<StatusPoller>,
    stream: Option<AcquisitionLoop>,
    exposure: Option<AcquisitionLoop>,
    exposures: u64,
    cooling: bool,
    /// Shared with the streaming worker, which only treats camera errors as its own while set
    fast_mode: Arc<AtomicBool>,
    connected: bool,
}

impl<D: Device> CameraSession<D> {
    /// Take over a connected camera.
    ///
    /// Starts temperature polling when the camera has a sensor, and when it supports fast mode
    /// installs the frame callback and starts the streaming consumer.
    #[instrument(skip_all)]
    pub fn connect(
        device: Arc<D>,
        config: Config,
        render: Arc<dyn RenderSink>,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let fps = Arc::new(FpsMeter::new(Duration::from_millis(
            config.pipeline.fps_report_ms,
        )));
        let mut session = Self {
            device,
            config,
            render,
            status,
            exchange: Arc::new(FrameExchange::new()),
            fps,
            options: CameraOptions::default(),
            poller: None,
            stream: None,
            exposure: None,
            exposures: 0,
            cooling: false,
            fast_mode: Arc::new(AtomicBool::new(false)),
            connected: true,
        };

        let sensors = match session.device.query_status(SENSOR_COUNT_CHANNEL) {
            Ok(count) => count,
            Err(e) => {
                debug!("Temperature sensor query failed: {}", e);
                0
            }
        };
        if sensors > 0 {
            session.poller = Some(StatusPoller::spawn(
                Arc::clone(&session.device),
                Arc::clone(&session.status),
                session.config.status.clone(),
            )?);
        } else {
            session.status.publish(StatusEvent::NoCooling);
        }

        session.options = CameraOptions::read(&*session.device);
        debug!("Camera options: {:?}", session.options);

        if session.device.has_fast_mode() {
            let producer = FrameProducer::new(
                Arc::clone(&session.exchange),
                session.device.sensor_geometry(),
                Arc::clone(&session.fps),
            )
            .with_status(Arc::clone(&session.status));
            session
                .device
                .set_frame_callback(Some(producer.into_callback()))?;
            session.spawn_stream()?;
        }

        info!(
            "Camera connected ({} temperature sensor(s), fast mode: {})",
            sensors,
            session.device.has_fast_mode()
        );
        Ok(session)
    }

    fn spawn_stream(&mut self) -> Result<()> {
        self.stream = Some(AcquisitionLoop::spawn_streaming(
            Arc::clone(&self.device),
            Arc::clone(&self.exchange),
            Arc::clone(&self.fast_mode),
            Arc::clone(&self.render),
            Arc::clone(&self.status),
            &self.config.pipeline,
        )?);
        Ok(())
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn exchange(&self) -> &Arc<FrameExchange> {
        &self.exchange
    }

    /// Start a single exposure of the configured length
    pub fn start_exposure(&mut self) -> Result<()> {
        let seconds = self.config.capture.exposure_seconds;
        self.start_exposure_for(seconds)
    }

    /// Start a single exposure and a worker that renders it once it is ready
    #[instrument(skip(self))]
    pub fn start_exposure_for(&mut self, seconds: f32) -> Result<()> {
        if self.exposure_in_progress() {
            return Err(DeviceError::OperationFailed.into());
        }
        if let Some(previous) = self.exposure.take() {
            previous.join()?;
        }

        if let Err(e) = self.device.start_exposure(seconds) {
            warn!("Failed to start exposure: {}", e);
            self.status
                .publish(StatusEvent::Exposure(ExposureStatus::FailedToStart));
            return Err(e.into());
        }
        self.status
            .publish(StatusEvent::Exposure(ExposureStatus::Starting));

        self.exposures += 1;
        self.exposure = Some(AcquisitionLoop::spawn_single_shot(
            Arc::clone(&self.device),
            Arc::clone(&self.render),
            Arc::clone(&self.status),
            &self.config.pipeline,
            self.exposures,
        )?);
        Ok(())
    }

    /// Stop the running exposure and abandon any conversion in progress.
    ///
    /// The device stop also ends fast mode.
    pub fn stop_exposure(&mut self) -> Result<()> {
        self.fast_mode.store(false, Ordering::Release);
        let stopped = self.device.stop_exposure();
        self.fps.reset();
        if let Some(worker) = self.exposure.take() {
            worker.stop()?;
        }
        stopped.map_err(Error::from)
    }

    /// Begin continuous fast-mode exposures
    pub fn start_fast_mode(&mut self) -> Result<()> {
        if !self.device.has_fast_mode() {
            return Err(Error::FastModeUnsupported);
        }

        // A stream that stopped on a camera error is restarted here, never automatically
        let restart = self.stream.as_ref().map_or(true, AcquisitionLoop::is_finished);
        if restart {
            if let Some(stream) = self.stream.take() {
                let outcome = stream.join()?;
                debug!("Restarting stream after {:?}", outcome);
            }
            self.exchange.reset();
        }

        self.fps.reset();
        // The camera leaves any earlier error state before a new consumer can observe it
        self.device.start_fast_exposure(Duration::from_millis(
            self.config.capture.fast_exposure_ms,
        ))?;
        self.fast_mode.store(true, Ordering::Release);
        if restart {
            self.spawn_stream()?;
        }
        info!("Fast mode started");
        Ok(())
    }

    pub fn stop_fast_mode(&mut self) -> Result<()> {
        self.fast_mode.store(false, Ordering::Release);
        self.device.stop_exposure()?;
        self.fps.reset();
        info!("Fast mode stopped");
        Ok(())
    }

    pub fn start_cooling(&mut self) -> Result<()> {
        self.device
            .set_cooling(self.config.capture.cooling_setpoint)?;
        self.cooling = true;
        Ok(())
    }

    pub fn stop_cooling(&mut self) -> Result<()> {
        self.device.warm_up()?;
        self.cooling = false;
        Ok(())
    }

    /// Pause or resume temperature polling. Returns false when the camera has no sensor.
    pub fn set_status_polling(&self, enabled: bool) -> bool {
        match self.poller {
            Some(ref poller) => {
                poller.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Camera-specific option values as last read or written
    pub fn options(&self) -> &CameraOptions {
        &self.options
    }

    /// Switch the gain/offset preset. Gain and offset become adjustable under `Custom` only.
    pub fn set_go_preset(&mut self, preset: GoPreset) -> Result<()> {
        self.write_option(CameraOption::GoPresetMode, &encode_word(preset as u16))?;
        self.options = CameraOptions::read(&*self.device);
        Ok(())
    }

    pub fn set_gain(&mut self, value: u16) -> Result<()> {
        self.set_custom(CameraOption::GoCustomGain, value)
    }

    pub fn set_offset(&mut self, value: u16) -> Result<()> {
        self.set_custom(CameraOption::GoCustomOffset, value)
    }

    pub fn set_pad_data(&mut self, enabled: bool) -> Result<()> {
        self.write_option(CameraOption::PadData, &encode_flag(enabled))?;
        self.options.pad_data = Some(enabled);
        Ok(())
    }

    pub fn set_even_illumination(&mut self, enabled: bool) -> Result<()> {
        self.write_option(CameraOption::EvenIllumination, &encode_flag(enabled))?;
        self.options.even_illumination = Some(enabled);
        Ok(())
    }

    /// Fast-mode exposure speed selector
    pub fn set_exposure_speed(&mut self, speed: u8) -> Result<()> {
        self.write_option(CameraOption::ExposureSpeed, &encode_word(speed.into()))?;
        self.options.exposure_speed = Some(speed);
        Ok(())
    }

    /// Fast-mode bit depth selector for frame transfer
    pub fn set_bit_send_mode(&mut self, mode: u8) -> Result<()> {
        self.write_option(CameraOption::BitSendMode, &encode_word(mode.into()))?;
        self.options.bit_send_mode = Some(mode);
        Ok(())
    }

    fn set_custom(&mut self, option: CameraOption, value: u16) -> Result<()> {
        let range = match option {
            CameraOption::GoCustomGain => self.options.gain,
            _ => self.options.offset,
        }
        .ok_or(Error::OptionUnavailable(option))?;
        if !range.contains(value) {
            return Err(Error::OptionOutOfRange {
                option,
                value,
                min: range.min,
                max: range.max,
            });
        }

        self.write_option(option, &encode_word(value))?;
        let updated = Some(OptionRange { value, ..range });
        match option {
            CameraOption::GoCustomGain => self.options.gain = updated,
            _ => self.options.offset = updated,
        }
        Ok(())
    }

    fn write_option(&self, option: CameraOption, data: &[u8]) -> Result<()> {
        if !self.device.has_option(option) {
            return Err(Error::OptionUnavailable(option));
        }
        self.device.set_option_data(option, data)?;
        debug!("Set {:?} to {:?}", option, data);
        Ok(())
    }

    pub fn is_cooling(&self) -> bool {
        self.cooling
    }

    pub fn is_fast_mode(&self) -> bool {
        self.fast_mode.load(Ordering::Acquire)
    }

    pub fn stream_state(&self) -> Option<AcquisitionState> {
        self.stream.as_ref().map(AcquisitionLoop::state)
    }

    /// True while a single exposure is being waited on or converted
    pub fn exposure_in_progress(&self) -> bool {
        self.exposure.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn exposure_state(&self) -> Option<AcquisitionState> {
        self.exposure.as_ref().map(AcquisitionLoop::state)
    }

    pub fn metrics(&self) -> Metrics {
        let stats = self.exchange.stats();
        Metrics {
            frames_published: stats.published,
            frames_claimed: stats.claimed,
            dropped_frames: stats.dropped,
            fast_mode_fps: self.fps.fps(),
        }
    }

    /// Release the camera: stop polling, warm up, stop exposures and workers, unhook the callback
    pub fn disconnect(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let mut first_error = None;

        if let Some(poller) = self.poller.take() {
            record(&mut first_error, poller.stop());
        }

        // Otherwise the camera keeps cooling after disconnect
        if self.cooling {
            record(&mut first_error, self.device.warm_up().map_err(Error::from));
            self.cooling = false;
        }

        self.fast_mode.store(false, Ordering::Release);
        record(
            &mut first_error,
            self.device.stop_exposure().map_err(Error::from),
        );
        for worker in [self.exposure.take(), self.stream.take()].into_iter().flatten() {
            record(&mut first_error, worker.stop().map(drop));
        }

        record(
            &mut first_error,
            self.device.set_frame_callback(None).map_err(Error::from),
        );
        self.exchange.reset();
        self.fps.reset();

        info!("Camera disconnected");
        first_error.map_or(Ok(()), Err)
    }
}

fn record(first_error: &mut Option<Error>, result: Result<()>) {
    if let Err(e) = result {
        warn!("Disconnect step failed: {}", e);
        first_error.get_or_insert(e);
    }
}

impl<D: Device> Drop for CameraSession<D> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
