//! In-process camera that behaves like a cooled mono camera with a fast mode.
//!
//! Fast-mode frames are produced on a dedicated driver thread and pushed through the registered
//! frame callback, the same way a vendor driver delivers them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::device::{CameraState, Device, DeviceError, FrameCallback, SENSOR_COUNT_CHANNEL};
use super::frame::FrameGeometry;
use super::options::{decode_first, CameraOption, GoPreset, OptionRange};
use crate::pipeline::CancelToken;
use crate::SimulatorConfig;

/// Seconds for the sensor to close ~63% of the gap to its target temperature
const THERMAL_TIME_CONSTANT: f64 = 5.0;

struct Exposure {
    started: Instant,
    duration: Duration,
}

struct Sensor {
    celsius: f64,
    setpoint: Option<i32>,
    updated: Instant,
}

impl Sensor {
    /// Relax toward the setpoint while cooling, toward ambient otherwise
    fn advance(&mut self, ambient: f64, now: Instant) {
        let dt = now.duration_since(self.updated).as_secs_f64();
        let target = self.setpoint.map_or(ambient, f64::from);
        self.celsius += (target - self.celsius) * (1.0 - (-dt / THERMAL_TIME_CONSTANT).exp());
        self.updated = now;
    }
}

struct State {
    connected: bool,
    exposure: Option<Exposure>,
    image: Option<(FrameGeometry, Vec<u8>)>,
    shots: u16,
    failed: bool,
    fail_next: bool,
    sensor: Sensor,
    options: HashMap<CameraOption, Vec<u8>>,
}

struct Driver {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

pub struct SimulatedCamera {
    config: SimulatorConfig,
    state: Mutex<State>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    driver: Mutex<Option<Driver>>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatorConfig) -> Self {
        info!(
            "Simulated camera {}x{}, {} temperature sensor(s)",
            config.width, config.height, config.sensors
        );
        let options = default_options(&config);
        let sensor = Sensor {
            celsius: config.ambient_c,
            setpoint: None,
            updated: Instant::now(),
        };

        Self {
            config,
            state: Mutex::new(State {
                connected: true,
                exposure: None,
                image: None,
                shots: 0,
                failed: false,
                fail_next: false,
                sensor,
                options,
            }),
            callback: Arc::new(Mutex::new(None)),
            driver: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> Result<MutexGuard<'_, State>, DeviceError> {
        let state = self.state();
        if state.connected {
            Ok(state)
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    /// Make the next exposure (single or fast mode) end in the camera's error state
    pub fn fail_next_exposure(&self) {
        self.state().fail_next = true;
    }

    /// Simulate the cable being pulled: every later call fails with `NotConnected`
    pub fn unplug(&self) {
        self.state().connected = false;
        self.stop_driver();
    }

    /// Current sensor temperature in degrees Celsius
    pub fn temperature(&self) -> f64 {
        let mut state = self.state();
        state.sensor.advance(self.config.ambient_c, Instant::now());
        state.sensor.celsius
    }

    pub fn cooling_setpoint(&self) -> Option<i32> {
        self.state().sensor.setpoint
    }

    pub fn fast_mode_running(&self) -> bool {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn stop_driver(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
            if driver.handle.join().is_err() {
                warn!("Simulated driver thread panicked");
            }
            debug!("Simulated fast mode stopped");
        }
    }
}

/// Deterministic test pattern: a diagonal ramp that shifts by one step per frame.
/// High bytes are non-zero so conversion has something to discard.
pub fn fill_test_pattern(buffer: &mut Vec<u8>, geometry: FrameGeometry, frame_no: u16) {
    buffer.clear();
    buffer.reserve(geometry.raw_len());
    for y in 0..geometry.height {
        for x in 0..geometry.width {
            let sample = (x as u16)
                .wrapping_add(y as u16)
                .wrapping_add(frame_no)
                .wrapping_mul(257);
            buffer.extend_from_slice(&sample.to_le_bytes());
        }
    }
}

/// Option blocks of a CMOS camera fresh from power-up
fn default_options(config: &SimulatorConfig) -> HashMap<CameraOption, Vec<u8>> {
    let mut options = HashMap::new();
    if config.cmos_options {
        let gain = OptionRange {
            min: 0,
            max: 1023,
            value: 30,
        };
        let offset = OptionRange {
            min: 0,
            max: 511,
            value: 100,
        };
        options.insert(CameraOption::GoPresetMode, vec![GoPreset::Custom as u8, 0]);
        options.insert(CameraOption::GoCustomGain, gain.encode().to_vec());
        options.insert(CameraOption::GoCustomOffset, offset.encode().to_vec());
        options.insert(CameraOption::PadData, vec![0]);
        options.insert(CameraOption::EvenIllumination, vec![0]);
    }
    if config.fast_mode {
        options.insert(CameraOption::ExposureSpeed, vec![0, 0]);
        options.insert(CameraOption::BitSendMode, vec![0, 0]);
    }
    options
}

fn drive_fast_mode(
    geometry: FrameGeometry,
    interval: Duration,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    cancel: CancelToken,
) {
    let mut buffer = Vec::with_capacity(geometry.raw_len());
    let mut frame_no: u16 = 0;

    while !cancel.is_cancelled() {
        fill_test_pattern(&mut buffer, geometry, frame_no);
        frame_no = frame_no.wrapping_add(1);

        // Holding the lock across the call serializes callback invocations
        if let Some(callback) = callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            callback(geometry, &buffer);
        }

        if cancel.sleep(interval) {
            break;
        }
    }
}

impl Device for SimulatedCamera {
    fn sensor_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.config.width, self.config.height)
    }

    #[instrument(skip(self))]
    fn start_exposure(&self, seconds: f32) -> Result<(), DeviceError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(DeviceError::InvalidParameters);
        }
        let mut state = self.connected()?;
        // A failed exposure leaves the camera free for the next one
        if state.exposure.is_some() && !state.failed {
            return Err(DeviceError::OperationFailed);
        }

        state.failed = std::mem::take(&mut state.fail_next);
        state.image = None;
        state.exposure = Some(Exposure {
            started: Instant::now(),
            duration: Duration::from_secs_f32(seconds),
        });
        Ok(())
    }

    fn stop_exposure(&self) -> Result<(), DeviceError> {
        {
            let mut state = self.connected()?;
            state.exposure = None;
            state.failed = false;
        }
        self.stop_driver();
        Ok(())
    }

    fn image_ready(&self) -> bool {
        let mut state = self.state();
        if state.failed || !state.connected {
            return false;
        }
        if state.image.is_some() {
            return true;
        }

        let finished = state
            .exposure
            .as_ref()
            .is_some_and(|exposure| exposure.started.elapsed() >= exposure.duration);
        if finished {
            let geometry = self.sensor_geometry();
            let mut raw = Vec::new();
            fill_test_pattern(&mut raw, geometry, state.shots);
            state.shots = state.shots.wrapping_add(1);
            state.image = Some((geometry, raw));
            state.exposure = None;
        }
        finished
    }

    fn camera_state(&self) -> CameraState {
        let state = self.state();
        if !state.connected || state.failed {
            return CameraState::Error;
        }
        drop(state);
        if self.fast_mode_running() || self.state().exposure.is_some() {
            CameraState::Exposing
        } else {
            CameraState::Idle
        }
    }

    fn fetch_image(&self) -> Result<(FrameGeometry, Vec<u8>), DeviceError> {
        let state = self.connected()?;
        state.image.clone().ok_or(DeviceError::OperationFailed)
    }

    fn has_fast_mode(&self) -> bool {
        self.config.fast_mode
    }

    fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Result<(), DeviceError> {
        drop(self.connected()?);
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
        Ok(())
    }

    #[instrument(skip(self))]
    fn start_fast_exposure(&self, exposure: Duration) -> Result<(), DeviceError> {
        if !self.config.fast_mode {
            return Err(DeviceError::NotImplemented);
        }
        {
            let mut state = self.connected()?;
            if std::mem::take(&mut state.fail_next) {
                state.failed = true;
                return Ok(());
            }
            state.failed = false;
        }

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return Ok(());
        }

        let cancel = CancelToken::new();
        let geometry = self.sensor_geometry();
        let interval = exposure.max(Duration::from_millis(self.config.frame_interval_ms));
        let callback = Arc::clone(&self.callback);
        let handle = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("sim-driver".into())
                .spawn(move || drive_fast_mode(geometry, interval, callback, cancel))
                .map_err(|_| DeviceError::OperationFailed)?
        };

        *driver = Some(Driver { cancel, handle });
        debug!("Simulated fast mode started, one frame every {:?}", interval);
        Ok(())
    }

    fn query_status(&self, channel: u32) -> Result<i32, DeviceError> {
        let mut state = self.connected()?;
        if channel == SENSOR_COUNT_CHANNEL {
            return Ok(self.config.sensors as i32);
        }
        if channel > self.config.sensors {
            return Err(DeviceError::InvalidParameters);
        }
        state.sensor.advance(self.config.ambient_c, Instant::now());
        Ok((state.sensor.celsius * 100.0).round() as i32)
    }

    fn set_cooling(&self, setpoint: i32) -> Result<(), DeviceError> {
        if self.config.sensors == 0 {
            return Err(DeviceError::NotImplemented);
        }
        let mut state = self.connected()?;
        state.sensor.advance(self.config.ambient_c, Instant::now());
        state.sensor.setpoint = Some(setpoint);
        Ok(())
    }

    fn warm_up(&self) -> Result<(), DeviceError> {
        let mut state = self.connected()?;
        state.sensor.advance(self.config.ambient_c, Instant::now());
        state.sensor.setpoint = None;
        Ok(())
    }

    fn has_option(&self, option: CameraOption) -> bool {
        self.state().options.contains_key(&option)
    }

    fn option_data(&self, option: CameraOption) -> Result<Vec<u8>, DeviceError> {
        let state = self.connected()?;
        state
            .options
            .get(&option)
            .cloned()
            .ok_or(DeviceError::NotImplemented)
    }

    #[instrument(skip(self))]
    fn set_option_data(&self, option: CameraOption, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.connected()?;
        let current = state
            .options
            .get_mut(&option)
            .ok_or(DeviceError::NotImplemented)?;

        match option {
            CameraOption::GoCustomGain | CameraOption::GoCustomOffset => {
                let value = match data {
                    [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                    _ => return Err(DeviceError::InvalidParameters),
                };
                let mut range = OptionRange::decode(current)?;
                if !range.contains(value) {
                    return Err(DeviceError::InvalidParameters);
                }
                range.value = value;
                *current = range.encode().to_vec();
            }
            CameraOption::GoPresetMode => {
                let preset = GoPreset::from_code(decode_first(data)?)?;
                *current = vec![preset as u8, 0];
            }
            _ => {
                decode_first(data)?;
                current.clear();
                current.extend_from_slice(data);
            }
        }
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn camera() -> SimulatedCamera {
        SimulatedCamera::new(SimulatorConfig {
            width: 4,
            height: 3,
            frame_interval_ms: 1,
            ..SimulatorConfig::default()
        })
    }

    #[test]
    fn test_pattern_has_expected_layout() {
        let geometry = FrameGeometry::new(3, 2);
        let mut buffer = Vec::new();
        fill_test_pattern(&mut buffer, geometry, 0);

        assert_eq!(buffer.len(), geometry.raw_len());
        // Sample (x=1, y=1) = 2 * 257 = 0x0202
        assert_eq!(&buffer[8..10], &[0x02, 0x02]);
    }

    #[test]
    fn single_exposure_becomes_ready() {
        let camera = camera();
        assert!(!camera.image_ready());
        camera.start_exposure(0.0).unwrap();
        assert!(camera.image_ready());

        let (geometry, raw) = camera.fetch_image().unwrap();
        assert_eq!(geometry, FrameGeometry::new(4, 3));
        assert_eq!(raw.len(), geometry.raw_len());
        assert_eq!(camera.camera_state(), CameraState::Idle);
    }

    #[test]
    fn failed_exposure_reports_error_state() {
        let camera = camera();
        camera.fail_next_exposure();
        camera.start_exposure(0.0).unwrap();

        assert!(!camera.image_ready());
        assert_eq!(camera.camera_state(), CameraState::Error);

        camera.stop_exposure().unwrap();
        assert_eq!(camera.camera_state(), CameraState::Idle);
    }

    #[test]
    fn fast_mode_invokes_callback_until_stopped() {
        let camera = camera();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        camera
            .set_frame_callback(Some(Box::new(move |geometry, raw| {
                assert_eq!(raw.len(), geometry.raw_len());
                seen.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        camera.start_fast_exposure(Duration::from_millis(1)).unwrap();
        assert_eq!(camera.camera_state(), CameraState::Exposing);
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        camera.stop_exposure().unwrap();

        let stopped_at = count.load(Ordering::SeqCst);
        assert!(stopped_at >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[test]
    fn cooling_pulls_temperature_toward_setpoint() {
        let camera = camera();
        assert_eq!(camera.query_status(SENSOR_COUNT_CHANNEL), Ok(1));
        assert_eq!(camera.query_status(1), Ok(2000));
        assert_eq!(camera.query_status(2), Err(DeviceError::InvalidParameters));

        camera.set_cooling(-10).unwrap();
        assert_eq!(camera.cooling_setpoint(), Some(-10));
        thread::sleep(Duration::from_millis(50));
        assert!(camera.temperature() < 20.0);

        camera.warm_up().unwrap();
        assert_eq!(camera.cooling_setpoint(), None);
    }

    #[test]
    fn unplugged_camera_rejects_calls() {
        let camera = camera();
        camera.unplug();
        assert_eq!(camera.start_exposure(1.0), Err(DeviceError::NotConnected));
        assert_eq!(camera.query_status(1), Err(DeviceError::NotConnected));
        assert_eq!(camera.camera_state(), CameraState::Error);
    }

    #[test]
    fn gain_is_range_checked() {
        let camera = camera();
        assert!(camera.has_option(CameraOption::GoCustomGain));

        camera
            .set_option_data(CameraOption::GoCustomGain, &500u16.to_le_bytes())
            .unwrap();
        let gain = OptionRange::decode(&camera.option_data(CameraOption::GoCustomGain).unwrap())
            .unwrap();
        assert_eq!((gain.max, gain.value), (1023, 500));

        assert_eq!(
            camera.set_option_data(CameraOption::GoCustomGain, &2000u16.to_le_bytes()),
            Err(DeviceError::InvalidParameters)
        );
        assert_eq!(
            camera.set_option_data(CameraOption::GoPresetMode, &[7, 0]),
            Err(DeviceError::InvalidParameters)
        );
    }

    #[test]
    fn options_follow_capabilities() {
        let camera = SimulatedCamera::new(SimulatorConfig {
            fast_mode: false,
            cmos_options: false,
            ..SimulatorConfig::default()
        });
        assert!(!camera.has_option(CameraOption::PadData));
        assert!(!camera.has_option(CameraOption::ExposureSpeed));
        assert_eq!(
            camera.option_data(CameraOption::PadData),
            Err(DeviceError::NotImplemented)
        );
    }
}
