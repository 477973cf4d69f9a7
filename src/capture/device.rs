//! Camera device boundary
//!
//! The driver behind this trait owns the hardware: exposure control, cooling, status sensors
//! and, for cameras with a fast mode, a driver thread that pushes finished frames into a
//! registered callback.

use std::time::Duration;

use thiserror::Error;

use super::frame::FrameGeometry;
use super::options::CameraOption;

/// Status sensor channel that reports how many temperature sensors exist
pub const SENSOR_COUNT_CHANNEL: u32 = 0;

/// Errors reported by the camera driver, matching the vendor status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("camera not connected")]
    NotConnected,
    #[error("operation not implemented by camera")]
    NotImplemented,
    #[error("camera did not respond")]
    NoResponse,
    #[error("invalid function")]
    InvalidFunction,
    #[error("driver not initialized")]
    NotInitialized,
    #[error("operation failed")]
    OperationFailed,
    #[error("invalid password")]
    InvalidPassword,
    /// The camera reported an error state while exposing
    #[error("exposure failed")]
    ExposureFailed,
}

impl DeviceError {
    /// Map a raw driver status code, where 0 means success
    pub fn check(code: i32) -> Result<(), DeviceError> {
        match code {
            0 => Ok(()),
            1 => Err(Self::InvalidParameters),
            2 => Err(Self::NotConnected),
            3 => Err(Self::NotImplemented),
            4 => Err(Self::NoResponse),
            5 => Err(Self::InvalidFunction),
            6 => Err(Self::NotInitialized),
            8 => Err(Self::InvalidPassword),
            _ => Err(Self::OperationFailed),
        }
    }
}

/// Exposure state as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Error,
    Idle,
    Waiting,
    Exposing,
    Reading,
    Downloading,
    Flushing,
}

impl CameraState {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Waiting,
            2 => Self::Exposing,
            3 => Self::Reading,
            4 => Self::Downloading,
            5 => Self::Flushing,
            _ => Self::Error,
        }
    }
}

/// Fast-mode frame notification.
///
/// Invoked on a driver-owned thread with the frame geometry and the raw little-endian 16-bit
/// samples. The driver serializes invocations, which is why this is `FnMut`. The slice is only
/// valid for the duration of the call.
pub type FrameCallback = Box<dyn FnMut(FrameGeometry, &[u8]) + Send + 'static>;

/// Capabilities the acquisition pipeline needs from a connected camera.
///
/// Control calls are blocking but return in bounded time.
pub trait Device: Send + Sync + 'static {
    /// Full-sensor readout geometry, used to size frame buffers up front
    fn sensor_geometry(&self) -> FrameGeometry;

    /// Start a single exposure of the given length
    fn start_exposure(&self, seconds: f32) -> Result<(), DeviceError>;

    /// Stop any running exposure, single or fast mode
    fn stop_exposure(&self) -> Result<(), DeviceError>;

    /// Whether a single exposure has finished and can be fetched
    fn image_ready(&self) -> bool;

    fn camera_state(&self) -> CameraState;

    /// Copy out the last finished single exposure
    fn fetch_image(&self) -> Result<(FrameGeometry, Vec<u8>), DeviceError>;

    fn has_fast_mode(&self) -> bool;

    /// Register (or with `None`, remove) the fast-mode frame callback
    fn set_frame_callback(&self, callback: Option<FrameCallback>) -> Result<(), DeviceError>;

    /// Start continuous exposures that are delivered through the frame callback
    fn start_fast_exposure(&self, exposure: Duration) -> Result<(), DeviceError>;

    /// Raw status sensor reading. Channel 0 returns the number of temperature sensors, channels
    /// from 1 return temperatures in hundredths of a degree Celsius.
    fn query_status(&self, channel: u32) -> Result<i32, DeviceError>;

    /// Cool the sensor toward `setpoint` degrees Celsius
    fn set_cooling(&self, setpoint: i32) -> Result<(), DeviceError>;

    /// Let the cooler warm back up to ambient
    fn warm_up(&self) -> Result<(), DeviceError>;

    fn has_option(&self, _option: CameraOption) -> bool {
        false
    }

    /// Raw option block as the driver reports it
    fn option_data(&self, _option: CameraOption) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::NotImplemented)
    }

    fn set_option_data(&self, _option: CameraOption, _data: &[u8]) -> Result<(), DeviceError> {
        Err(DeviceError::NotImplemented)
    }
}
