use thiserror::Error;

use crate::capture::{CameraOption, DeviceError};

/// Errors surfaced by the acquisition pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Raw buffer length does not match `width * height * 2`
    #[error("invalid frame size: expected {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("camera has no fast mode")]
    FastModeUnsupported,

    /// The camera lacks the option, or gain/offset were set outside the custom preset
    #[error("camera option {0:?} unavailable")]
    OptionUnavailable(CameraOption),

    #[error("{option:?} value {value} outside {min}..={max}")]
    OptionOutOfRange {
        option: CameraOption,
        value: u16,
        min: u16,
        max: u16,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
