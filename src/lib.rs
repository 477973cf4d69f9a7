pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{Error, Result};
pub use session::CameraSession;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub status: StatusConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Single exposure length
    pub exposure_seconds: f32,
    /// Per-frame exposure in fast mode
    pub fast_exposure_ms: u64,
    /// Cooling target in degrees Celsius
    pub cooling_setpoint: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ready_poll_ms: u64, // Single-exposure readiness polling
    pub stream_wait_ms: u64, // Streaming wait on the exchange between cancellation checks
    pub cancel_check_pixels: usize,
    pub render_queue: usize,
    pub fps_report_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub temperature_channel: u32,
    pub interval_ms: u64,
    /// Raw reading to degrees Celsius
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub width: u32,
    pub height: u32,
    pub frame_interval_ms: u64,
    pub ambient_c: f64,
    pub sensors: u32,
    pub fast_mode: bool,
    /// Expose gain/offset presets, pad data and even illumination
    pub cmos_options: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            exposure_seconds: 2.0,
            fast_exposure_ms: 1,
            cooling_setpoint: -10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ready_poll_ms: 100,
            stream_wait_ms: 10,
            cancel_check_pixels: 4096,
            render_queue: 4,
            fps_report_ms: 500,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            temperature_channel: 1,
            interval_ms: 1000,
            scale: 0.01,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_interval_ms: 33, // ~30fps
            ambient_c: 20.0,
            sensors: 1,
            fast_mode: true,
            cmos_options: true,
        }
    }
}

/// Pipeline counters and rates at a point in time
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub frames_published: u64,
    pub frames_claimed: u64,
    pub dropped_frames: u64,
    pub fast_mode_fps: f64,
}
