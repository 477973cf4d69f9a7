pub mod device;
pub mod frame;
pub mod options;
pub mod sim;

pub use device::{CameraState, Device, DeviceError, FrameCallback, SENSOR_COUNT_CHANNEL};
pub use frame::{Frame, FrameGeometry, FrameSlotPair, BYTES_PER_SAMPLE};
pub use options::{CameraOption, CameraOptions, GoPreset, OptionRange};
pub use sim::SimulatedCamera;
