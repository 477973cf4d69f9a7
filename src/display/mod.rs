pub mod pixels;
pub mod sink;

pub use pixels::{DisplayFrame, PixelConverter, RGB_CHANNELS};
pub use sink::{ExposureStatus, NullSink, RenderSink, StatusEvent, StatusSink};
