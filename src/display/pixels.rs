//! Raw mono16 to displayable RGB24 conversion

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::capture::{Frame, FrameGeometry, BYTES_PER_SAMPLE};
use crate::pipeline::CancelToken;
use crate::Result;

/// Bytes per displayed pixel
pub const RGB_CHANNELS: usize = 3;

/// Render-ready image: row-major, 3 bytes per pixel, R = G = B
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub geometry: FrameGeometry,
    pub sequence: u64,
    pub data: Bytes,
}

impl DisplayFrame {
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Bytes per output row
    pub fn stride(&self) -> usize {
        self.geometry.width as usize * RGB_CHANNELS
    }
}

/// Converts raw mono frames into RGB24 display frames.
///
/// Each output pixel takes the low-order byte of its little-endian 16-bit sample and repeats it
/// across all three channels; the high byte is discarded. Geometry order is preserved.
#[derive(Debug, Clone, Copy)]
pub struct PixelConverter {
    /// Pixels converted between cancellation checks
    check_every: usize,
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl PixelConverter {
    pub fn new(check_every: usize) -> Self {
        Self {
            // Block byte lengths must not overflow
            check_every: check_every.clamp(1, usize::MAX / (BYTES_PER_SAMPLE * RGB_CHANNELS)),
        }
    }

    /// Convert a whole frame
    pub fn convert(&self, frame: &Frame) -> Result<DisplayFrame> {
        frame.geometry.check_raw_len(frame.data.len())?;
        let start = Instant::now();

        let mut rgb = vec![0u8; frame.geometry.pixel_count() * RGB_CHANNELS];
        self.fill_blocks(&frame.data, &mut rgb, || false);

        metrics::histogram!("convert_time_us").record(start.elapsed().as_micros() as f64);
        Ok(DisplayFrame {
            geometry: frame.geometry,
            sequence: frame.sequence,
            data: Bytes::from(rgb),
        })
    }

    /// Convert a frame, giving up between pixel blocks once `cancel` fires.
    ///
    /// Returns `Ok(None)` when cancelled; nothing partially converted is handed out.
    #[instrument(level = "trace", skip_all, fields(sequence = frame.sequence))]
    pub fn convert_cancellable(
        &self,
        frame: &Frame,
        cancel: &CancelToken,
    ) -> Result<Option<DisplayFrame>> {
        frame.geometry.check_raw_len(frame.data.len())?;
        let start = Instant::now();

        let mut rgb = vec![0u8; frame.geometry.pixel_count() * RGB_CHANNELS];
        if !self.fill_blocks(&frame.data, &mut rgb, || cancel.is_cancelled()) {
            debug!("Conversion of frame {} cancelled", frame.sequence);
            return Ok(None);
        }

        metrics::histogram!("convert_time_us").record(start.elapsed().as_micros() as f64);
        Ok(Some(DisplayFrame {
            geometry: frame.geometry,
            sequence: frame.sequence,
            data: Bytes::from(rgb),
        }))
    }

    /// Returns false if `stop` fired before every block was written. `stop` is asked once per
    /// block, so an abort lands within `check_every` pixels.
    fn fill_blocks(&self, raw: &[u8], rgb: &mut [u8], mut stop: impl FnMut() -> bool) -> bool {
        let blocks = raw
            .chunks(self.check_every * BYTES_PER_SAMPLE)
            .zip(rgb.chunks_mut(self.check_every * RGB_CHANNELS));

        for (samples, pixels) in blocks {
            if stop() {
                return false;
            }
            for (sample, pixel) in samples
                .chunks_exact(BYTES_PER_SAMPLE)
                .zip(pixels.chunks_exact_mut(RGB_CHANNELS))
            {
                pixel.fill(sample[0]);
            }
        }
        true
    }
}
