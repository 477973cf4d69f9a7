use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use tracing::debug;

use crate::{Error, Result};

/// Bytes per raw mono sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Readout window and binning delivered alongside every raw buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub bin_x: u32,
    pub bin_y: u32,
}

impl FrameGeometry {
    /// Unbinned full-window geometry
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            bin_x: 1,
            bin_y: 1,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Length of the raw little-endian 16-bit buffer this geometry describes
    pub fn raw_len(&self) -> usize {
        self.pixel_count() * BYTES_PER_SAMPLE
    }

    pub fn check_raw_len(&self, actual: usize) -> Result<()> {
        let expected = self.raw_len();
        if actual != expected {
            return Err(Error::InvalidFrameSize { expected, actual });
        }
        Ok(())
    }
}

/// One captured image: geometry plus raw row-major mono16 samples
#[derive(Debug)]
pub struct Frame {
    /// Which slot of the pair owns this buffer
    pub(crate) slot: usize,

    pub geometry: FrameGeometry,

    /// `width * height` little-endian 16-bit samples
    pub data: Vec<u8>,

    /// Producer-assigned, strictly increasing within a session
    pub sequence: u64,

    /// When the driver handed the frame over, for latency tracking
    pub captured_at: Instant,
}

impl Frame {
    fn empty(slot: usize) -> Self {
        Self {
            slot,
            geometry: FrameGeometry::default(),
            data: Vec::new(),
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    /// Build a standalone frame, outside of any slot pair
    pub fn new(geometry: FrameGeometry, data: Vec<u8>) -> Result<Self> {
        geometry.check_raw_len(data.len())?;
        Ok(Self {
            data,
            geometry,
            ..Self::empty(0)
        })
    }

    fn fill(&mut self, geometry: FrameGeometry, raw: &[u8], sequence: u64) {
        self.geometry = geometry;
        // Reuses the existing allocation once the buffer has seen a frame this size
        self.data.clear();
        self.data.extend_from_slice(raw);
        self.sequence = sequence;
        self.captured_at = Instant::now();
    }
}

/// Two preallocated frame buffers the producer alternates between.
///
/// Buffers leave the pair when they are written and come back either through
/// [`FrameSlotPair::restore`] (a frame displaced before anyone claimed it) or through the shared
/// return queue (a frame the consumer has finished with). A buffer is therefore only ever
/// written while the pair holds it, never while the consumer is reading it.
pub struct FrameSlotPair {
    slots: [Option<Frame>; 2],
    /// Slot to write next
    selector: usize,
    returns: Arc<ArrayQueue<Frame>>,
    next_sequence: u64,
}

impl FrameSlotPair {
    /// Allocate both slots sized for `geometry`, with a private return queue
    pub fn new(geometry: FrameGeometry) -> Self {
        Self::with_returns(geometry, Arc::new(ArrayQueue::new(2)))
    }

    /// Allocate both slots sized for `geometry`, taking buffers back through `returns`
    pub fn with_returns(geometry: FrameGeometry, returns: Arc<ArrayQueue<Frame>>) -> Self {
        let mut slots = [Frame::empty(0), Frame::empty(1)];
        for slot in &mut slots {
            slot.data.reserve_exact(geometry.raw_len());
        }
        let [a, b] = slots;

        Self {
            slots: [Some(a), Some(b)],
            selector: 0,
            returns,
            next_sequence: 1,
        }
    }

    /// Queue through which consumers hand buffers back
    pub fn return_queue(&self) -> Arc<ArrayQueue<Frame>> {
        Arc::clone(&self.returns)
    }

    /// Pick up buffers the consumer has handed back
    fn collect_returned(&mut self) {
        while let Some(frame) = self.returns.pop() {
            self.restore(frame);
        }
    }

    /// Put a buffer back into its slot
    pub fn restore(&mut self, frame: Frame) {
        let slot = frame.slot;
        if self.slots[slot].is_none() {
            self.slots[slot] = Some(frame);
        }
    }

    /// True when neither slot is available for writing, even after collecting returns
    pub fn exhausted(&mut self) -> bool {
        self.collect_returned();
        self.slots.iter().all(Option::is_none)
    }

    /// Copy a raw frame into the next free slot and hand the slot out.
    ///
    /// Prefers the selected slot, falls back to the other one, and only allocates when both
    /// buffers are lost (a consumer leaked its claim instead of returning it).
    pub fn write(&mut self, geometry: FrameGeometry, raw: &[u8]) -> Result<Frame> {
        geometry.check_raw_len(raw.len())?;
        self.collect_returned();

        let other = 1 - self.selector;
        let mut frame = match self.slots[self.selector].take() {
            Some(frame) => frame,
            None => match self.slots[other].take() {
                Some(frame) => frame,
                None => {
                    debug!("Both frame slots in flight, allocating slot {}", self.selector);
                    Frame::empty(self.selector)
                }
            },
        };

        frame.fill(geometry, raw, self.next_sequence);
        self.next_sequence += 1;
        self.selector = 1 - frame.slot;
        Ok(frame)
    }

    /// Number of slots currently held by the pair
    pub fn available(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
