//! Latest-frame hand-off between the driver callback and the acquisition loop

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::{trace, warn};

use crate::capture::{Frame, FrameCallback, FrameGeometry, FrameSlotPair};
use crate::display::{StatusEvent, StatusSink};
use crate::pipeline::FpsMeter;

#[derive(Default)]
struct Stats {
    frames_published: AtomicU64,
    frames_claimed: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Counters since the exchange was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub published: u64,
    pub claimed: u64,
    pub dropped: u64,
}

/// Single-slot hand-off point holding the most recent unclaimed frame.
///
/// `Some` in the slot means a frame has been published and not yet claimed. Publishing over an
/// unclaimed frame drops the older one: delivery is at-most-latest, never duplicated. The lock
/// only ever guards an `Option` swap.
pub struct FrameExchange {
    latest: Mutex<Option<Frame>>,
    published: Condvar,
    /// Buffers handed back by consumers for the producer to reuse
    returns: Arc<ArrayQueue<Frame>>,
    stats: CachePadded<Stats>,
}

impl Default for FrameExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExchange {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            published: Condvar::new(),
            returns: Arc::new(ArrayQueue::new(2)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Frame>> {
        // The guarded Option is valid at every point, so a poisoned lock is still usable
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn return_queue(&self) -> Arc<ArrayQueue<Frame>> {
        Arc::clone(&self.returns)
    }

    /// Producer: make `frame` the latest. Returns the unclaimed frame it displaced, if any.
    pub fn publish(&self, frame: Frame) -> Option<Frame> {
        let sequence = frame.sequence;
        let displaced = self.slot().replace(frame);
        self.published.notify_one();

        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_published").increment(1);
        if let Some(ref old) = displaced {
            trace!("Frame {} replaced by {} before being claimed", old.sequence, sequence);
            self.count_dropped();
        }
        displaced
    }

    /// Consumer: take the latest frame if it has not been claimed yet. Never blocks on a frame.
    pub fn try_claim(&self) -> Option<ClaimedFrame> {
        let frame = self.slot().take()?;
        Some(self.claimed(frame))
    }

    /// Consumer: like [`FrameExchange::try_claim`] but waits up to `timeout` for a publish
    pub fn claim_timeout(&self, timeout: Duration) -> Option<ClaimedFrame> {
        let guard = self.slot();
        let (mut guard, _) = self
            .published
            .wait_timeout_while(guard, timeout, |latest| latest.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        let frame = guard.take()?;
        drop(guard);
        Some(self.claimed(frame))
    }

    fn claimed(&self, frame: Frame) -> ClaimedFrame {
        self.stats.frames_claimed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_claimed").increment(1);
        ClaimedFrame {
            frame: Some(frame),
            returns: Arc::clone(&self.returns),
        }
    }

    /// Producer: pull back the unclaimed frame so its buffer can be rewritten
    pub(crate) fn take_unconsumed(&self) -> Option<Frame> {
        let frame = self.slot().take()?;
        self.count_dropped();
        Some(frame)
    }

    fn count_dropped(&self) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped").increment(1);
    }

    pub fn has_unconsumed(&self) -> bool {
        self.slot().is_some()
    }

    /// Forget any unclaimed frame, as on session teardown. Its buffer goes back to the producer.
    pub fn reset(&self) {
        if let Some(frame) = self.slot().take() {
            let _ = self.returns.push(frame);
        }
    }

    pub fn stats(&self) -> ExchangeStats {
        ExchangeStats {
            published: self.stats.frames_published.load(Ordering::Relaxed),
            claimed: self.stats.frames_claimed.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A claimed frame. Dropping it hands the buffer back to the producer's slot pair.
pub struct ClaimedFrame {
    frame: Option<Frame>,
    returns: Arc<ArrayQueue<Frame>>,
}

impl Deref for ClaimedFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only emptied in drop
        self.frame.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ClaimedFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            // A full queue means the producer already replaced this buffer
            let _ = self.returns.push(frame);
        }
    }
}

impl std::fmt::Debug for ClaimedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedFrame")
            .field("sequence", &self.sequence)
            .field("geometry", &self.geometry)
            .finish()
    }
}

/// Callback-side owner of the slot pair: copies each driver frame into a slot and publishes it
pub struct FrameProducer {
    slots: FrameSlotPair,
    exchange: Arc<FrameExchange>,
    fps: Arc<FpsMeter>,
    status: Option<Arc<dyn StatusSink>>,
}

impl FrameProducer {
    pub fn new(exchange: Arc<FrameExchange>, geometry: FrameGeometry, fps: Arc<FpsMeter>) -> Self {
        Self {
            slots: FrameSlotPair::with_returns(geometry, exchange.return_queue()),
            exchange,
            fps,
            status: None,
        }
    }

    /// Report frame rates to `status`
    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    /// Handle one driver frame. Runs in the driver's callback context and never blocks on the
    /// consumer.
    pub fn on_frame(&mut self, geometry: FrameGeometry, raw: &[u8]) {
        // Reject before touching the exchange so a bad frame never costs the latest good one
        if let Err(e) = geometry.check_raw_len(raw.len()) {
            warn!("Discarding driver frame: {}", e);
            return;
        }

        // With one buffer being converted and the other waiting unclaimed, the waiting frame is
        // about to be superseded anyway; take its buffer back
        if self.slots.exhausted() {
            if let Some(stale) = self.exchange.take_unconsumed() {
                self.slots.restore(stale);
            }
        }

        let frame = match self.slots.write(geometry, raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding driver frame: {}", e);
                return;
            }
        };

        if let Some(displaced) = self.exchange.publish(frame) {
            self.slots.restore(displaced);
        }

        if let Some(fps) = self.fps.tick() {
            if let Some(ref status) = self.status {
                status.publish(StatusEvent::Fps(fps));
            }
        }
    }

    pub fn into_callback(mut self) -> FrameCallback {
        Box::new(move |geometry, raw| self.on_frame(geometry, raw))
    }
}
