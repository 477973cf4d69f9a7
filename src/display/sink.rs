//! Outbound edges of the pipeline: where finished frames and status updates go.
//!
//! Both sinks are fire-and-forget. Implementations must never block the caller, because the
//! callers are the driver callback, the acquisition loop and the status poller.

use std::fmt;

use tracing::{debug, trace};

use crate::capture::DeviceError;
use crate::display::DisplayFrame;
use crate::pipeline::StatusSample;

/// Receives render-ready frames, typically a UI image control
pub trait RenderSink: Send + Sync {
    fn render(&self, frame: DisplayFrame);
}

/// Human-facing exposure progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureStatus {
    Starting,
    Waiting,
    Converting,
    Idle,
    FailedToStart,
    Aborted,
}

impl fmt::Display for ExposureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Starting => "Starting Exposure",
            Self::Waiting => "Waiting For Image",
            Self::Converting => "Converting",
            Self::Idle => "Idle",
            Self::FailedToStart => "Failed To Start Exposure",
            Self::Aborted => "Exposure Aborted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Temperature(StatusSample),
    /// The connected camera has no temperature sensor
    NoCooling,
    Exposure(ExposureStatus),
    /// Fast-mode frames per second
    Fps(f64),
    /// A device error stopped an acquisition
    Fault(DeviceError),
}

/// Receives status updates, typically labels in a UI
pub trait StatusSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

impl RenderSink for flume::Sender<DisplayFrame> {
    fn render(&self, frame: DisplayFrame) {
        match self.try_send(frame) {
            Ok(()) => metrics::counter!("display_frames_rendered").increment(1),
            Err(flume::TrySendError::Full(frame)) => {
                trace!("Render queue full, discarding frame {}", frame.sequence);
                metrics::counter!("display_frames_discarded").increment(1);
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                debug!("Render receiver gone");
            }
        }
    }
}

impl StatusSink for flume::Sender<StatusEvent> {
    fn publish(&self, event: StatusEvent) {
        if let Err(e) = self.try_send(event) {
            trace!("Status update dropped: {}", e);
        }
    }
}

/// Sink that swallows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn render(&self, _frame: DisplayFrame) {}
}

impl StatusSink for NullSink {
    fn publish(&self, _event: StatusEvent) {}
}
