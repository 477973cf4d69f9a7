//! Periodic device status polling, independent of frame flow

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::capture::Device;
use crate::display::{StatusEvent, StatusSink};
use crate::pipeline::CancelToken;
use crate::{Error, Result, StatusConfig};

/// One raw sensor reading and the factor that turns it into physical units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusSample {
    pub channel: u32,
    pub raw: i32,
    pub scale: f64,
}

impl StatusSample {
    /// Reading in physical units (degrees Celsius for temperature channels)
    pub fn value(&self) -> f64 {
        f64::from(self.raw) * self.scale
    }
}

/// Background loop that queries one status channel at a fixed interval.
///
/// Polling can be paused and resumed with [`StatusPoller::set_enabled`]; either change is seen
/// within one interval. A failed query publishes nothing for that cycle.
pub struct StatusPoller {
    enabled: Arc<AtomicBool>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn spawn<D: Device + ?Sized>(
        device: Arc<D>,
        sink: Arc<dyn StatusSink>,
        config: StatusConfig,
    ) -> Result<Self> {
        info!(
            "Status polling channel {} every {} ms",
            config.temperature_channel, config.interval_ms
        );
        let enabled = Arc::new(AtomicBool::new(true));
        let cancel = CancelToken::new();

        let handle = {
            let enabled = Arc::clone(&enabled);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("status-poller".into())
                .spawn(move || poll_loop(&*device, &*sink, &config, &enabled, &cancel))?
        };

        Ok(Self {
            enabled,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for it to exit
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::WorkerPanicked("status poller")),
            None => Ok(()),
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn poll_loop<D: Device + ?Sized>(
    device: &D,
    sink: &dyn StatusSink,
    config: &StatusConfig,
    enabled: &AtomicBool,
    cancel: &CancelToken,
) {
    let interval = Duration::from_millis(config.interval_ms);

    while !cancel.is_cancelled() {
        if enabled.load(Ordering::Relaxed) {
            match device.query_status(config.temperature_channel) {
                Ok(raw) => {
                    let sample = StatusSample {
                        channel: config.temperature_channel,
                        raw,
                        scale: config.scale,
                    };
                    metrics::gauge!("camera_temperature_c").set(sample.value());
                    sink.publish(StatusEvent::Temperature(sample));
                }
                Err(e) => debug!("Status query failed: {}", e),
            }
        }

        if cancel.sleep(interval) {
            break;
        }
    }
    debug!("Status poller stopped");
}
