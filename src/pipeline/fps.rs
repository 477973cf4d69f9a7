//! Fast-mode frame rate measurement

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Window {
    frames: u64,
    started: Option<Instant>,
    last_report: Option<Instant>,
}

/// Counts delivered frames and derives frames per second since the first one.
///
/// The first frame only starts the clock, so the rate is `(frames - 1) / elapsed`.
pub struct FpsMeter {
    window: Mutex<Window>,
    /// Latest rate as `f64` bits
    latest: AtomicU64,
    report_every: Duration,
}

impl FpsMeter {
    pub fn new(report_every: Duration) -> Self {
        Self {
            window: Mutex::new(Window::default()),
            latest: AtomicU64::new(0f64.to_bits()),
            report_every,
        }
    }

    /// Record one frame. Returns the current rate when a report is due.
    pub fn tick(&self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&self, now: Instant) -> Option<f64> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.frames += 1;

        let started = *window.started.get_or_insert(now);
        if window.frames < 2 {
            return None;
        }

        let elapsed = now.duration_since(started).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let fps = (window.frames - 1) as f64 / elapsed;
        self.latest.store(fps.to_bits(), Ordering::Relaxed);

        let due = window
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.report_every);
        if due {
            window.last_report = Some(now);
            metrics::gauge!("fast_mode_fps").set(fps);
            Some(fps)
        } else {
            None
        }
    }

    /// Most recently computed rate, 0 before two frames have arrived
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.latest.load(Ordering::Relaxed))
    }

    pub fn frames(&self) -> u64 {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frames
    }

    /// Start counting again, as when fast mode restarts
    pub fn reset(&self) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = Window::default();
        self.latest.store(0f64.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_only_starts_the_clock() {
        let meter = FpsMeter::new(Duration::ZERO);
        let t0 = Instant::now();
        assert_eq!(meter.tick_at(t0), None);
        assert_eq!(meter.fps(), 0.0);

        // 10 more frames over one second
        let mut last = None;
        for i in 1..=10 {
            last = meter.tick_at(t0 + Duration::from_millis(100 * i));
        }
        let fps = last.unwrap();
        assert!((fps - 10.0).abs() < 1e-9);
        assert_eq!(meter.frames(), 11);
    }

    #[test]
    fn reports_are_rate_limited() {
        let meter = FpsMeter::new(Duration::from_millis(500));
        let t0 = Instant::now();
        meter.tick_at(t0);

        assert!(meter.tick_at(t0 + Duration::from_millis(100)).is_some());
        assert!(meter.tick_at(t0 + Duration::from_millis(200)).is_none());
        assert!(meter.tick_at(t0 + Duration::from_millis(700)).is_some());
        // The rate is still tracked between reports
        assert!(meter.fps() > 0.0);
    }

    #[test]
    fn reset_clears_count_and_rate() {
        let meter = FpsMeter::new(Duration::ZERO);
        let t0 = Instant::now();
        meter.tick_at(t0);
        meter.tick_at(t0 + Duration::from_millis(50));
        meter.reset();

        assert_eq!(meter.frames(), 0);
        assert_eq!(meter.fps(), 0.0);
    }
}
