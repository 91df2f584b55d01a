//! Tumbling-window frame rate estimation.
//!
//! Each monitored stream owns one [`FrameRateMonitor`]. The monitor counts
//! frames in fixed five second buckets; the reported rate only changes when a
//! bucket closes.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Length of one measurement window.
pub const WINDOW: Duration = Duration::from_secs(5);

/// Frames per second measured over one closed window.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Rate(f64);

impl Rate {
    pub fn new(frames_per_second: f64) -> Self {
        Self(frames_per_second)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.0)
    }
}

/// Mutable window state of one stream.
#[derive(Debug, Clone, Default)]
pub struct FpsWindow {
    start: Option<Instant>,
    frame_count: u64,
    last_rate: Option<Rate>,
}

impl FpsWindow {
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_rate(&self) -> Option<Rate> {
        self.last_rate
    }
}

/// Per-stream frame rate monitor.
///
/// Not synchronized: a single execution context advances a given monitor.
#[derive(Debug, Clone)]
pub struct FrameRateMonitor {
    stream_id: u32,
    window: FpsWindow,
}

impl FrameRateMonitor {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            window: FpsWindow::default(),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn window(&self) -> &FpsWindow {
        &self.window
    }

    /// Count one frame observed at `now`.
    ///
    /// The first call only opens the window. Returns the rate of the window
    /// that just closed, otherwise the last known rate.
    pub fn advance(&mut self, now: Instant) -> Option<Rate> {
        let start = *self.window.start.get_or_insert(now);
        self.window.frame_count += 1;

        if now.saturating_duration_since(start) > WINDOW {
            let rate = Rate(self.window.frame_count as f64 / WINDOW.as_secs_f64());
            self.window.frame_count = 0;
            self.window.start = Some(now);
            self.window.last_rate = Some(rate);
            info!("**PERF: stream {} FPS: {}", self.stream_id, rate);
        }

        self.window.last_rate
    }

    /// Count one frame at the current instant.
    pub fn tick(&mut self) -> Option<Rate> {
        self.advance(Instant::now())
    }

    /// Last closed-window rate, without counting a frame.
    pub fn current(&self) -> Option<Rate> {
        self.window.last_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_opens_window() {
        let mut monitor = FrameRateMonitor::new(0);
        let t0 = Instant::now() + Duration::from_secs(60);

        assert_eq!(monitor.advance(t0), None);
        assert_eq!(monitor.window().frame_count(), 1);
        assert_eq!(monitor.current(), None);
    }

    #[test]
    fn test_rate_unchanged_inside_window() {
        let mut monitor = FrameRateMonitor::new(0);
        let t0 = Instant::now();

        for i in 0..50 {
            let rate = monitor.advance(t0 + Duration::from_millis(i * 100));
            assert_eq!(rate, None);
        }
        assert_eq!(monitor.window().frame_count(), 50);
    }

    #[test]
    fn test_window_closes_strictly_after_five_seconds() {
        let mut monitor = FrameRateMonitor::new(0);
        let t0 = Instant::now();

        monitor.advance(t0);
        assert_eq!(monitor.advance(t0 + WINDOW), None);

        let rate = monitor.advance(t0 + WINDOW + Duration::from_millis(1));
        assert_eq!(rate, Some(Rate::new(3.0 / 5.0)));
        assert_eq!(monitor.window().frame_count(), 0);
    }

    #[test]
    fn test_previous_rate_returned_until_next_close() {
        let mut monitor = FrameRateMonitor::new(1);
        let t0 = Instant::now();

        for i in 0..=10 {
            monitor.advance(t0 + Duration::from_millis(i * 510));
        }
        let first = monitor.current().unwrap();
        assert_eq!(first, Rate::new(11.0 / 5.0));

        let t1 = t0 + Duration::from_millis(5100);
        for i in 1..20 {
            let rate = monitor.advance(t1 + Duration::from_millis(i * 100));
            assert_eq!(rate, Some(first));
        }
    }

    #[test]
    fn test_rate_display_one_decimal() {
        assert_eq!(Rate::new(29.96).to_string(), "30.0");
        assert_eq!(Rate::new(0.0).to_string(), "0.0");
        assert_eq!(Rate::new(12.34).to_string(), "12.3");
    }
}
