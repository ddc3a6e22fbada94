//! Dispatcher statistics and the periodic reporting window.

use std::time::{Duration, Instant};

use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    /// Blocks executed by either tier.
    pub blocks_executed: u64,
    /// Subset of `blocks_executed` that ran as compiled code.
    pub compiled_blocks_executed: u64,
    pub blocks_compiled: u64,
    pub compile_failures: u64,
    pub invalidations: u64,
    pub compile_time: Duration,
}

/// Rates over one reporting window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsReport {
    pub window: Duration,
    pub blocks_per_sec: f64,
    pub compiled_percent: f64,
    pub compile_time_percent: f64,
}

pub trait StatsSink {
    fn report(&mut self, report: &StatsReport);
}

/// Logs each report at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

impl StatsSink for TracingStatsSink {
    fn report(&mut self, report: &StatsReport) {
        info!(
            blocks_per_sec = report.blocks_per_sec,
            compiled_percent = report.compiled_percent,
            compile_time_percent = report.compile_time_percent,
            "jit stats"
        );
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsWindow {
    opened: Option<(Instant, JitStats)>,
}

impl StatsWindow {
    /// Returns a report once `interval` has elapsed since the window opened, then reopens it.
    pub(crate) fn poll(
        &mut self,
        now: Instant,
        interval: Duration,
        current: &JitStats,
    ) -> Option<StatsReport> {
        let Some((opened_at, baseline)) = self.opened else {
            self.opened = Some((now, *current));
            return None;
        };
        let window = now.saturating_duration_since(opened_at);
        if window < interval || window.is_zero() {
            return None;
        }
        self.opened = Some((now, *current));

        let executed = current.blocks_executed - baseline.blocks_executed;
        let compiled = current.compiled_blocks_executed - baseline.compiled_blocks_executed;
        let compile_time = current.compile_time.saturating_sub(baseline.compile_time);
        let secs = window.as_secs_f64();
        Some(StatsReport {
            window,
            blocks_per_sec: executed as f64 / secs,
            compiled_percent: if executed == 0 {
                0.0
            } else {
                compiled as f64 * 100.0 / executed as f64
            },
            compile_time_percent: compile_time.as_secs_f64() * 100.0 / secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_opens_window_and_later_polls_report_deltas() {
        let t0 = Instant::now();
        let mut window = StatsWindow::default();
        let mut stats = JitStats::default();
        assert!(window.poll(t0, Duration::from_secs(1), &stats).is_none());

        stats.blocks_executed = 200;
        stats.compiled_blocks_executed = 50;
        stats.compile_time = Duration::from_millis(100);
        assert!(window
            .poll(t0 + Duration::from_millis(500), Duration::from_secs(1), &stats)
            .is_none());

        let report = window
            .poll(t0 + Duration::from_secs(2), Duration::from_secs(1), &stats)
            .unwrap();
        assert_eq!(report.window, Duration::from_secs(2));
        assert!((report.blocks_per_sec - 100.0).abs() < 1e-9);
        assert!((report.compiled_percent - 25.0).abs() < 1e-9);
        assert!((report.compile_time_percent - 5.0).abs() < 1e-9);

        // The next window starts from the new baseline.
        stats.blocks_executed += 10;
        let report = window
            .poll(t0 + Duration::from_secs(3), Duration::from_secs(1), &stats)
            .unwrap();
        assert!((report.blocks_per_sec - 10.0).abs() < 1e-9);
        assert_eq!(report.compiled_percent, 0.0);
    }
}
