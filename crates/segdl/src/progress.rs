//! Per-stream progress bookkeeping and the single-line status renderer.

use std::time::{Duration, Instant};

use indicatif::{HumanBytes, ProgressStyle};
use tracing::{Span, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Minimum spacing between throughput samples while the meter is running.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(300);

/// Where the status line goes.
///
/// `Terminal` attaches the line to a tracing span; it is drawn only when the
/// subscriber carries a `tracing_indicatif::IndicatifLayer`, which also keeps
/// log lines from tearing through it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressDisplay {
    #[default]
    Hidden,
    Terminal,
}

impl ProgressDisplay {
    pub(crate) fn span(self, stream: &str, round: u32) -> Span {
        match self {
            ProgressDisplay::Hidden => Span::none(),
            ProgressDisplay::Terminal => {
                let span = info_span!("round", stream = %stream, round);
                let style = ProgressStyle::with_template(
                    "{span_child_prefix}{spinner:.green} [{bar:20.green/white}] {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ");
                span.pb_set_style(&style);
                span
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressState {
    pub title: String,
    pub target_count: u64,
    pub completed_count: u64,
    pub target_bytes: u64,
    pub completed_bytes: u64,
    pub last_sample_at: Instant,
    pub last_sample_bytes: u64,
    pub stopped: bool,
}

impl ProgressState {
    fn new(title: String, target_count: u64, now: Instant) -> Self {
        Self {
            title,
            target_count,
            completed_count: 0,
            target_bytes: 0,
            completed_bytes: 0,
            last_sample_at: now,
            last_sample_bytes: 0,
            stopped: false,
        }
    }

    /// Completed fraction, clamped to `1.0` once the target is reached.
    pub fn fraction(&self) -> f64 {
        if self.target_count == 0 || self.completed_count >= self.target_count {
            1.0
        } else {
            self.completed_count as f64 / self.target_count as f64
        }
    }

    pub fn is_done(&self) -> bool {
        self.fraction() >= 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub fraction: f64,
    pub bytes_per_sec: f64,
}

pub struct ProgressMeter {
    state: ProgressState,
    speed: f64,
    span: Span,
}

impl ProgressMeter {
    pub fn new(title: impl Into<String>, target_count: u64) -> Self {
        Self::with_span(title, target_count, Span::none())
    }

    /// Render into the progress bar attached to `span`.
    pub fn with_span(title: impl Into<String>, target_count: u64, span: Span) -> Self {
        span.pb_set_length(target_count);
        Self {
            state: ProgressState::new(title.into(), target_count, Instant::now()),
            speed: 0.0,
            span,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Seed the meter with what the resume scan found already on disk.
    pub fn resume_from(&mut self, completed_count: u64, completed_bytes: u64) {
        self.state.completed_count = completed_count;
        self.state.completed_bytes = completed_bytes;
        self.state.target_bytes = self.state.target_bytes.max(completed_bytes);
        self.state.last_sample_bytes = completed_bytes;
        self.refresh();
    }

    pub fn add_completed_segments(&mut self, n: u64) {
        self.state.completed_count += n;
        self.refresh();
    }

    pub fn add_completed_bytes(&mut self, n: u64) {
        self.state.completed_bytes += n;
        self.refresh();
    }

    /// Take back bytes of a fetch that ended without persisting anything.
    pub fn retract_completed_bytes(&mut self, n: u64) {
        self.state.completed_bytes = self.state.completed_bytes.saturating_sub(n);
        self.state.last_sample_bytes = self.state.last_sample_bytes.min(self.state.completed_bytes);
        self.refresh();
    }

    /// Raise the byte target. Never lowers it within a meter's lifetime.
    pub fn set_target_bytes(&mut self, n: u64) {
        self.state.target_bytes = self.state.target_bytes.max(n);
        self.refresh();
    }

    /// A segment became permanently unfetchable.
    pub fn decrease_target_count(&mut self) {
        self.state.target_count = self.state.target_count.saturating_sub(1);
        self.refresh();
    }

    /// Take a throughput sample at `now`, honouring the [`SAMPLE_INTERVAL`] gate.
    pub fn sample_at(&mut self, now: Instant) -> Option<ThroughputSample> {
        let elapsed = now.saturating_duration_since(self.state.last_sample_at);
        if !self.state.stopped && elapsed < SAMPLE_INTERVAL {
            return None;
        }
        if elapsed.is_zero() {
            return None;
        }

        let delta = self
            .state
            .completed_bytes
            .saturating_sub(self.state.last_sample_bytes);
        self.speed = delta as f64 / elapsed.as_secs_f64();
        self.state.last_sample_at = now;
        self.state.last_sample_bytes = self.state.completed_bytes;

        Some(ThroughputSample {
            fraction: self.state.fraction(),
            bytes_per_sec: self.speed,
        })
    }

    /// Stop the meter and render once more regardless of the sampling gate.
    pub fn finish(&mut self) {
        self.state.stopped = true;
        self.sample_at(Instant::now());
        self.draw();
    }

    pub fn render_line(&self) -> String {
        let state = &self.state;
        let progress = if state.is_done() {
            "done".to_string()
        } else {
            format!("{:.2}%", state.fraction() * 100.0)
        };
        format!(
            "{} {}/{} {} {}/{} {}/s",
            state.title,
            state.completed_count,
            state.target_count,
            progress,
            HumanBytes(state.completed_bytes),
            HumanBytes(state.target_bytes),
            HumanBytes(self.speed as u64),
        )
    }

    fn refresh(&mut self) {
        if self.sample_at(Instant::now()).is_some() {
            self.draw();
        }
    }

    fn draw(&self) {
        self.span.pb_set_length(self.state.target_count);
        self.span.pb_set_position(self.state.completed_count);
        self.span.pb_set_message(&self.render_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_clamps_when_target_reached() {
        let mut meter = ProgressMeter::new("video", 2);
        meter.add_completed_segments(1);
        assert_eq!(meter.state().fraction(), 0.5);
        meter.add_completed_segments(2);
        assert_eq!(meter.state().fraction(), 1.0);
        assert!(meter.render_line().contains("done"));
    }

    #[test]
    fn decreasing_target_can_complete_stream() {
        let mut meter = ProgressMeter::new("audio", 3);
        meter.add_completed_segments(2);
        assert!(!meter.state().is_done());
        meter.decrease_target_count();
        assert_eq!(meter.state().target_count, 2);
        assert!(meter.state().is_done());
    }

    #[test]
    fn retracted_bytes_leave_the_meter() {
        let mut meter = ProgressMeter::new("video", 2);
        meter.resume_from(0, 100);
        meter.add_completed_bytes(50);
        meter.retract_completed_bytes(50);
        assert_eq!(meter.state().completed_bytes, 100);
        meter.retract_completed_bytes(500);
        assert_eq!(meter.state().completed_bytes, 0);
        assert_eq!(meter.state().last_sample_bytes, 0);
    }

    #[test]
    fn target_bytes_never_shrink() {
        let mut meter = ProgressMeter::new("video", 1);
        meter.set_target_bytes(1000);
        meter.set_target_bytes(400);
        assert_eq!(meter.state().target_bytes, 1000);
    }

    #[test]
    fn samples_are_rate_limited_while_running() {
        let mut meter = ProgressMeter::new("video", 4);
        let start = meter.state().last_sample_at;

        meter.state.completed_bytes = 3000;
        let first = meter.sample_at(start + Duration::from_millis(300)).unwrap();
        assert!((first.bytes_per_sec - 10_000.0).abs() < 1e-6);

        meter.state.completed_bytes = 6000;
        assert!(meter.sample_at(start + Duration::from_millis(450)).is_none());
        assert_eq!(meter.state().last_sample_bytes, 3000);
    }

    #[test]
    fn stopped_meter_always_samples() {
        let mut meter = ProgressMeter::new("video", 4);
        let start = meter.state().last_sample_at;
        meter.finish();
        assert!(meter.state().stopped);

        let last = meter.state().last_sample_at.max(start);
        meter.state.completed_bytes += 10;
        assert!(meter.sample_at(last + Duration::from_millis(1)).is_some());
    }

    #[test]
    fn zero_elapsed_skips_sample() {
        let mut meter = ProgressMeter::new("video", 1);
        meter.state.stopped = true;
        let at = meter.state().last_sample_at;
        assert!(meter.sample_at(at).is_none());
    }
}
