//! Progress reporting infrastructure
//!
//! Purely observational: nothing in the library ever branches on progress
//! state.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::{borrow::Cow, time::Duration};

/// CLI progress report of ongoing operations
///
/// To avoid corrupted terminal output, you should not write anything to stdout
/// or stderr yourself as long as a report is being displayed. Please use logs
/// for debug messages.
#[derive(Clone, Debug, Default)]
pub struct ProgressReport(MultiProgress);
//
impl ProgressReport {
    /// Prepare to report progress on the cli
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that tracks progress without ever drawing it
    ///
    /// Used by library consumers that have no terminal, and by tests.
    pub fn hidden() -> Self {
        Self(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
    }

    /// Prepare to report on a new asynchronous operation
    pub fn add(
        &self,
        what: impl Into<Cow<'static, str>>,
        config: ProgressConfig,
    ) -> ProgressTracker {
        let what: Cow<'static, str> = what.into();
        let ProgressConfig {
            initial_work,
            show_rate_eta,
        } = config;
        let mut bar = ProgressBar::new(initial_work.into()).with_prefix(what);
        let style_header = "{prefix} {wide_bar} ";
        let style_trailer = match (initial_work, show_rate_eta) {
            (Work::Steps(_), false) => "{pos}/{len}",
            (Work::Steps(_), true) => "{pos}/{len} ({per_sec})",
            (Work::Bytes(_), false) => "{decimal_bytes}/{decimal_total_bytes}",
            (Work::Bytes(_), true) => {
                "{decimal_bytes}/{decimal_total_bytes} ({decimal_bytes_per_sec})"
            }
        };
        bar = bar.with_style(
            ProgressStyle::with_template(&format!("{style_header}{style_trailer}"))
                .expect("all styles above should be valid indicatif styles"),
        );
        // Work of unknown size is tracked, but not shown
        if u64::from(initial_work) > 0 {
            self.0.add(bar.clone());
        }
        ProgressTracker {
            bar,
            report: self.0.clone(),
        }
    }

    /// Prepare to count items whose total is not known in advance
    pub fn add_counter(&self, what: impl Into<Cow<'static, str>>, unit: &str) -> ProgressCounter {
        let what: Cow<'static, str> = what.into();
        let bar = ProgressBar::new_spinner().with_prefix(what).with_style(
            ProgressStyle::with_template(&format!(
                "{{prefix}} {{spinner}} {{human_pos}} {unit} ({{per_sec}})"
            ))
            .expect("the counter style should be a valid indicatif style"),
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        self.0.add(bar.clone());
        ProgressCounter {
            bar,
            report: self.0.clone(),
        }
    }
}

/// Progress bar configuration
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProgressConfig {
    /// Initial length of the progress bar
    initial_work: Work,

    /// Show the completion rate or estimated remaining time, depending on work
    show_rate_eta: bool,
}
//
impl ProgressConfig {
    /// Default configuration, with some initial amount of work
    pub fn new(initial_work: Work) -> Self {
        Self {
            initial_work,
            show_rate_eta: true,
        }
    }

    /// Disable tracking of step completions
    pub fn dont_show_rate_eta(self) -> Self {
        Self {
            show_rate_eta: false,
            ..self
        }
    }
}

/// Work whose progression that can be tracked
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Work {
    /// Steps to be taken, with a precise count display
    Steps(usize),

    /// Bytes to be processed
    Bytes(u64),
}
//
impl From<Work> for u64 {
    fn from(value: Work) -> Self {
        match value {
            Work::Steps(s) => s as u64,
            Work::Bytes(b) => b,
        }
    }
}

/// Mechanism to track progress
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    /// Progress bar for this specific process
    bar: ProgressBar,

    /// Underlying process report
    report: MultiProgress,
}
//
impl ProgressTracker {
    /// Show that a certain amount of progress has been made
    ///
    /// Returns truth that the progress bar has reached its maximum value.
    /// Upstream servers may send more bytes than they announced, in which
    /// case the bar simply saturates.
    pub fn make_progress(&self, progress: u64) -> bool {
        // Track progress
        self.bar.inc(progress);
        let current = self.bar.position();
        let max = self.bar.length().unwrap_or(0);

        // Hide progress bar once done
        let finished = current >= max;
        if finished {
            self.finish();
        }
        finished
    }

    /// Hide the progress bar, whether the work is complete or not
    pub fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
            self.report.remove(&self.bar);
        }
    }
}

/// Mechanism to count items of unknown total
#[derive(Clone, Debug)]
pub struct ProgressCounter {
    /// Spinner for this specific process
    bar: ProgressBar,

    /// Underlying process report
    report: MultiProgress,
}
//
impl ProgressCounter {
    /// Count some more items
    pub fn inc(&self, items: u64) {
        self.bar.inc(items);
    }

    /// Hide the counter
    pub fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
            self.report.remove(&self.bar);
        }
    }
}
