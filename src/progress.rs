//! Progress reporting. A passive sink for the traversal engine; nothing here
//! can fail or stall an export.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::types::MessageId;

/// How one message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Downloaded { bytes: u64, deduplicated: bool },
    /// Retries exhausted; parked in the retry set.
    Deferred { reason: String },
    Failed { reason: String },
    Skipped { reason: &'static str },
    /// Metadata exported, no media to fetch.
    Exported,
    /// Retry-set entry dropped without another attempt.
    Dropped { reason: &'static str },
    /// Dry run: would have been downloaded.
    WouldDownload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResolved {
    pub message_id: MessageId,
    pub resolution: Resolution,
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningTotals {
    pub scanned: u64,
    pub downloaded: u64,
    pub deferred: u64,
    pub failed: u64,
    pub skipped: u64,
    pub exported: u64,
    pub bytes: u64,
}

impl RunningTotals {
    pub fn apply(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Downloaded {
                bytes,
                deduplicated,
            } => {
                self.downloaded += 1;
                // An identical file was already archived; nothing new is stored.
                if !deduplicated {
                    self.bytes += bytes;
                }
            }
            Resolution::Deferred { .. } => self.deferred += 1,
            Resolution::Failed { .. } => self.failed += 1,
            Resolution::Skipped { .. } | Resolution::Dropped { .. } => self.skipped += 1,
            Resolution::Exported => {}
            Resolution::WouldDownload => self.downloaded += 1,
        }
    }
}

pub trait ProgressSink {
    fn on_item_resolved(&self, item: &ItemResolved, totals: &RunningTotals);

    /// Run `f` with any live terminal output cleared, so log lines do not
    /// tear through a progress bar.
    fn suspend(&self, f: &mut dyn FnMut()) {
        f();
    }

    fn finish(&self) {}
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_item_resolved(&self, _item: &ItemResolved, _totals: &RunningTotals) {}
}

/// Spinner with running counters, rendered with indicatif.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    /// Hidden when the user passed `--no-progress-bar` or stdout is not a
    /// TTY (piped output, cron jobs).
    pub fn new(no_progress_bar: bool) -> Self {
        if no_progress_bar || !std::io::stdout().is_terminal() {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    #[cfg(test)]
    fn is_hidden(&self) -> bool {
        self.bar.is_hidden()
    }
}

impl ProgressSink for ProgressBarSink {
    fn on_item_resolved(&self, item: &ItemResolved, totals: &RunningTotals) {
        self.bar.set_message(format!(
            "#{}  {} downloaded, {} deferred, {} failed, {} skipped ({})",
            item.message_id,
            totals.downloaded,
            totals.deferred,
            totals.failed,
            totals.skipped,
            format_size(totals.bytes)
        ));
    }

    fn suspend(&self, f: &mut dyn FnMut()) {
        self.bar.suspend(f);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// End-of-run figures, logged as a `── Summary ──` block.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub totals: RunningTotals,
    pub elapsed: Duration,
    pub retry_pending: usize,
    pub interrupted: bool,
    pub dry_run: bool,
}

impl RunSummary {
    /// Share of attempted downloads that ended on disk, in percent.
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.totals.downloaded + self.totals.deferred + self.totals.failed;
        if attempted == 0 {
            return None;
        }
        Some(self.totals.downloaded as f64 * 100.0 / attempted as f64)
    }

    pub fn log(&self) {
        if self.dry_run {
            tracing::info!("── Dry Run Summary ──");
            tracing::info!(
                "  {} scanned, {} would be downloaded, {} skipped",
                self.totals.scanned,
                self.totals.downloaded,
                self.totals.skipped
            );
            return;
        }
        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} scanned, {} downloaded ({}), {} skipped",
            self.totals.scanned,
            self.totals.downloaded,
            format_size(self.totals.bytes),
            self.totals.skipped
        );
        tracing::info!(
            "  {} deferred, {} failed permanently, {} pending retry",
            self.totals.deferred,
            self.totals.failed,
            self.retry_pending
        );
        if self.totals.exported > 0 {
            tracing::info!("  {} messages exported", self.totals.exported);
        }
        if let Some(rate) = self.success_rate() {
            tracing::info!("  success rate: {:.1}%", rate);
        }
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
        if self.interrupted {
            tracing::info!("  interrupted, the next run resumes where this one stopped");
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
