//! Progress tracking and reporting

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar over scenario rounds
pub struct ProgressTracker {
    progress_bar: ProgressBar,
}

impl ProgressTracker {
    /// Create a visible progress bar
    #[must_use]
    pub fn new(total_rounds: u64) -> Self {
        let pb = ProgressBar::new(total_rounds);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} rounds {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        Self { progress_bar: pb }
    }

    /// Create a tracker that draws nothing
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            progress_bar: ProgressBar::hidden(),
        }
    }

    /// Show which scenario is running
    pub fn set_scenario(&self, name: &'static str) {
        self.progress_bar.set_message(name);
    }

    /// Record one finished round
    pub fn round_done(&self) {
        self.progress_bar.inc(1);
    }

    /// Number of rounds recorded so far
    #[must_use]
    pub fn rounds_done(&self) -> u64 {
        self.progress_bar.position()
    }

    pub fn finish(&self) {
        self.progress_bar.finish_with_message("done");
    }
}
