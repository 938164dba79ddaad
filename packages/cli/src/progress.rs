//! `indicatif`-backed job progress and logger setup.
//!
//! Job progress is read from the ledger on a timer and pushed into a
//! [`ProgressCallback`], so the engine never knows a terminal is involved.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Receives progress updates for one running job.
pub trait ProgressCallback: Send + Sync {
    /// The source object count is known.
    fn set_total(&self, total: u64);

    /// Objects migrated or failed so far.
    fn set_position(&self, processed: u64);

    /// Replaces the label shown next to the bar.
    fn set_message(&self, msg: String);

    /// The job drained; leave `summary` on screen.
    fn finish(&self, summary: String);

    /// The job ended with an error; remove the bar.
    fn finish_and_clear(&self);
}

/// Terminal progress bar for one job.
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Used once the object count arrives.
    counted_style: ProgressStyle,
}

impl IndicatifProgress {
    /// Creates a bar that spins until the object count is known, then
    /// shows percentage and ETA.
    #[must_use]
    pub fn objects_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} {pos} objects [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let counted_style = ProgressStyle::with_template(
            "  {msg} {wide_bar:.cyan/dim} {pos}/{len} objects {percent}% [{eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        Arc::new(Self { bar, counted_style })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_style(self.counted_style.clone());
    }

    fn set_position(&self, processed: u64) {
        self.bar.set_position(processed);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, summary: String) {
        self.bar.finish_with_message(summary);
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Installs `pretty_env_logger` (filtered by `RUST_LOG`) behind
/// `indicatif-log-bridge` and returns the [`MultiProgress`] job bars are
/// drawn on.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // Fails only if a logger is already installed.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
