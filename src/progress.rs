//! Terminal progress and confirmation for scheduler runs.

use colored::Colorize;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use playgraph::{ConfirmCallback, OperationKey, SchedulerObserver};
use std::io;
use std::time::Duration;

/// Spinner fed by scheduling events
pub struct SpinnerObserver {
    bar: ProgressBar,
    started: bool,
    completed: usize,
    skipped: usize,
}

impl SpinnerObserver {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} done {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self {
            bar,
            started: false,
            completed: 0,
            skipped: 0,
        }
    }

    /// Operations recorded as completed
    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl SchedulerObserver for SpinnerObserver {
    fn on_dispatch(&mut self, key: &OperationKey, host: &str) {
        // Ticking starts late so an earlier confirmation prompt is not overdrawn
        if !self.started {
            self.bar.enable_steady_tick(Duration::from_millis(100));
            self.started = true;
        }
        self.bar.set_message(format!("{key} on {host}"));
    }

    fn on_complete(&mut self, key: &OperationKey) {
        self.completed += 1;
        self.bar.inc(1);
        self.bar.println(format!("  {} {}", "✓".green(), key));
    }

    fn on_skip(&mut self, key: &OperationKey, reason: &str) {
        self.skipped += 1;
        self.bar.inc(1);
        log::debug!("Skipped {key}: {reason}");
    }
}

/// Interactive confirmation, bypassed by `--yes`
pub struct PromptConfirm {
    assume_yes: bool,
}

impl PromptConfirm {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> playgraph::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| playgraph::Error::io("<terminal>", io::Error::other(e)))
    }
}
