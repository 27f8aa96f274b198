//! Terminal progress for convergence passes.

use colored::Colorize;
use convergence::{ProgressCallback, StepError, StepReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar over the steps of a pass, with one line per finished step.
///
/// Hidden when `quiet`; the bar is cleared on drop so an error that ends the
/// pass early leaves a clean terminal.
pub struct PassProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl PassProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            quiet,
        }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            self.bar.suspend(|| println!("{text}"));
        }
    }
}

impl ProgressCallback for PassProgress {
    fn on_pass_start(&mut self, pipeline: &str, total: usize, resume_at: usize) {
        if self.quiet {
            return;
        }

        self.bar = ProgressBar::new(total as u64);
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        self.bar.enable_steady_tick(Duration::from_millis(120));

        if resume_at > 0 {
            self.line(format!(
                "{} Resuming {} at step {}/{}",
                "↻".cyan(),
                pipeline.bold(),
                resume_at + 1,
                total
            ));
        }
    }

    fn on_step_start(&mut self, _index: usize, id: &str, _description: &str) {
        self.bar.set_message(id.to_string());
    }

    fn on_retry(
        &mut self,
        id: &str,
        attempt: u32,
        max_attempts: u32,
        error: &StepError,
        delay: Duration,
    ) {
        self.line(format!(
            "  {} {} attempt {}/{} failed: {} (retrying in {}s)",
            "⚠".yellow(),
            id,
            attempt,
            max_attempts,
            error,
            delay.as_secs()
        ));
    }

    fn on_step_complete(&mut self, id: &str, report: &StepReport) {
        self.bar.inc(1);

        let text = match report {
            StepReport::Skipped { reason } => {
                format!("  {} {} {}", "·".dimmed(), id.dimmed(), format!("({reason})").dimmed())
            }
            StepReport::Applied { attempts } => {
                format!("  {} {}{}", "✓".green(), id, attempts_note(*attempts))
            }
            StepReport::RebootRequested { attempts } => format!(
                "  {} {}{} {}",
                "↻".cyan(),
                id,
                attempts_note(*attempts),
                "(reboot requested)".cyan()
            ),
            StepReport::Failed { reason, attempts } => format!(
                "  {} {}{} {}",
                "✗".yellow(),
                id,
                attempts_note(*attempts),
                format!("(ignored: {reason})").yellow()
            ),
            StepReport::WouldApply => format!("  {} {}", "→".blue(), id),
        };
        self.line(text);
    }
}

impl Drop for PassProgress {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

fn attempts_note(attempts: u32) -> String {
    if attempts > 1 {
        format!(" [{attempts} attempts]").dimmed().to_string()
    } else {
        String::new()
    }
}
