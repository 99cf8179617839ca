//! Terminal output: banner, progress bar and run summary

use crate::coordinator::{RunPhase, RunSummary};
use crate::model::ScanOutcome;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::time::Duration;

/// How the summary is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub colored: bool,
    pub verbose: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            colored: true,
            verbose: false,
        }
    }
}

pub fn print_banner() {
    println!("{}", " ___  ___  ___ _____ ___ _  _   _   ___ ".truecolor(52, 152, 219).bold());
    println!("{}", "| _ \\/ _ \\| _ \\_   _/ __| \\| | /_\\ | _ \\".truecolor(52, 152, 219).bold());
    println!("{}", "|  _/ (_) |   / | | \\__ \\ .` |/ _ \\|  _/".truecolor(52, 152, 219).bold());
    println!("{}", "|_|  \\___/|_|_\\ |_| |___/_|\\_/_/ \\_\\_|  ".truecolor(52, 152, 219).bold());
    println!();
    println!("{}", "Daily open-port snapshots for validator hosts".truecolor(255, 215, 0).bold());
    println!("{}", "------------------------------------------------------".bright_blue());
    println!();
}

/// Progress bar over the targets of a run; hidden unless verbose
pub struct RunProgress {
    bar: ProgressBar,
}

impl RunProgress {
    pub fn new(visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(0);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map(|s| s.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };
        Self { bar }
    }

    /// Record one finished target
    pub fn observe(&self, completed: usize, total: usize, outcome: &ScanOutcome) {
        self.bar.set_length(total as u64);
        self.bar.set_position(completed as u64);
        let status = if outcome.succeeded {
            format!("{} ({} ports)", outcome.target.address, outcome.ports.len())
        } else {
            format!("{} failed", outcome.target.address)
        };
        self.bar.set_message(status);
    }

    /// Show the current run phase until the first target finishes
    pub fn enter(&self, phase: RunPhase) {
        let message = match phase {
            RunPhase::FetchingTargets => "fetching targets",
            RunPhase::Scanning => "scanning",
            RunPhase::Summarizing => "summarizing",
            RunPhase::Idle | RunPhase::Done => "",
        };
        self.bar.set_message(message);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Renders a [`RunSummary`]
pub struct OutputManager {
    config: OutputConfig,
}

impl OutputManager {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    pub fn write_summary(&self, summary: &RunSummary) -> io::Result<()> {
        let output = match self.config.format {
            OutputFormat::Text => self.format_text(summary),
            OutputFormat::Json => self.format_json(summary)?,
        };
        println!("{}", output);
        Ok(())
    }

    fn format_text(&self, summary: &RunSummary) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "{}\n",
            self.paint(&format!("Run {} complete", summary.run_id), |s| s.bright_cyan().bold())
        ));
        out.push_str(&format!(
            "  Scanned:   {}\n  Succeeded: {}\n  Failed:    {}\n  Saved:     {} ports\n",
            summary.scanned,
            self.paint(&summary.succeeded.to_string(), |s| s.bright_green()),
            self.paint(&summary.failed.to_string(), |s| {
                if summary.failed > 0 {
                    s.bright_red()
                } else {
                    s.normal()
                }
            }),
            summary.saved
        ));
        if summary.abandoned > 0 {
            out.push_str(&format!(
                "  Abandoned: {}\n",
                self.paint(&summary.abandoned.to_string(), |s| s.bright_yellow())
            ));
        }
        out.push_str(&format!("  Elapsed:   {:.1}s\n", summary.elapsed.as_secs_f64()));

        if !summary.failures.is_empty() {
            out.push('\n');
            out.push_str(&self.paint("Failed hosts:", |s| s.bright_red()));
            out.push('\n');
            for failure in &summary.failures {
                let line = if self.config.verbose {
                    format!("  {} ({}): {}", failure.address, failure.identity, failure.error)
                } else {
                    format!("  {} ({})", failure.address, failure.identity)
                };
                out.push_str(&line);
                out.push('\n');
            }
            let hidden = summary.hidden_failures();
            if hidden > 0 {
                out.push_str(&format!("  ... and {} more\n", hidden));
            }
        }

        out
    }

    fn format_json(&self, summary: &RunSummary) -> io::Result<String> {
        serde_json::to_string_pretty(summary).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn paint<F>(&self, text: &str, style: F) -> String
    where
        F: Fn(&str) -> ColoredString,
    {
        if self.config.colored {
            style(text).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::FailedTarget;
    use chrono::Utc;
    use uuid::Uuid;

    fn summary(failed: usize, preview: usize) -> RunSummary {
        RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            scanned: 2 + failed,
            succeeded: 2,
            failed,
            saved: 5,
            abandoned: 0,
            elapsed: Duration::from_secs(3),
            failures: (0..preview)
                .map(|i| FailedTarget {
                    identity: format!("id{}", i),
                    address: format!("10.0.0.{}", i),
                    error: "timed out".to_string(),
                })
                .collect(),
        }
    }

    fn plain() -> OutputManager {
        OutputManager::new(OutputConfig {
            colored: false,
            ..OutputConfig::default()
        })
    }

    #[test]
    fn text_summary_lists_counts() {
        let text = plain().format_text(&summary(0, 0));
        assert!(text.contains("Succeeded: 2"));
        assert!(text.contains("Saved:     5 ports"));
        assert!(!text.contains("Failed hosts"));
    }

    #[test]
    fn text_summary_mentions_hidden_failures() {
        let text = plain().format_text(&summary(12, 10));
        assert!(text.contains("Failed hosts:"));
        assert!(text.contains("... and 2 more"));
    }

    #[test]
    fn json_summary_is_parseable() {
        let json = plain().format_json(&summary(1, 1)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["failed"], 1);
        assert_eq!(value["failures"][0]["address"], "10.0.0.0");
    }
}
