//! Progress reporting for the distributor
//!
//! Provides a live spinner fed from [`DistributionStats`] and the
//! end-of-run summary.

use crate::job::{DistributionStats, DistributionSummary, ReceiverOutcome};
use crate::protocol::TaskStatus;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing distribution status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, stats: &DistributionStats) {
        let msg = format!(
            "Packages: {} | Records: {} | Size: {} | Rate: {:.0}/s | Remaining: {} | Tasks: {}",
            format_number(stats.packages()),
            format_number(stats.records()),
            format_size(stats.bytes(), BINARY),
            stats.rate(),
            format_number(stats.remaining()),
            stats.active_tasks(),
        );

        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print the outcome of a distribution run
pub fn print_summary(summary: &DistributionSummary, receivers: &[ReceiverOutcome]) {
    let duration_secs = summary.duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        summary.records as f64 / duration_secs
    } else {
        0.0
    };

    let title = if summary.completed {
        style("Distribution Complete").green().bold()
    } else {
        style("Distribution Ended Early").yellow().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Reason:").bold(), summary.reason);
    println!(
        "  {} {}",
        style("Packages:").bold(),
        format_number(summary.packages)
    );
    println!(
        "  {} {}",
        style("Records:").bold(),
        format_number(summary.records)
    );
    println!(
        "  {} {}",
        style("Total Size:").bold(),
        format_size(summary.bytes, BINARY)
    );
    println!(
        "  {} {:.1}s ({:.0} records/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    if summary.read_failures > 0 {
        println!(
            "  {} {}",
            style("Read Failures:").yellow().bold(),
            format_number(summary.read_failures)
        );
    }
    if summary.remaining > 0 {
        println!(
            "  {} {}",
            style("Not Distributed:").yellow().bold(),
            format_number(summary.remaining)
        );
    }

    for (task, status) in &summary.task_statuses {
        let label = format!("Task-{}:", task);
        let status = if *status == TaskStatus::Ok {
            style(status.to_string()).green()
        } else {
            style(status.to_string()).red()
        };
        match receivers.get(task - 1) {
            Some(outcome) => println!(
                "  {} {} ({}, {} packages)",
                style(label).bold(),
                status,
                outcome.reason,
                format_number(outcome.packages)
            ),
            None => println!("  {} {}", style(label).bold(), status),
        }
    }
    println!();
}

/// Print a header at the start of distribution
pub fn print_header(store: &str, receivers: usize, workers_per_node: usize, chunk_size: u64) {
    println!();
    println!(
        "{} {}",
        style("biodist").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Store:").bold(), store);
    println!("  {} {}", style("Receivers:").bold(), receivers);
    println!("  {} {}", style("Workers/Node:").bold(), workers_per_node);
    println!("  {} {}", style("Chunk Size:").bold(), format_number(chunk_size));
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_update_from_stats() {
        let stats = DistributionStats::new();
        stats.record_package(1500, 4096);
        stats.set_remaining(2500);

        let reporter = ProgressReporter::new();
        reporter.update(&stats);
        reporter.finish_and_clear();
    }
}
