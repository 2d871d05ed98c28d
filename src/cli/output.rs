//! CLI output formatting

use crate::core::{InstanceReport, InstanceStatus, RunReport, RunStatus};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar over job instances
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an instance status for display
pub fn format_instance_status(status: &InstanceStatus) -> String {
    match status {
        InstanceStatus::Pending => style("PENDING").dim().to_string(),
        InstanceStatus::Blocked => style("BLOCKED").yellow().to_string(),
        InstanceStatus::Runnable => style("RUNNABLE").cyan().to_string(),
        InstanceStatus::Running { .. } => style("RUNNING").yellow().to_string(),
        InstanceStatus::Succeeded { .. } => style("SUCCEEDED").green().to_string(),
        InstanceStatus::Failed { .. } => style("FAILED").red().to_string(),
        InstanceStatus::Skipped { .. } => style("SKIPPED").dim().to_string(),
        InstanceStatus::Canceled => style("CANCELED").yellow().to_string(),
    }
}

/// Format a run status for display
pub fn format_run_status(status: RunStatus) -> String {
    match status {
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Canceled => style("CANCELED").yellow().to_string(),
    }
}

/// One table row per instance
pub fn format_instance_line(report: &InstanceReport) -> String {
    let detail = match &report.status {
        InstanceStatus::Failed { detail, .. } => format!(" - {}", style(detail).red()),
        InstanceStatus::Skipped { reason } => format!(" - {}", style(reason).dim()),
        _ => String::new(),
    };
    format!(
        "  {:<40} {}{}",
        style(&report.id).bold(),
        format_instance_status(&report.status),
        detail
    )
}

/// Closing summary line for a finished run
pub fn format_run_summary(report: &RunReport) -> String {
    let icon = match report.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Canceled => WARN,
        _ => SPINNER,
    };
    let succeeded = report.count_where(InstanceStatus::is_succeeded);
    let failed = report.count_where(|s| matches!(s, InstanceStatus::Failed { .. }));
    let skipped = report.count_where(|s| matches!(s, InstanceStatus::Skipped { .. }));
    format!(
        "{} {} - {} ({} succeeded, {} failed, {} skipped of {})",
        icon,
        style(&report.run_id[..8.min(report.run_id.len())]).dim(),
        format_run_status(report.status),
        succeeded,
        failed,
        skipped,
        report.instances.len()
    )
}
