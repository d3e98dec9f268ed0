//! Output formatting utilities for CLI commands

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use formsync_core::{RunMode, RunReport, RunState};

/// Print a table with column alignment
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        table.add_row(row);
    }

    println!("{}", table);
}

/// Color for a run state in tables
pub fn state_color(state: RunState) -> Color {
    match state {
        RunState::Complete => Color::Green,
        RunState::Error => Color::Red,
        RunState::Cancelled => Color::Yellow,
        RunState::Idle => Color::Grey,
        _ => Color::Blue,
    }
}

/// Format a timestamp relative to now for recent times
///
/// Examples:
/// - "12 seconds ago"
/// - "5 minutes ago"
/// - "2024-12-15 14:30" (if older than 24 hours)
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    format_timestamp_at(time, Utc::now())
}

fn format_timestamp_at(time: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - time).num_seconds();
    if secs < 0 {
        time.format("%Y-%m-%d %H:%M").to_string()
    } else if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86_400 {
        format!("{} hours ago", secs / 3600)
    } else {
        time.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// `position/total (pct%)`
pub fn format_position(position: u64, total: u64) -> String {
    if total == 0 {
        return format!("{}/0", position);
    }
    let pct = position as f64 / total as f64 * 100.0;
    format!("{}/{} ({:.1}%)", position, total, pct)
}

/// Human-readable summary of a finished run.
pub fn print_report(report: &RunReport) {
    let title = match report.state {
        RunState::Cancelled => "RUN CANCELLED",
        _ => "RUN COMPLETE",
    };
    println!("{}: {} ({})", title, report.job_id, report.mode);
    println!();
    if report.fetched > 0 || report.unusable > 0 {
        println!(
            "  Fetched:       {} ({} without identity)",
            report.fetched, report.unusable
        );
    }
    println!("  Deduplicated:  {}", report.deduplicated);
    if let Some(path) = &report.export_path {
        println!("  Export:        {}", path.display());
    }

    if report.mode == RunMode::Prep {
        println!();
        println!("  No records were updated (prep mode).");
        if let Some(path) = &report.export_path {
            println!(
                "  TRY: formsync run --form-id {} --from-snapshot {}",
                report.job_id,
                path.display()
            );
        }
        return;
    }

    let summary = &report.summary;
    println!(
        "  Slice:         [{}, {}) of {}",
        summary.start_position, summary.end_position, report.deduplicated
    );
    println!("  Processed:     {}", summary.processed);
    println!("  Updated:       {}", summary.updated);
    println!("  Skipped:       {}", summary.skipped);
    println!("  Errors:        {}", summary.errors);

    if let Some(last) = &summary.last_identity {
        println!("  Last:          {}", last);
    }
    match &summary.next_identity {
        Some(next) => {
            println!("  Next:          {}", next);
            println!();
            println!(
                "  TRY: formsync run --form-id {}   # continues from the checkpoint",
                report.job_id
            );
        }
        None if summary.end_position >= report.deduplicated => {
            println!();
            println!("  All identities in this set have been processed.");
        }
        None => {}
    }
}
