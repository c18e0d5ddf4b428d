//! Human-readable summaries for the CLI.
//!
//! `folio status` prints what a container holds: document counts by
//! status, chunk count, pinned dimensions, and when each root was last
//! scanned. Index reports and the container list are printed here too.

use folio_core::models::format_ts_iso;

use crate::container::ContainerStatus;
use crate::progress::format_number;
use crate::reconciler::IndexReport;
use crate::registry::ContainerRecord;

pub fn print_status(status: &ContainerStatus) {
    let db_size = std::fs::metadata(&status.store_path)
        .map(|m| m.len())
        .unwrap_or(0);
    let stats = &status.stats;

    println!("Folio — Container '{}'", status.name);
    println!("{}", "=".repeat(20 + status.name.len()));
    println!();
    if !status.description.is_empty() {
        println!("  Description: {}", status.description);
    }
    println!("  Database:    {}", status.store_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", format_number(stats.documents as u64));
    println!("    indexed:   {}", format_number(stats.indexed as u64));
    println!("    pending:   {}", format_number(stats.pending as u64));
    println!("    failed:    {}", format_number(stats.failed as u64));
    println!("  Chunks:      {}", format_number(stats.chunks as u64));
    println!(
        "  Dimensions:  {}",
        stats
            .dims
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  Model:       {}", stats.model.as_deref().unwrap_or("-"));

    if let Some(job) = &status.job {
        println!(
            "  Job:         #{} {:?} since {}",
            job.id,
            job.kind,
            format_ts_relative(job.started_at)
        );
    }

    if !status.paths.is_empty() {
        println!();
        println!("  {:<56}   {}", "ROOT", "LAST SCAN");
        println!("  {}", "-".repeat(72));
        for p in &status.paths {
            let scanned = match p.last_scan_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!("  {:<56}   {}", p.root.display(), scanned);
        }
    }
    println!();
}

pub fn print_report(report: &IndexReport) {
    let verb = if report.rebuild { "rebuild" } else { "index" };
    let state = if report.cancelled { "cancelled" } else { "done" };
    println!(
        "{} {}: {} ({} ms)",
        verb, report.container, state, report.duration_ms
    );
    println!(
        "  added {}  updated {}  deleted {}  unchanged {}",
        report.added, report.updated, report.deleted, report.unchanged
    );
    println!(
        "  skipped {}  failed {}  pending {}  scan errors {}",
        report.skipped, report.failed, report.pending, report.scan_errors
    );
    for root in &report.unreachable_roots {
        println!("  unreachable: {} (documents kept)", root.display());
    }
}

pub fn print_containers(containers: &[ContainerRecord], active: &str) {
    println!("  {:<2}{:<24} {:>5}   {}", "", "NAME", "PATHS", "DESCRIPTION");
    println!("  {}", "-".repeat(60));
    for c in containers {
        let marker = if c.name == active { "*" } else { "" };
        println!(
            "  {:<2}{:<24} {:>5}   {}",
            marker,
            c.name,
            c.paths.len(),
            c.description
        );
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time for a Unix-millis timestamp, e.g. "3 hours ago".
fn format_ts_relative(ts_millis: i64) -> String {
    let delta = (chrono::Utc::now().timestamp_millis() - ts_millis) / 1000;

    if delta < 0 {
        return format_ts_iso(ts_millis);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts_millis)
    }
}
