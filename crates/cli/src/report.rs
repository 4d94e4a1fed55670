//! End-of-run report table and exit status.

use std::process::ExitCode;

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use obsgit_core::{SyncOutcome, SyncReport};

use crate::style;

/// Exit status for an outcome: 0 success, 2 partial failure, 1 total failure.
pub fn exit_code(outcome: SyncOutcome) -> u8 {
    match outcome {
        SyncOutcome::Success => 0,
        SyncOutcome::PartialFailure => 2,
        SyncOutcome::TotalFailure => 1,
    }
}

pub fn exit_status(outcome: SyncOutcome) -> ExitCode {
    ExitCode::from(exit_code(outcome))
}

fn build_table(report: &SyncReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Package", "Status", "Reason"]);

    for package in &report.succeeded {
        table.add_row(vec![
            Cell::new(package),
            Cell::new("✓ synced").fg(Color::Green),
            Cell::new(""),
        ]);
    }
    for (package, reason) in &report.failed {
        table.add_row(vec![
            Cell::new(package),
            Cell::new("✗ failed").fg(Color::Red),
            Cell::new(reason),
        ]);
    }
    for package in &report.skipped {
        table.add_row(vec![
            Cell::new(package),
            Cell::new("⧗ skipped").fg(Color::Yellow),
            Cell::new("not started after an earlier failure"),
        ]);
    }
    table
}

/// Print the package table followed by a one-line summary.
pub fn print_report(title: &str, report: &SyncReport) {
    println!();
    println!("{}", style::header(title));
    println!();

    let total = report.succeeded.len() + report.failed.len() + report.skipped.len();
    if total == 0 {
        println!("  {}", style::dim("No packages processed."));
    } else {
        println!("{}", build_table(report));
    }
    println!();

    let summary = format!(
        "{} succeeded, {} failed, {} skipped",
        report.succeeded.len(),
        report.failed.len(),
        report.skipped.len()
    );
    let line = match report.outcome() {
        SyncOutcome::Success => style::success(&summary),
        SyncOutcome::PartialFailure => style::warn(&summary),
        SyncOutcome::TotalFailure => style::error(&summary),
    };
    println!("{}", line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(exit_code(SyncOutcome::Success), 0);
        assert_eq!(exit_code(SyncOutcome::PartialFailure), 2);
        assert_eq!(exit_code(SyncOutcome::TotalFailure), 1);
    }

    #[test]
    fn test_table_lists_every_package() {
        let report = SyncReport {
            succeeded: vec!["gcc".into()],
            failed: vec![("zlib".into(), "link cycle detected".into())],
            skipped: vec!["bash".into()],
        };
        let rendered = build_table(&report).to_string();
        for needle in ["gcc", "zlib", "link cycle detected", "bash", "skipped"] {
            assert!(rendered.contains(needle), "missing {needle}");
        }
    }
}
