//! Output formatting for CLI display.

use jiff::Timestamp;

use crate::model::{DeploymentRecord, ResourceChanges, UpdateResult};

const MESSAGE_WIDTH: usize = 40;
const COLUMN_GAP: usize = 2;
const HEADERS: [&str; 6] = ["VERSION", "KIND", "RESULT", "TIME", "CHANGES", "MESSAGE"];

/// Minute-resolution UTC time, or `N/A` when unknown.
pub(super) fn format_time(time: Option<Timestamp>) -> String {
    match time {
        Some(t) => t.strftime("%Y-%m-%d %H:%M").to_string(),
        None => "N/A".to_string(),
    }
}

pub(super) fn format_result(result: UpdateResult) -> String {
    match result {
        UpdateResult::Succeeded => "✓ success".to_string(),
        UpdateResult::Failed => "✗ failed".to_string(),
        UpdateResult::InProgress => "⟳ running".to_string(),
        UpdateResult::Unknown => result.as_str().to_string(),
    }
}

/// Compact change counts: `+create ~update -delete`, or `=same` when nothing changed.
pub(super) fn format_changes(changes: &ResourceChanges) -> String {
    let count = |key: &str| changes.get(key).copied().unwrap_or(0);

    let parts: Vec<String> = [("+", "create"), ("~", "update"), ("-", "delete")]
        .into_iter()
        .filter(|(_, key)| count(key) > 0)
        .map(|(sign, key)| format!("{sign}{}", count(key)))
        .collect();

    if !parts.is_empty() {
        return parts.join(" ");
    }
    match count("same") {
        0 => "-".to_string(),
        same => format!("={same}"),
    }
}

/// Cut `s` to at most `max` characters, marking the cut with `...`.
pub(super) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Render history as an aligned table with a header and separator row.
pub(super) fn format_history_table(records: &[DeploymentRecord]) -> String {
    let mut rows: Vec<[String; 6]> = Vec::with_capacity(records.len() + 2);
    rows.push(HEADERS.map(String::from));
    rows.push(HEADERS.map(|h| "-".repeat(h.len())));
    rows.extend(records.iter().map(|r| {
        [
            r.version.to_string(),
            r.kind.as_str().to_string(),
            format_result(r.result),
            format_time(r.start_time),
            format_changes(&r.resource_changes),
            truncate(&r.message, MESSAGE_WIDTH),
        ]
    }));

    let mut widths = [0usize; 6];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            line.push_str(cell);
            if i + 1 < row.len() {
                let pad = widths[i] - cell.chars().count() + COLUMN_GAP;
                line.push_str(&" ".repeat(pad));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Indented details of the record being rolled back to.
pub(super) fn format_record_details(record: &DeploymentRecord) -> String {
    let mut out = format!(
        "  Kind: {}\n  Result: {}\n  Time: {}\n",
        record.kind.as_str(),
        record.result.as_str(),
        format_time(record.start_time),
    );
    if let Some(end) = record.end_time {
        out.push_str(&format!("  Finished: {}\n", format_time(Some(end))));
    }
    if !record.message.is_empty() {
        out.push_str(&format!("  Message: {}\n", record.message));
    }
    out
}

/// One `  kind: count` line per entry.
pub(super) fn format_change_lines(changes: &ResourceChanges) -> String {
    changes
        .iter()
        .map(|(kind, count)| format!("  {kind}: {count}\n"))
        .collect()
}
