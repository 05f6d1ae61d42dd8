//! Tabular export of annotation rows.

use std::collections::BTreeSet;

use serde_json::Map;

use crate::annotation::AnnotationRow;
use crate::record::value_text;

/// Columns shown by the normalization preview, in display order.
pub const NORMALIZED_PREVIEW_COLUMNS: [&str; 9] = [
    "timestamp_utc",
    "annotator_id",
    "is_calibration",
    "plotA_title",
    "plotB_title",
    "overall",
    "overall_z",
    "confidence",
    "notes",
];

/// Union of row keys in first-seen order.
#[must_use]
pub fn columns(rows: &[AnnotationRow]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for row in rows {
        for key in row.columns().keys() {
            if seen.insert(key.as_str()) {
                ordered.push(key.clone());
            }
        }
    }
    ordered
}

/// Keep only `wanted` columns that the table actually has, in `wanted` order.
#[must_use]
pub fn project(rows: &[AnnotationRow], wanted: &[&str]) -> Vec<AnnotationRow> {
    let present = columns(rows);
    let kept = wanted
        .iter()
        .copied()
        .filter(|column| present.iter().any(|p| p.as_str() == *column))
        .collect::<Vec<_>>();

    rows.iter()
        .map(|row| {
            let mut projected = Map::new();
            for column in &kept {
                if let Some(value) = row.get(column) {
                    projected.insert((*column).to_string(), value.clone());
                }
            }
            AnnotationRow::from_map(projected)
        })
        .collect()
}

/// Render rows as CSV with a header line. Missing cells and `null` render empty.
#[must_use]
pub fn to_csv(rows: &[AnnotationRow]) -> String {
    let header = columns(rows);
    let mut out = String::new();
    out.push_str(&header.iter().map(|column| csv_escape(column)).collect::<Vec<_>>().join(","));
    out.push('\n');

    for row in rows {
        let cells = header
            .iter()
            .map(|column| row.get(column).map(value_text).unwrap_or_default())
            .map(|cell| csv_escape(&cell))
            .collect::<Vec<_>>();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

/// One JSON object per line, preserving each row's column order.
///
/// # Errors
/// Returns an error when a row cannot be serialized.
pub fn to_ndjson(rows: &[AnnotationRow]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
