use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{identity, PlotRecord};

/// One uploaded document: a JSON object or an array of JSON objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub label: String,
    pub content: Vec<u8>,
}

impl Source {
    pub fn new(label: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self { label: label.into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSource {
    pub records: Vec<PlotRecord>,
    pub skipped_records: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub sources: usize,
    pub failed_sources: Vec<String>,
    pub admitted: usize,
    pub duplicates: usize,
    pub skipped_records: usize,
}

/// Parse one source into plot records. Items that are not JSON objects are counted and
/// dropped rather than failing the source.
///
/// # Errors
/// Returns the JSON error when the source is not parseable at all.
pub fn parse_source(content: &[u8]) -> Result<ParsedSource, serde_json::Error> {
    let document: Value = serde_json::from_slice(content)?;
    let items = match document {
        Value::Array(items) => items,
        single => vec![single],
    };

    let mut parsed = ParsedSource::default();
    for item in items {
        match PlotRecord::from_value(item) {
            Some(record) => parsed.records.push(record),
            None => parsed.skipped_records += 1,
        }
    }
    Ok(parsed)
}

/// Merge every source into `plots`, admitting only identities not seen before.
///
/// Existing order is kept and admitted records are appended in input order.
/// De-duplication applies within one source and across sources. A source that fails to
/// parse is recorded in the report and the remaining sources still load.
#[must_use]
pub fn ingest(mut plots: Vec<PlotRecord>, sources: &[Source]) -> (Vec<PlotRecord>, IngestReport) {
    let mut seen = plots.iter().map(identity).collect::<BTreeSet<_>>();
    let mut report = IngestReport { sources: sources.len(), ..IngestReport::default() };

    for source in sources {
        let parsed = match parse_source(&source.content) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(source = %source.label, error = %err, "skipping unparseable source");
                report.failed_sources.push(source.label.clone());
                continue;
            }
        };

        if parsed.skipped_records > 0 {
            tracing::debug!(
                source = %source.label,
                skipped = parsed.skipped_records,
                "dropped non-object items"
            );
        }
        report.skipped_records += parsed.skipped_records;

        for record in parsed.records {
            if seen.insert(identity(&record)) {
                plots.push(record);
                report.admitted += 1;
            } else {
                report.duplicates += 1;
            }
        }
    }

    tracing::debug!(
        admitted = report.admitted,
        duplicates = report.duplicates,
        total = plots.len(),
        "ingested plot sources"
    );
    (plots, report)
}
