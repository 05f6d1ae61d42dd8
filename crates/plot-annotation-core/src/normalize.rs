use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::annotation::AnnotationRow;

pub const OVERALL_Z: &str = "overall_z";

const MIN_CALIBRATION_ROWS: usize = 2;

/// Calibration statistics for one annotator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotatorBaseline {
    pub annotator_id: String,
    pub calibration_rows: usize,
    pub mean: f64,
    /// Population standard deviation, with `0` replaced by `1.0`.
    pub std_dev: f64,
    pub unit_variance_substituted: bool,
}

impl AnnotatorBaseline {
    #[must_use]
    pub fn z_score(&self, overall: f64) -> f64 {
        (overall - self.mean) / self.std_dev
    }
}

fn is_normalizable(rows: &[AnnotationRow]) -> bool {
    !rows.is_empty()
        && rows.iter().all(|row| row.contains("annotator_id") && row.contains("is_calibration"))
}

fn count_as_f64(count: usize) -> f64 {
    f64::from(u32::try_from(count).unwrap_or(u32::MAX))
}

#[allow(clippy::float_cmp)]
fn baseline(annotator_id: String, calibration_rows: usize, values: &[f64]) -> AnnotatorBaseline {
    let n = count_as_f64(values.len());
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    let unit_variance_substituted = std_dev == 0.0;

    AnnotatorBaseline {
        annotator_id,
        calibration_rows,
        mean,
        std_dev: if unit_variance_substituted { 1.0 } else { std_dev },
        unit_variance_substituted,
    }
}

/// Per-annotator baselines computed from calibration rows.
///
/// Only annotators with at least two calibration rows (and at least one numeric
/// `overall` among them) get a baseline. Output is ordered by annotator id.
#[must_use]
pub fn annotator_baselines(rows: &[AnnotationRow]) -> Vec<AnnotatorBaseline> {
    if !is_normalizable(rows) {
        return Vec::new();
    }

    let mut groups: BTreeMap<String, (usize, Vec<f64>)> = BTreeMap::new();
    for row in rows {
        if row.is_calibration() != Some(true) {
            continue;
        }
        let Some(annotator_id) = row.annotator_id() else {
            continue;
        };
        let entry = groups.entry(annotator_id).or_default();
        entry.0 += 1;
        if let Some(overall) = row.overall() {
            entry.1.push(overall);
        }
    }

    groups
        .into_iter()
        .filter(|(_, (count, values))| *count >= MIN_CALIBRATION_ROWS && !values.is_empty())
        .map(|(annotator_id, (count, values))| baseline(annotator_id, count, &values))
        .collect()
}

/// Add a nullable `overall_z` column to every row.
///
/// Non-calibration rows of an annotator with a baseline get
/// `(overall - mean) / std_dev`; all other rows get `null`. Any existing `overall_z`
/// is overwritten, so applying this twice gives the same table. When the table is empty
/// or a row lacks `annotator_id` or `is_calibration`, the rows are returned unchanged.
#[must_use]
pub fn normalize(rows: &[AnnotationRow]) -> Vec<AnnotationRow> {
    if !is_normalizable(rows) {
        tracing::debug!(rows = rows.len(), "annotation table is not normalizable");
        return rows.to_vec();
    }

    let baselines = annotator_baselines(rows)
        .into_iter()
        .map(|baseline| (baseline.annotator_id.clone(), baseline))
        .collect::<BTreeMap<_, _>>();
    tracing::debug!(annotators = baselines.len(), "computed calibration baselines");

    rows.iter()
        .map(|row| {
            let z = match (row.is_calibration(), row.annotator_id(), row.overall()) {
                (Some(false), Some(annotator_id), Some(overall)) => baselines
                    .get(&annotator_id)
                    .map(|baseline| baseline.z_score(overall))
                    .and_then(Number::from_f64)
                    .map(Value::Number),
                _ => None,
            };
            let mut normalized = row.clone();
            normalized.set(OVERALL_Z, z.unwrap_or(Value::Null));
            normalized
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    fn row(annotator_id: &str, is_calibration: bool, overall: i64) -> AnnotationRow {
        let mut columns = Map::new();
        columns.insert("annotator_id".to_string(), json!(annotator_id));
        columns.insert("is_calibration".to_string(), json!(is_calibration));
        columns.insert("overall".to_string(), json!(overall));
        AnnotationRow::from_map(columns)
    }

    fn z_values(rows: &[AnnotationRow]) -> Vec<Option<f64>> {
        rows.iter().map(AnnotationRow::overall_z).collect()
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        match actual {
            Some(value) => assert!(
                (value - expected).abs() < 1e-12,
                "expected overall_z {expected}, got {value}"
            ),
            None => panic!("expected overall_z {expected}, got null"),
        }
    }

    #[test]
    fn z_score_uses_population_std_of_calibration_rows() {
        let rows = vec![row("x", true, 4), row("x", true, 6), row("x", false, 7)];
        let normalized = normalize(&rows);
        assert_eq!(normalized[0].overall_z(), None);
        assert_eq!(normalized[1].overall_z(), None);
        assert_close(normalized[2].overall_z(), 2.0);
    }

    #[test]
    fn zero_variance_substitutes_unit_std() {
        let rows = vec![row("x", true, 5), row("x", true, 5), row("x", false, 8)];
        let normalized = normalize(&rows);
        assert_close(normalized[2].overall_z(), 3.0);

        let baselines = annotator_baselines(&rows);
        assert_eq!(baselines.len(), 1);
        assert!(baselines[0].unit_variance_substituted);
        assert!((baselines[0].std_dev - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn single_calibration_row_leaves_all_rows_null() {
        let rows = vec![row("x", true, 4), row("x", false, 7), row("x", false, 2)];
        let normalized = normalize(&rows);
        assert_eq!(z_values(&normalized), vec![None, None, None]);
        assert!(normalized.iter().all(|row| row.get(OVERALL_Z) == Some(&Value::Null)));
    }

    #[test]
    fn annotators_are_normalized_independently() {
        let rows = vec![
            row("x", true, 4),
            row("y", true, 2),
            row("x", true, 6),
            row("y", false, 9),
            row("x", false, 3),
        ];
        let normalized = normalize(&rows);
        assert_close(normalized[4].overall_z(), -2.0);
        assert_eq!(normalized[3].overall_z(), None);
    }

    #[test]
    fn normalization_is_idempotent_and_ignores_prior_values() {
        let mut stale = row("x", false, 7);
        stale.set(OVERALL_Z, json!(99.0));
        let rows = vec![row("x", true, 4), row("x", true, 6), stale];

        let once = normalize(&rows);
        let twice = normalize(&once);
        assert_eq!(once, twice);
        assert_close(twice[2].overall_z(), 2.0);
    }

    #[test]
    fn overall_z_is_appended_as_last_column() {
        let rows = vec![row("x", true, 4), row("x", true, 6), row("x", false, 7)];
        let normalized = normalize(&rows);
        assert_eq!(normalized[2].columns().keys().last().map(String::as_str), Some(OVERALL_Z));
    }

    #[test]
    fn empty_or_incomplete_tables_are_returned_unchanged() {
        assert!(normalize(&[]).is_empty());

        let mut no_flag = Map::new();
        no_flag.insert("annotator_id".to_string(), json!("x"));
        no_flag.insert("overall".to_string(), json!(7));
        let rows = vec![row("x", true, 4), row("x", true, 6), AnnotationRow::from_map(no_flag)];
        let normalized = normalize(&rows);
        assert_eq!(normalized, rows);
        assert!(normalized.iter().all(|row| !row.contains(OVERALL_Z)));
        assert!(annotator_baselines(&rows).is_empty());
    }

    #[test]
    fn numeric_annotator_ids_do_not_join_string_groups() {
        let mut numeric = Map::new();
        numeric.insert("annotator_id".to_string(), json!(1));
        numeric.insert("is_calibration".to_string(), json!(false));
        numeric.insert("overall".to_string(), json!(7));
        let rows = vec![row("1", true, 4), row("1", true, 6), AnnotationRow::from_map(numeric)];

        let normalized = normalize(&rows);
        assert_eq!(normalized[2].overall_z(), None);
        assert!(normalized[2].contains(OVERALL_Z));
        assert_eq!(annotator_baselines(&rows).len(), 1);
    }

    #[test]
    fn rows_without_numeric_overall_stay_null() {
        let mut missing = Map::new();
        missing.insert("annotator_id".to_string(), json!("x"));
        missing.insert("is_calibration".to_string(), json!(false));
        let rows = vec![row("x", true, 4), row("x", true, 6), AnnotationRow::from_map(missing)];
        let normalized = normalize(&rows);
        assert_eq!(normalized[2].overall_z(), None);
        assert!(normalized[2].contains(OVERALL_Z));
    }
}
