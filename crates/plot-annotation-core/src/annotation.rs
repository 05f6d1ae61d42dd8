use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::record::PlotRecord;
use crate::rubric::{Rubric, RESERVED_DIMENSION_KEYS};
use crate::AnnotationError;

/// An integer judgment in `[1, 10]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "i64", into = "i64")]
pub struct Score(u8);

impl Score {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    /// # Errors
    /// Returns [`AnnotationError::Validation`] when `value` is outside `[1, 10]`.
    pub fn new(value: i64) -> Result<Self, AnnotationError> {
        match u8::try_from(value) {
            Ok(score) if (Self::MIN..=Self::MAX).contains(&score) => Ok(Self(score)),
            _ => Err(AnnotationError::Validation(format!(
                "score MUST be an integer in [{}, {}], got {value}",
                Self::MIN,
                Self::MAX
            ))),
        }
    }

    #[must_use]
    pub fn clamped(value: i64) -> Self {
        let bounded = value.clamp(i64::from(Self::MIN), i64::from(Self::MAX));
        Self(u8::try_from(bounded).unwrap_or(Self::MIN))
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = AnnotationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Score> for i64 {
    fn from(score: Score) -> Self {
        i64::from(score.0)
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    #[default]
    Mid,
    High,
}

impl Confidence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "mid" => Some(Self::Mid),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Heuristic summary label for a pairwise judgment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum PairPreference {
    A,
    B,
    #[serde(rename = "mixed")]
    Mixed,
}

impl PairPreference {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::Mixed => "mixed",
        }
    }
}

/// `A` needs `overall >= 6` with a positive delta sum, `B` needs `overall <= 5` with a
/// negative delta sum. The two cutoffs are asymmetric and everything else is `mixed`.
#[must_use]
pub fn pair_preference<I>(overall: Score, deltas: I) -> PairPreference
where
    I: IntoIterator<Item = i64>,
{
    let delta_sum: i64 = deltas.into_iter().sum();
    if overall.get() >= 6 && delta_sum > 0 {
        PairPreference::A
    } else if overall.get() <= 5 && delta_sum < 0 {
        PairPreference::B
    } else {
        PairPreference::Mixed
    }
}

pub type DimensionScores = BTreeMap<String, Score>;

/// Scores for two plots judged side by side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairJudgment {
    pub scores_a: DimensionScores,
    pub scores_b: DimensionScores,
    pub overall: Score,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub notes: String,
}

/// Scores for one plot judged on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleJudgment {
    pub scores: DimensionScores,
    pub overall: Score,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub notes: String,
}

/// Context fixed at submission time. `is_calibration` is never recomputed afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub timestamp_utc: OffsetDateTime,
    pub annotator_id: &'a str,
    pub is_calibration: bool,
}

impl Submission<'_> {
    fn header(&self) -> Result<Map<String, Value>, AnnotationError> {
        let timestamp = self.timestamp_utc.format(&Rfc3339).map_err(|err| {
            AnnotationError::Validation(format!("failed to format timestamp_utc: {err}"))
        })?;

        let mut row = Map::new();
        row.insert("timestamp_utc".to_string(), Value::String(timestamp));
        row.insert("annotator_id".to_string(), Value::String(self.annotator_id.to_string()));
        row.insert("is_calibration".to_string(), Value::Bool(self.is_calibration));
        Ok(row)
    }
}

fn text(value: String) -> Value {
    Value::String(value)
}

fn score(value: Score) -> Value {
    Value::from(value.get())
}

/// One scoring event. Columns keep insertion order, which is also the export order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct AnnotationRow(Map<String, Value>);

impl AnnotationRow {
    #[must_use]
    pub fn from_map(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    #[must_use]
    pub fn columns(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    /// Insert or overwrite one column, keeping its existing position on overwrite.
    pub fn set(&mut self, column: &str, value: Value) {
        self.0.insert(column.to_string(), value);
    }

    /// The annotator, only when stored as a JSON string. Numeric ids are not coerced, so
    /// `1` and `"1"` never share a normalization group.
    #[must_use]
    pub fn annotator_id(&self) -> Option<String> {
        self.0.get("annotator_id").and_then(Value::as_str).map(str::to_string)
    }

    #[must_use]
    pub fn is_calibration(&self) -> Option<bool> {
        self.0.get("is_calibration").and_then(Value::as_bool)
    }

    #[must_use]
    pub fn overall(&self) -> Option<f64> {
        self.0.get("overall").and_then(Value::as_f64)
    }

    #[must_use]
    pub fn overall_z(&self) -> Option<f64> {
        self.0.get(crate::normalize::OVERALL_Z).and_then(Value::as_f64)
    }

    /// Build the row for a pairwise judgment of `plot_a` against `plot_b`.
    ///
    /// # Errors
    /// Returns an error when the judgment does not score exactly the rubric's dimensions.
    pub fn pair(
        submission: &Submission<'_>,
        plot_a: &PlotRecord,
        plot_b: &PlotRecord,
        judgment: &PairJudgment,
        rubric: &Rubric,
    ) -> Result<Self, AnnotationError> {
        rubric.check_scores(&judgment.scores_a)?;
        rubric.check_scores(&judgment.scores_b)?;

        let mut row = submission.header()?;
        row.insert("plotA_id".to_string(), text(plot_a.plot_id()));
        row.insert("plotB_id".to_string(), text(plot_b.plot_id()));
        row.insert("plotA_title".to_string(), text(plot_a.title()));
        row.insert("plotB_title".to_string(), text(plot_b.title()));
        row.insert("plotA_genre".to_string(), text(plot_a.genre()));
        row.insert("plotB_genre".to_string(), text(plot_b.genre()));
        row.insert("plotA_status".to_string(), text(plot_a.status()));
        row.insert("plotB_status".to_string(), text(plot_b.status()));
        row.insert("plotA_seed_id".to_string(), text(plot_a.seed()));
        row.insert("plotB_seed_id".to_string(), text(plot_b.seed()));
        row.insert("plotA_method".to_string(), text(plot_a.method()));
        row.insert("plotB_method".to_string(), text(plot_b.method()));
        row.insert("overall".to_string(), score(judgment.overall));
        row.insert("confidence".to_string(), text(judgment.confidence.as_str().to_string()));
        row.insert("notes".to_string(), text(judgment.notes.trim().to_string()));

        let mut deltas = Vec::with_capacity(rubric.dimensions.len());
        for dimension in &rubric.dimensions {
            let (Some(a), Some(b)) =
                (judgment.scores_a.get(&dimension.key), judgment.scores_b.get(&dimension.key))
            else {
                return Err(AnnotationError::MissingDimension(dimension.key.clone()));
            };
            let delta = i64::from(*a) - i64::from(*b);
            row.insert(format!("A_{}", dimension.key), score(*a));
            row.insert(format!("B_{}", dimension.key), score(*b));
            row.insert(format!("delta_{}", dimension.key), Value::from(delta));
            deltas.push(delta);
        }

        let preference = pair_preference(judgment.overall, deltas);
        row.insert("pair_preference".to_string(), text(preference.as_str().to_string()));

        Ok(Self(row))
    }

    /// Build the row for a single-plot judgment.
    ///
    /// # Errors
    /// Returns an error when the judgment does not score exactly the rubric's dimensions.
    pub fn single(
        submission: &Submission<'_>,
        plot: &PlotRecord,
        judgment: &SingleJudgment,
        rubric: &Rubric,
    ) -> Result<Self, AnnotationError> {
        rubric.check_scores(&judgment.scores)?;

        let mut row = submission.header()?;
        row.insert("plot_id".to_string(), text(plot.plot_id()));
        row.insert("title".to_string(), text(plot.title()));
        row.insert("genre".to_string(), text(plot.genre()));
        row.insert("status".to_string(), text(plot.status()));
        row.insert("seed_id".to_string(), text(plot.seed()));
        row.insert("method".to_string(), text(plot.method()));
        for dimension in &rubric.dimensions {
            let Some(value) = judgment.scores.get(&dimension.key) else {
                return Err(AnnotationError::MissingDimension(dimension.key.clone()));
            };
            if RESERVED_DIMENSION_KEYS.contains(&dimension.key.as_str()) {
                return Err(AnnotationError::Validation(format!(
                    "dimension key '{}' collides with an annotation column",
                    dimension.key
                )));
            }
            row.insert(dimension.key.clone(), score(*value));
        }
        row.insert("overall".to_string(), score(judgment.overall));
        row.insert("confidence".to_string(), text(judgment.confidence.as_str().to_string()));
        row.insert("notes".to_string(), text(judgment.notes.trim().to_string()));

        Ok(Self(row))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;
    use crate::rubric::Dimension;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn s(value: i64) -> Score {
        match Score::new(value) {
            Ok(score) => score,
            Err(err) => panic!("invalid fixture score {value}: {err}"),
        }
    }

    fn scores(values: [i64; 4]) -> DimensionScores {
        ["Surprise", "Valence", "Conflict", "Coherence"]
            .into_iter()
            .zip(values)
            .map(|(key, value)| (key.to_string(), s(value)))
            .collect()
    }

    fn plot(value: Value) -> PlotRecord {
        PlotRecord::from_value(value).unwrap_or_else(|| panic!("fixture must be an object"))
    }

    fn submission(is_calibration: bool) -> Submission<'static> {
        Submission { timestamp_utc: fixture_time(), annotator_id: "ann-1", is_calibration }
    }

    #[test]
    fn score_rejects_values_outside_slider_range() {
        assert!(Score::new(0).is_err());
        assert!(Score::new(11).is_err());
        assert!(Score::new(-3).is_err());
        assert_eq!(s(1).get(), 1);
        assert_eq!(s(10).get(), 10);
        assert_eq!(Score::clamped(42).get(), 10);
        assert_eq!(Score::clamped(-1).get(), 1);
    }

    #[test]
    fn score_deserialization_validates_range() {
        assert!(serde_json::from_value::<Score>(json!(7)).is_ok());
        assert!(serde_json::from_value::<Score>(json!(12)).is_err());
    }

    #[test]
    fn pair_preference_follows_asymmetric_cutoffs() {
        assert_eq!(pair_preference(s(8), [4, 2, 1, 3]), PairPreference::A);
        assert_eq!(pair_preference(s(6), [1]), PairPreference::A);
        assert_eq!(pair_preference(s(5), [1]), PairPreference::Mixed);
        assert_eq!(pair_preference(s(5), [-1]), PairPreference::B);
        assert_eq!(pair_preference(s(6), [-1]), PairPreference::Mixed);
        assert_eq!(pair_preference(s(9), [2, -2]), PairPreference::Mixed);
        assert_eq!(pair_preference(s(1), Vec::<i64>::new()), PairPreference::Mixed);
    }

    #[test]
    fn pair_row_carries_deltas_and_preference() {
        let a = plot(json!({"title": "Alpha", "genre": "sf", "seed_id": "s1", "method_name": "m1"}));
        let b = plot(json!({"plot_id": "B-7", "title": "Beta", "seed": "s2", "system": "m2"}));
        let judgment = PairJudgment {
            scores_a: scores([8, 7, 6, 9]),
            scores_b: scores([4, 5, 5, 6]),
            overall: s(8),
            confidence: Confidence::High,
            notes: "  clear winner \n".to_string(),
        };

        let row = AnnotationRow::pair(&submission(false), &a, &b, &judgment, &Rubric::default())
            .unwrap_or_else(|err| panic!("pair row should build: {err}"));

        assert_eq!(row.get("plotA_id"), Some(&json!("Alpha||s1||m1")));
        assert_eq!(row.get("plotB_id"), Some(&json!("B-7")));
        assert_eq!(row.get("plotB_method"), Some(&json!("m2")));
        assert_eq!(row.get("delta_Surprise"), Some(&json!(4)));
        assert_eq!(row.get("delta_Valence"), Some(&json!(2)));
        assert_eq!(row.get("delta_Conflict"), Some(&json!(1)));
        assert_eq!(row.get("delta_Coherence"), Some(&json!(3)));
        assert_eq!(row.get("pair_preference"), Some(&json!("A")));
        assert_eq!(row.get("notes"), Some(&json!("clear winner")));
        assert_eq!(row.get("confidence"), Some(&json!("high")));
        assert_eq!(row.get("timestamp_utc"), Some(&json!("2023-11-14T22:13:20Z")));
        assert_eq!(row.is_calibration(), Some(false));
        assert_eq!(row.annotator_id().as_deref(), Some("ann-1"));
    }

    #[test]
    fn pair_row_column_order_is_stable() {
        let a = plot(json!({"title": "Alpha"}));
        let b = plot(json!({"title": "Beta"}));
        let judgment = PairJudgment {
            scores_a: scores([6, 6, 6, 6]),
            scores_b: scores([6, 6, 6, 6]),
            overall: s(6),
            confidence: Confidence::Mid,
            notes: String::new(),
        };
        let row = AnnotationRow::pair(&submission(true), &a, &b, &judgment, &Rubric::default())
            .unwrap_or_else(|err| panic!("pair row should build: {err}"));

        let columns = row.columns().keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(&columns[..3], &["timestamp_utc", "annotator_id", "is_calibration"]);
        assert_eq!(columns[15], "overall");
        assert_eq!(&columns[18..21], &["A_Surprise", "B_Surprise", "delta_Surprise"]);
        assert_eq!(columns.last().copied(), Some("pair_preference"));
        assert_eq!(row.get("pair_preference"), Some(&json!("mixed")));
    }

    #[test]
    fn missing_and_unknown_dimensions_are_rejected() {
        let a = plot(json!({"title": "Alpha"}));
        let mut partial = scores([6, 6, 6, 6]);
        partial.remove("Conflict");
        let judgment = SingleJudgment {
            scores: partial,
            overall: s(5),
            confidence: Confidence::Low,
            notes: String::new(),
        };
        let err = AnnotationRow::single(&submission(false), &a, &judgment, &Rubric::default());
        assert_eq!(err, Err(AnnotationError::MissingDimension("Conflict".to_string())));

        let mut extra = scores([6, 6, 6, 6]);
        extra.insert("Pacing".to_string(), s(3));
        let judgment = SingleJudgment { scores: extra, ..judgment };
        let err = AnnotationRow::single(&submission(false), &a, &judgment, &Rubric::default());
        assert_eq!(err, Err(AnnotationError::UnknownDimension("Pacing".to_string())));
    }

    #[test]
    fn single_row_refuses_dimensions_shadowing_row_columns() {
        let rubric = Rubric {
            dimensions: vec![
                Dimension { key: "is_calibration".to_string(), description: String::new() },
                Dimension { key: "overall".to_string(), description: String::new() },
            ],
            ..Rubric::default()
        };
        let judgment = SingleJudgment {
            scores: [("is_calibration".to_string(), s(3)), ("overall".to_string(), s(9))]
                .into_iter()
                .collect(),
            overall: s(5),
            confidence: Confidence::Mid,
            notes: String::new(),
        };
        let result = AnnotationRow::single(
            &submission(true),
            &plot(json!({"plot_id": "p0"})),
            &judgment,
            &rubric,
        );
        assert!(matches!(result, Err(AnnotationError::Validation(_))));
    }

    #[test]
    fn single_row_lists_dimensions_before_overall() {
        let a = plot(json!({"id": 9, "title": "Solo", "status": "draft"}));
        let judgment = SingleJudgment {
            scores: scores([3, 4, 5, 6]),
            overall: s(4),
            confidence: Confidence::Mid,
            notes: "ok".to_string(),
        };
        let row = AnnotationRow::single(&submission(true), &a, &judgment, &Rubric::default())
            .unwrap_or_else(|err| panic!("single row should build: {err}"));

        let columns = row.columns().keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(
            columns,
            vec![
                "timestamp_utc",
                "annotator_id",
                "is_calibration",
                "plot_id",
                "title",
                "genre",
                "status",
                "seed_id",
                "method",
                "Surprise",
                "Valence",
                "Conflict",
                "Coherence",
                "overall",
                "confidence",
                "notes",
            ]
        );
        assert_eq!(row.get("plot_id"), Some(&json!("9")));
        assert_eq!(row.overall(), Some(4.0));
    }
}
