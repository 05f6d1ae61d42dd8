//! Scoring rubric configuration.
//!
//! A rubric names the judged dimensions and the form defaults. It is read from YAML:
//!
//! ```yaml
//! dimensions:
//!   - key: Surprise
//!     description: novelty, twists, unpredictability
//!   - key: Coherence
//!     description: causal consistency
//! default_score: 6
//! default_confidence: mid
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::annotation::{Confidence, DimensionScores, Score};
use crate::AnnotationError;

/// Column names an annotation row already uses; a dimension key may not shadow them.
pub const RESERVED_DIMENSION_KEYS: [&str; 14] = [
    "timestamp_utc",
    "annotator_id",
    "is_calibration",
    "plot_id",
    "title",
    "genre",
    "status",
    "seed_id",
    "method",
    "overall",
    "confidence",
    "notes",
    "overall_z",
    "pair_preference",
];

#[derive(Debug, Error)]
pub enum RubricError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dimension {
    pub key: String,
    #[serde(default)]
    pub description: String,
}

impl Dimension {
    fn new(key: &str, description: &str) -> Self {
        Self { key: key.to_string(), description: description.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rubric {
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<Dimension>,
    #[serde(default = "default_score")]
    pub default_score: u8,
    #[serde(default)]
    pub default_confidence: Confidence,
}

fn default_dimensions() -> Vec<Dimension> {
    vec![
        Dimension::new("Surprise", "novelty, reversals and unpredictability of the plot"),
        Dimension::new("Valence", "intensity of emotional swings (joy, sorrow and the like)"),
        Dimension::new(
            "Conflict",
            "strength and variety of conflict (person/person, person/self, person/world)",
        ),
        Dimension::new("Coherence", "causal consistency and overall plausibility"),
    ]
}

fn default_score() -> u8 {
    6
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            default_score: default_score(),
            default_confidence: Confidence::default(),
        }
    }
}

impl Rubric {
    /// Parse a rubric YAML file from a path.
    ///
    /// # Errors
    /// Returns [`RubricError`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, RubricError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a rubric from a YAML string.
    ///
    /// # Errors
    /// Returns [`RubricError`] when the YAML is malformed or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, RubricError> {
        let rubric: Rubric = serde_yaml::from_str(yaml)?;
        rubric.validate()?;
        Ok(rubric)
    }

    fn validate(&self) -> Result<(), RubricError> {
        if self.dimensions.is_empty() {
            return Err(RubricError::Validation("At least one dimension must be defined".into()));
        }

        let mut seen = BTreeSet::new();
        for dimension in &self.dimensions {
            if dimension.key.is_empty()
                || !dimension.key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(RubricError::Validation(format!(
                    "Dimension key '{}' must contain only alphanumeric characters and underscores",
                    dimension.key
                )));
            }
            if RESERVED_DIMENSION_KEYS.contains(&dimension.key.as_str()) {
                return Err(RubricError::Validation(format!(
                    "Dimension key '{}' collides with an annotation column",
                    dimension.key
                )));
            }
            if !seen.insert(dimension.key.as_str()) {
                return Err(RubricError::Validation(format!(
                    "Dimension key '{}' is defined more than once",
                    dimension.key
                )));
            }
        }

        Score::new(i64::from(self.default_score))
            .map_err(|err| RubricError::Validation(format!("default_score: {err}")))?;

        Ok(())
    }

    #[must_use]
    pub fn dimension_keys(&self) -> Vec<&str> {
        self.dimensions.iter().map(|dimension| dimension.key.as_str()).collect()
    }

    #[must_use]
    pub fn default_score(&self) -> Score {
        Score::clamped(i64::from(self.default_score))
    }

    /// Ensure `scores` covers exactly this rubric's dimensions.
    ///
    /// # Errors
    /// Returns [`AnnotationError::UnknownDimension`] or
    /// [`AnnotationError::MissingDimension`].
    pub fn check_scores(&self, scores: &DimensionScores) -> Result<(), AnnotationError> {
        for key in scores.keys() {
            if !self.dimensions.iter().any(|dimension| &dimension.key == key) {
                return Err(AnnotationError::UnknownDimension(key.clone()));
            }
        }
        for dimension in &self.dimensions {
            if !scores.contains_key(&dimension.key) {
                return Err(AnnotationError::MissingDimension(dimension.key.clone()));
            }
        }
        Ok(())
    }

    /// Scores for every dimension at the rubric default, overridden by `overrides`.
    ///
    /// # Errors
    /// Returns [`AnnotationError::UnknownDimension`] for an override the rubric lacks.
    pub fn fill_scores<I>(&self, overrides: I) -> Result<DimensionScores, AnnotationError>
    where
        I: IntoIterator<Item = (String, Score)>,
    {
        let mut scores = self
            .dimensions
            .iter()
            .map(|dimension| (dimension.key.clone(), self.default_score()))
            .collect::<DimensionScores>();
        for (key, value) in overrides {
            if !scores.contains_key(&key) {
                return Err(AnnotationError::UnknownDimension(key));
            }
            scores.insert(key, value);
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rubric_has_four_dimensions() {
        let rubric = Rubric::default();
        assert_eq!(rubric.dimension_keys(), vec!["Surprise", "Valence", "Conflict", "Coherence"]);
        assert_eq!(rubric.default_score().get(), 6);
        assert_eq!(rubric.default_confidence, Confidence::Mid);
    }

    #[test]
    fn parse_custom_rubric() {
        let yaml = r"
dimensions:
  - key: Pacing
    description: scene rhythm
  - key: Stakes
default_score: 5
default_confidence: high
";
        let rubric = Rubric::parse(yaml).unwrap_or_else(|err| panic!("rubric should parse: {err}"));
        assert_eq!(rubric.dimension_keys(), vec!["Pacing", "Stakes"]);
        assert_eq!(rubric.dimensions[1].description, "");
        assert_eq!(rubric.default_score, 5);
        assert_eq!(rubric.default_confidence, Confidence::High);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let rubric = Rubric::parse("default_score: 7\n")
            .unwrap_or_else(|err| panic!("rubric should parse: {err}"));
        assert_eq!(rubric.dimensions, Rubric::default().dimensions);
        assert_eq!(rubric.default_score, 7);
    }

    #[test]
    fn rejects_invalid_rubrics() {
        assert!(matches!(Rubric::parse("dimensions: []\n"), Err(RubricError::Validation(_))));
        assert!(matches!(
            Rubric::parse("dimensions:\n  - key: A\n  - key: A\n"),
            Err(RubricError::Validation(_))
        ));
        assert!(matches!(
            Rubric::parse("dimensions:\n  - key: has space\n"),
            Err(RubricError::Validation(_))
        ));
        assert!(matches!(Rubric::parse("default_score: 11\n"), Err(RubricError::Validation(_))));
        for reserved in ["is_calibration", "overall", "annotator_id", "overall_z", "notes"] {
            let yaml = format!("dimensions:\n  - key: Pacing\n  - key: {reserved}\n");
            assert!(
                matches!(Rubric::parse(&yaml), Err(RubricError::Validation(_))),
                "dimension key {reserved} should be rejected"
            );
        }
        assert!(matches!(Rubric::parse("dimensions: {"), Err(RubricError::Yaml(_))));
    }

    #[test]
    fn fill_scores_applies_overrides() {
        let rubric = Rubric::default();
        let scores = rubric
            .fill_scores([("Conflict".to_string(), Score::clamped(9))])
            .unwrap_or_else(|err| panic!("fill should succeed: {err}"));
        assert_eq!(scores.len(), 4);
        assert_eq!(scores.get("Conflict").map(|score| score.get()), Some(9));
        assert_eq!(scores.get("Surprise").map(|score| score.get()), Some(6));

        let err = rubric.fill_scores([("Pacing".to_string(), Score::clamped(3))]);
        assert_eq!(err, Err(AnnotationError::UnknownDimension("Pacing".to_string())));
    }
}
