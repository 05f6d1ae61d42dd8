use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::annotation::{AnnotationRow, PairJudgment, SingleJudgment, Submission};
use crate::ingest::{ingest, IngestReport, Source};
use crate::normalize::normalize;
use crate::record::{identity, PlotRecord, PlotSummary};
use crate::rubric::Rubric;
use crate::selection::{pick_pair, pick_single, PairSelection};
use crate::AnnotationError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionStats {
    pub annotator_id: String,
    pub plots_loaded: usize,
    pub annotations_saved: usize,
    pub gold_plots: usize,
}

/// State owned by one operator: loaded plots, gold set, annotations and selection.
///
/// Every operation runs to completion against `&mut self`; there is no shared state
/// between sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    annotator_id: String,
    plots: Vec<PlotRecord>,
    gold: BTreeSet<String>,
    annotations: Vec<AnnotationRow>,
    pair: PairSelection,
    single: usize,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a session from persisted parts. Plots are re-deduplicated and gold ids that
    /// no longer match a loaded plot are dropped.
    #[must_use]
    pub fn restore(
        annotator_id: String,
        plots: Vec<PlotRecord>,
        gold: BTreeSet<String>,
        annotations: Vec<AnnotationRow>,
        pair: PairSelection,
        single: usize,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let plots = plots
            .into_iter()
            .filter(|plot| seen.insert(identity(plot)))
            .collect::<Vec<_>>();
        let gold = gold.into_iter().filter(|id| seen.contains(id)).collect::<BTreeSet<_>>();
        Self { annotator_id, plots, gold, annotations, pair, single }
    }

    #[must_use]
    pub fn annotator_id(&self) -> &str {
        &self.annotator_id
    }

    pub fn set_annotator(&mut self, annotator_id: &str) {
        self.annotator_id = annotator_id.trim().to_string();
    }

    #[must_use]
    pub fn plots(&self) -> &[PlotRecord] {
        &self.plots
    }

    #[must_use]
    pub fn annotations(&self) -> &[AnnotationRow] {
        &self.annotations
    }

    #[must_use]
    pub fn gold_ids(&self) -> &BTreeSet<String> {
        &self.gold
    }

    #[must_use]
    pub fn is_gold(&self, plot_id: &str) -> bool {
        self.gold.contains(plot_id)
    }

    #[must_use]
    pub fn pair(&self) -> PairSelection {
        self.pair
    }

    #[must_use]
    pub fn single(&self) -> usize {
        self.single
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            annotator_id: self.annotator_id.clone(),
            plots_loaded: self.plots.len(),
            annotations_saved: self.annotations.len(),
            gold_plots: self.gold.len(),
        }
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<PlotSummary> {
        self.plots
            .iter()
            .enumerate()
            .map(|(index, plot)| plot.summary(index, self.is_gold(&identity(plot))))
            .collect()
    }

    /// Load sources into the plot collection, skipping duplicates and unparseable input.
    pub fn ingest(&mut self, sources: &[Source]) -> IngestReport {
        let (plots, report) = ingest(std::mem::take(&mut self.plots), sources);
        self.plots = plots;
        report
    }

    /// Drop all plots together with the gold set and selection state. Annotations stay.
    pub fn clear_plots(&mut self) {
        self.plots.clear();
        self.gold.clear();
        self.pair = PairSelection::default();
        self.single = 0;
    }

    pub fn clear_annotations(&mut self) {
        self.annotations.clear();
    }

    /// Replace the gold set wholesale.
    ///
    /// # Errors
    /// Returns [`AnnotationError::UnknownPlot`] when an id does not match a loaded plot;
    /// the gold set is left untouched in that case.
    pub fn set_gold<I>(&mut self, plot_ids: I) -> Result<(), AnnotationError>
    where
        I: IntoIterator<Item = String>,
    {
        let loaded = self.plots.iter().map(identity).collect::<BTreeSet<_>>();
        let mut gold = BTreeSet::new();
        for plot_id in plot_ids {
            if !loaded.contains(&plot_id) {
                return Err(AnnotationError::UnknownPlot(plot_id));
            }
            gold.insert(plot_id);
        }
        self.gold = gold;
        Ok(())
    }

    /// Replace the gold set with the plots at `indices`.
    ///
    /// # Errors
    /// Returns [`AnnotationError::IndexOutOfRange`] for an index past the collection.
    pub fn set_gold_by_index<I>(&mut self, indices: I) -> Result<(), AnnotationError>
    where
        I: IntoIterator<Item = usize>,
    {
        let ids = indices
            .into_iter()
            .map(|index| self.plot_at(index).map(identity))
            .collect::<Result<Vec<_>, _>>()?;
        self.set_gold(ids)
    }

    fn plot_at(&self, index: usize) -> Result<&PlotRecord, AnnotationError> {
        self.plots
            .get(index)
            .ok_or(AnnotationError::IndexOutOfRange { index, len: self.plots.len() })
    }

    /// Choose the pair to annotate. When at least two plots are loaded and `b == a`, plot B
    /// falls back to index `0` (or `1` when A is `0`).
    ///
    /// # Errors
    /// Returns [`AnnotationError::IndexOutOfRange`] when either index is not loaded.
    pub fn select_pair(&mut self, a: usize, b: usize) -> Result<PairSelection, AnnotationError> {
        self.plot_at(a)?;
        self.plot_at(b)?;
        let b = if a == b && self.plots.len() >= 2 { usize::from(a == 0) } else { b };
        self.pair = PairSelection { a, b };
        Ok(self.pair)
    }

    /// Pick a random pair of distinct plots. Returns `None` when nothing is loaded.
    pub fn random_pair<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<PairSelection> {
        let pair = pick_pair(self.plots.len(), rng)?;
        self.pair = pair;
        Some(pair)
    }

    /// # Errors
    /// Returns [`AnnotationError::IndexOutOfRange`] when `index` is not loaded.
    pub fn select_single(&mut self, index: usize) -> Result<usize, AnnotationError> {
        self.plot_at(index)?;
        self.single = index;
        Ok(index)
    }

    pub fn random_single<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        let index = pick_single(self.plots.len(), rng)?;
        self.single = index;
        Some(index)
    }

    /// The two plots currently selected for pairwise annotation.
    ///
    /// # Errors
    /// Returns an error when fewer than two plots are loaded or the selection is stale.
    pub fn current_pair(&self) -> Result<(&PlotRecord, &PlotRecord), AnnotationError> {
        self.require_plots(2)?;
        Ok((self.plot_at(self.pair.a)?, self.plot_at(self.pair.b)?))
    }

    /// # Errors
    /// Returns an error when no plot is loaded or the selection is stale.
    pub fn current_single(&self) -> Result<&PlotRecord, AnnotationError> {
        self.require_plots(1)?;
        self.plot_at(self.single)
    }

    fn require_plots(&self, required: usize) -> Result<(), AnnotationError> {
        if self.plots.len() < required {
            return Err(AnnotationError::NotEnoughPlots { required, loaded: self.plots.len() });
        }
        Ok(())
    }

    fn require_annotator(&self) -> Result<(), AnnotationError> {
        if self.annotator_id.trim().is_empty() {
            return Err(AnnotationError::MissingAnnotator);
        }
        Ok(())
    }

    /// Score the current pair and append the resulting row.
    ///
    /// The row is a calibration row when either plot is in the gold set right now.
    ///
    /// # Errors
    /// Returns [`AnnotationError::MissingAnnotator`] when no annotator is set, or any
    /// selection/rubric error. Nothing is appended on error.
    pub fn submit_pair(
        &mut self,
        judgment: &PairJudgment,
        rubric: &Rubric,
        timestamp_utc: OffsetDateTime,
    ) -> Result<&AnnotationRow, AnnotationError> {
        self.require_annotator()?;
        let (plot_a, plot_b) = self.current_pair()?;
        let submission = Submission {
            timestamp_utc,
            annotator_id: &self.annotator_id,
            is_calibration: self.is_gold(&identity(plot_a)) || self.is_gold(&identity(plot_b)),
        };
        let row = AnnotationRow::pair(&submission, plot_a, plot_b, judgment, rubric)?;
        Ok(self.push_annotation(row))
    }

    /// Score the currently selected single plot and append the resulting row.
    ///
    /// # Errors
    /// Same conditions as [`Session::submit_pair`], with at least one plot required.
    pub fn submit_single(
        &mut self,
        judgment: &SingleJudgment,
        rubric: &Rubric,
        timestamp_utc: OffsetDateTime,
    ) -> Result<&AnnotationRow, AnnotationError> {
        self.require_annotator()?;
        let plot = self.current_single()?;
        let submission = Submission {
            timestamp_utc,
            annotator_id: &self.annotator_id,
            is_calibration: self.is_gold(&identity(plot)),
        };
        let row = AnnotationRow::single(&submission, plot, judgment, rubric)?;
        Ok(self.push_annotation(row))
    }

    fn push_annotation(&mut self, row: AnnotationRow) -> &AnnotationRow {
        self.annotations.push(row);
        let index = self.annotations.len() - 1;
        &self.annotations[index]
    }

    #[must_use]
    pub fn normalized_annotations(&self) -> Vec<AnnotationRow> {
        normalize(&self.annotations)
    }
}
