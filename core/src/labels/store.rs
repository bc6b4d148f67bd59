//! Per-block label state
//!
//! The point selection (map coordinate + class triples, in click order) is
//! the source of truth. The dense label array is always rebuilt from it, so
//! `undo` restores exactly the array that existed before the last add.
//!
//! Label array values: `-1` unlabeled, `0` no-data or background, `1..N`
//! user classes.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::sync::Arc;

use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::data::{Block, PointData};
use crate::error::{HyperclassError, Result};
use crate::graph::NeighborGraph;
use crate::labels::spread::{LabelSpreader, SpreadOutcome};

pub const UNLABELED: i16 = -1;
pub const NO_DATA: i16 = 0;

/// One user click: map coordinates and class index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointLabel {
    pub row: f64,
    pub col: f64,
    pub class: u16,
}

impl PointLabel {
    pub fn new(row: f64, col: f64, class: u16) -> Self {
        Self { row, col, class }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    Unlabeled,
    Sparse,
    Spread,
}

#[derive(Debug)]
pub struct LabelStore {
    block: Arc<Block>,
    point_data: Arc<PointData>,
    /// Initial array: -1 on valid pixels, 0 on no-data
    template: Array2<i16>,
    selection: Vec<PointLabel>,
    labels: Array2<i16>,
    label_map: Option<Array2<i16>>,
    /// Incremented on every edit and spread
    generation: u64,
}

impl LabelStore {
    pub fn new(block: Arc<Block>) -> Self {
        let template = block
            .valid_mask()
            .mapv(|valid| if valid { UNLABELED } else { NO_DATA });
        let point_data = block.point_data();
        Self {
            labels: template.clone(),
            template,
            block,
            point_data,
            selection: Vec::new(),
            label_map: None,
            generation: 0,
        }
    }

    /// Store seeded with a previously persisted selection
    pub fn with_selection(block: Arc<Block>, selection: Vec<PointLabel>) -> Self {
        let mut store = Self::new(block);
        store.selection = selection;
        store.rebuild();
        store
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn point_data(&self) -> &Arc<PointData> {
        &self.point_data
    }

    pub fn selection(&self) -> &[PointLabel] {
        &self.selection
    }

    pub fn labels(&self) -> &Array2<i16> {
        &self.labels
    }

    /// Dense predicted labels from the last spread
    pub fn label_map(&self) -> Option<&Array2<i16>> {
        self.label_map.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LabelState {
        if self.label_map.is_some() {
            LabelState::Spread
        } else if self.selection.is_empty() {
            LabelState::Unlabeled
        } else {
            LabelState::Sparse
        }
    }

    pub fn add_label(&mut self, row: f64, col: f64, class: u16) -> Result<()> {
        if class == 0 {
            return Err(HyperclassError::WorkflowViolation(
                "Select a class before labeling points".to_owned(),
            ));
        }
        if i16::try_from(class).is_err() {
            return Err(HyperclassError::InvalidParameter {
                name: "class".to_owned(),
                reason: format!("{class} exceeds the largest label value {}", i16::MAX),
            });
        }
        self.selection.push(PointLabel::new(row, col, class));
        self.rebuild();
        Ok(())
    }

    /// Removes the most recent point label
    pub fn undo(&mut self) -> Option<PointLabel> {
        let removed = self.selection.pop()?;
        self.rebuild();
        Some(removed)
    }

    /// Discards the selection and any spread result
    pub fn clear(&mut self) {
        self.selection.clear();
        self.rebuild();
    }

    /// Drops the spread result but keeps the selection
    pub fn discard_prediction(&mut self) -> bool {
        if self.label_map.take().is_some() {
            self.generation += 1;
            true
        } else {
            false
        }
    }

    /// True when at least one valid pixel carries a user class
    pub fn has_labels(&self) -> bool {
        self.labeled_point_data().iter().any(|&label| label > 0)
    }

    /// Rewrites the label array from the template and the selection.
    /// Selections outside this block or with an unrepresentable class are
    /// skipped.
    fn rebuild(&mut self) {
        self.labels.assign(&self.template);
        self.label_map = None;
        self.generation += 1;
        let mut applied = 0;
        for label in &self.selection {
            let Ok(class) = i16::try_from(label.class) else {
                warn!("Skipping label with invalid class {} in block {}", label.class, self.block.id());
                continue;
            };
            match self.block.coord2index(label.row, label.col) {
                Some((row, col)) => {
                    self.labels[[row, col]] = class;
                    applied += 1;
                }
                None => warn!(
                    "Skipping out of bounds label at ({}, {}) for block {}",
                    label.row,
                    label.col,
                    self.block.id()
                ),
            }
        }
        debug!("Updated {applied} of {} labels in block {}", self.selection.len(), self.block.id());
    }

    /// Label value of every sample, in point-data order
    pub fn labeled_point_data(&self) -> Vec<i16> {
        self.point_data.raster_to_points(&self.labels)
    }

    /// Spread result when present, otherwise the sparse labels
    pub fn extended_label_points(&self) -> Vec<i16> {
        match &self.label_map {
            Some(map) => self.point_data.raster_to_points(map),
            None => self.labeled_point_data(),
        }
    }

    /// Spreads the current labels over `graph` for a fixed number of rounds
    /// and stores the dense result. Fails without touching any state when
    /// no sample carries a user label.
    pub fn spread(&mut self, graph: &NeighborGraph, iterations: usize) -> Result<SpreadOutcome> {
        if graph.n_samples() != self.point_data.n_samples() {
            return Err(HyperclassError::InvalidGraph(format!(
                "graph covers {} samples, block {} has {}",
                graph.n_samples(),
                self.block.id(),
                self.point_data.n_samples()
            )));
        }
        let seeds: Vec<Option<u16>> = self
            .labeled_point_data()
            .into_iter()
            .map(|label| u16::try_from(label).ok().filter(|&class| class > 0))
            .collect();
        if seeds.iter().all(Option::is_none) {
            return Err(HyperclassError::WorkflowViolation(
                "Label at least one point before spreading".to_owned(),
            ));
        }
        let outcome = LabelSpreader::new(iterations).spread(&graph.symmetric_adjacency(), &seeds);
        let dense: Vec<i16> = outcome
            .labels
            .iter()
            .map(|&label| i16::try_from(label).unwrap_or(NO_DATA))
            .collect();
        self.label_map = Some(self.point_data.points_to_raster(&dense, NO_DATA));
        self.generation += 1;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BlockId, GeoTransform};
    use crate::graph::NeighborGraphBuilder;
    use crate::config::GraphParameters;
    use ndarray::Array3;

    /// 1 x 6 block on a line, pixel (0, 5) is no-data
    fn block() -> Arc<Block> {
        let mut data = Array3::from_shape_fn((2, 1, 6), |(b, _, c)| (c * 10 + b) as f32);
        data[[0, 0, 5]] = f32::NAN;
        Arc::new(Block::new(BlockId::new(0, 0), "tile", (0, 0), data, GeoTransform::identity()))
    }

    fn coord(col: usize) -> (f64, f64) {
        (0.5, col as f64 + 0.5)
    }

    #[test]
    fn test_initial_state() {
        let store = LabelStore::new(block());
        assert_eq!(store.state(), LabelState::Unlabeled);
        assert_eq!(store.labels().row(0).to_vec(), vec![-1, -1, -1, -1, -1, 0]);
    }

    #[test]
    fn test_undo_is_inverse_of_add() {
        let mut store = LabelStore::new(block());
        let (y, x) = coord(1);
        store.add_label(y, x, 2).unwrap();
        let before = store.labels().clone();
        for class in 1..4u16 {
            // Overwrites the same pixel; undo must bring back class 2.
            store.add_label(y, x, class).unwrap();
            assert_eq!(store.state(), LabelState::Sparse);
            assert_eq!(store.undo(), Some(PointLabel::new(y, x, class)));
            assert_eq!(store.labels(), &before);
        }
    }

    #[test]
    fn test_clear_leaves_no_user_class() {
        let mut store = LabelStore::new(block());
        let (y, x) = coord(0);
        store.add_label(y, x, 1).unwrap();
        store.clear();
        assert_eq!(store.state(), LabelState::Unlabeled);
        assert!(store.selection().is_empty());
        assert!(store.labeled_point_data().iter().all(|&v| v == UNLABELED || v == NO_DATA));
        assert!(store.labels().iter().all(|&v| v == UNLABELED || v == NO_DATA));
    }

    #[test]
    fn test_class_zero_is_rejected() {
        let mut store = LabelStore::new(block());
        assert!(matches!(store.add_label(0.5, 0.5, 0), Err(HyperclassError::WorkflowViolation(_))));
        assert!(store.selection().is_empty());
    }

    #[test]
    fn test_out_of_bounds_selection_is_skipped() {
        let selection = vec![PointLabel::new(0.5, 2.5, 1), PointLabel::new(7.5, 2.5, 2)];
        let store = LabelStore::with_selection(block(), selection);
        assert_eq!(store.selection().len(), 2);
        assert_eq!(store.labels().iter().filter(|&&v| v > 0).count(), 1);
        assert_eq!(store.labels()[[0, 2]], 1);
    }

    #[test]
    fn test_class_beyond_label_range() {
        let mut store = LabelStore::new(block());
        let (y, x) = coord(2);
        let result = store.add_label(y, x, 40_000);
        assert!(matches!(result, Err(HyperclassError::InvalidParameter { .. })));
        assert!(store.selection().is_empty());

        // A persisted selection with such a class is skipped, not wrapped.
        let selection = vec![PointLabel::new(y, x, 40_000), PointLabel::new(0.5, 0.5, 2)];
        let store = LabelStore::with_selection(block(), selection);
        assert_eq!(store.labels()[[0, 2]], UNLABELED);
        assert_eq!(store.labels()[[0, 0]], 2);
        assert!(store.labels().iter().all(|&v| v >= UNLABELED));
    }

    #[test]
    fn test_spread_without_labels_changes_nothing() {
        let mut store = LabelStore::new(block());
        let graph = NeighborGraphBuilder::new(GraphParameters {
            n_neighbors: 2,
            ..GraphParameters::default()
        })
        .build(store.point_data())
        .unwrap();
        let generation = store.generation();
        let before = store.labels().clone();
        assert!(matches!(store.spread(&graph, 5), Err(HyperclassError::WorkflowViolation(_))));
        assert_eq!(store.labels(), &before);
        assert_eq!(store.generation(), generation);
        assert_eq!(store.state(), LabelState::Unlabeled);
    }

    #[test]
    fn test_spread_fills_valid_pixels() {
        let mut store = LabelStore::new(block());
        let graph = NeighborGraphBuilder::new(GraphParameters {
            n_neighbors: 2,
            ..GraphParameters::default()
        })
        .build(store.point_data())
        .unwrap();
        let (y, x) = coord(0);
        store.add_label(y, x, 3).unwrap();
        let outcome = store.spread(&graph, 10).unwrap();
        assert_eq!(outcome.coverage(), 5);
        assert_eq!(store.state(), LabelState::Spread);
        let map = store.label_map().unwrap();
        assert_eq!(map.row(0).to_vec(), vec![3, 3, 3, 3, 3, 0]);
        assert_eq!(store.extended_label_points(), vec![3, 3, 3, 3, 3]);

        // An edit discards the prediction.
        store.undo();
        assert_eq!(store.state(), LabelState::Unlabeled);
        assert!(store.label_map().is_none());
    }
}
