//! Classifiers trained on embedding features
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use ndarray::Array2;

use crate::error::Result;

pub mod svm;

pub use self::svm::{LinearSvc, SvcParameters};

/// Supervised model over (sample × feature) matrices and class indices
pub trait LearningModel: Send + Sync {
    fn name(&self) -> &str;

    fn is_fitted(&self) -> bool;

    fn fit(&mut self, x: &Array2<f32>, y: &[u16]) -> Result<()>;

    /// Per-class scores, one column per class in ascending class order
    fn decision_function(&self, x: &Array2<f32>) -> Result<Array2<f32>>;

    fn predict(&self, x: &Array2<f32>) -> Result<Vec<u16>>;
}
