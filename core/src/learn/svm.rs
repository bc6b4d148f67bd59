//! One-vs-rest linear support vector classifier
//!
//! Each class gets a hinge-loss hyperplane trained by Pegasos stochastic
//! sub-gradient descent. Classes train in parallel, each from its own seeded
//! sample order, so a fit is reproducible.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::time::Instant;

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{HyperclassError, Result};
use crate::learn::LearningModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvcParameters {
    /// Standardize every feature to zero mean and unit variance
    pub normalize: bool,

    /// Pegasos regularization strength (lambda)
    pub regularization: f32,

    pub max_epochs: usize,

    /// Relative weight change per epoch below which training stops
    pub tol: f32,

    pub fit_intercept: bool,

    pub seed: u64,
}

impl Default for SvcParameters {
    fn default() -> Self {
        Self {
            normalize: true,
            regularization: 0.01,
            max_epochs: 100,
            tol: 1e-5,
            fit_intercept: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StandardScaler {
    mean: Array1<f32>,
    scale: Array1<f32>,
}

impl StandardScaler {
    fn fit(x: &Array2<f32>) -> Self {
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f32::EPSILON { s } else { 1.0 });
        Self { mean, scale }
    }

    fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        (x - &self.mean) / &self.scale
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearSvc {
    params: SvcParameters,
    scaler: Option<StandardScaler>,
    classes: Vec<u16>,
    /// One hyperplane per class, intercept in the last column when fitted
    weights: Option<Array2<f32>>,
}

impl LinearSvc {
    pub fn new(params: SvcParameters) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Classes seen during fitting, in ascending order
    pub fn classes(&self) -> &[u16] {
        &self.classes
    }

    fn prepare(&self, x: &Array2<f32>) -> Array2<f32> {
        let scaled = match &self.scaler {
            Some(scaler) => scaler.apply(x),
            None => x.clone(),
        };
        if self.params.fit_intercept {
            let features = scaled.ncols();
            Array2::from_shape_fn((scaled.nrows(), features + 1), |(i, j)| {
                if j < features {
                    scaled[[i, j]]
                } else {
                    1.0
                }
            })
        } else {
            scaled
        }
    }

    fn train_class(&self, x: &Array2<f32>, targets: &[f32], class_index: usize) -> (Array1<f32>, usize) {
        let lambda = self.params.regularization.max(f32::EPSILON);
        let mut weights = Array1::<f32>::zeros(x.ncols());
        let mut order: Vec<usize> = (0..x.nrows()).collect();
        let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(class_index as u64));
        let mut step = 1usize;
        let mut epochs = 0;
        for _ in 0..self.params.max_epochs {
            epochs += 1;
            let previous = weights.clone();
            order.shuffle(&mut rng);
            for &i in &order {
                let eta = 1.0 / (lambda * step as f32);
                let sample = x.row(i);
                let margin = targets[i] * weights.dot(&sample);
                weights *= 1.0 - eta * lambda;
                if margin < 1.0 {
                    weights.scaled_add(eta * targets[i], &sample);
                }
                step += 1;
            }
            let change = (&weights - &previous).mapv(|v| v * v).sum().sqrt();
            let norm = previous.mapv(|v| v * v).sum().sqrt().max(f32::EPSILON);
            if change / norm < self.params.tol {
                break;
            }
        }
        (weights, epochs)
    }

    /// Trained weights and the prepared input, once shapes agree
    fn checked(&self, x: &Array2<f32>) -> Result<(&Array2<f32>, Array2<f32>)> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| HyperclassError::NotFitted("classifier has not been trained".to_owned()))?;
        let expected = weights.ncols() - usize::from(self.params.fit_intercept);
        if x.ncols() != expected {
            return Err(HyperclassError::InvalidParameter {
                name: "x".to_owned(),
                reason: format!("{} features, classifier expects {expected}", x.ncols()),
            });
        }
        Ok((weights, self.prepare(x)))
    }

    fn scores(&self, weights: &Array2<f32>, sample: ArrayView1<f32>) -> Vec<f32> {
        weights.rows().into_iter().map(|w| w.dot(&sample)).collect()
    }
}

impl LearningModel for LinearSvc {
    fn name(&self) -> &str {
        "svc"
    }

    fn is_fitted(&self) -> bool {
        self.weights.is_some()
    }

    fn fit(&mut self, x: &Array2<f32>, y: &[u16]) -> Result<()> {
        if x.nrows() == 0 || x.nrows() != y.len() {
            return Err(HyperclassError::InsufficientData {
                samples: x.nrows().min(y.len()),
                required: 1,
            });
        }
        let started = Instant::now();
        info!("Running SVC fit, X shape: {:?}, y length: {}", x.dim(), y.len());
        self.scaler = self.params.normalize.then(|| StandardScaler::fit(x));
        let prepared = self.prepare(x);

        let mut classes: Vec<u16> = y.to_vec();
        classes.sort_unstable();
        classes.dedup();

        let trained: Vec<(Array1<f32>, usize)> = classes
            .par_iter()
            .enumerate()
            .map(|(index, &class)| {
                let targets: Vec<f32> = y.iter().map(|&label| if label == class { 1.0 } else { -1.0 }).collect();
                self.train_class(&prepared, &targets, index)
            })
            .collect();

        let mut weights = Array2::zeros((classes.len(), prepared.ncols()));
        for (mut row, (w, epochs)) in weights.rows_mut().into_iter().zip(trained) {
            row.assign(&w);
            debug!("Class hyperplane converged after {epochs} epochs");
        }
        self.classes = classes;
        self.weights = Some(weights);
        info!("Completed SVC fit in {:?}", started.elapsed());
        Ok(())
    }

    fn decision_function(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let (weights, prepared) = self.checked(x)?;
        Ok(prepared.dot(&weights.t()))
    }

    fn predict(&self, x: &Array2<f32>) -> Result<Vec<u16>> {
        let (weights, prepared) = self.checked(x)?;
        if self.classes.len() == 1 {
            return Ok(vec![self.classes[0]; x.nrows()]);
        }
        Ok(prepared
            .rows()
            .into_iter()
            .map(|sample| {
                let scores = self.scores(weights, sample);
                let best = scores
                    .iter()
                    .enumerate()
                    .fold(0, |best, (i, s)| if *s > scores[best] { i } else { best });
                self.classes[best]
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three separable groups of ten samples
    fn data() -> (Array2<f32>, Vec<u16>) {
        let centers = [(5.0f32, 0.0f32), (-5.0, 0.0), (0.0, 5.0)];
        let x = Array2::from_shape_fn((30, 2), |(i, d)| {
            let (cx, cy) = centers[i / 10];
            let jitter = ((i * 13 + d * 7) % 5) as f32 * 0.1 - 0.2;
            if d == 0 { cx + jitter } else { cy + jitter }
        });
        let y = (0..30).map(|i| (i / 10 + 1) as u16).collect();
        (x, y)
    }

    #[test]
    fn test_separable_classes_are_learned() {
        let (x, y) = data();
        let mut svc = LinearSvc::new(SvcParameters::default());
        svc.fit(&x, &y).unwrap();
        assert_eq!(svc.classes(), &[1, 2, 3]);
        assert_eq!(svc.predict(&x).unwrap(), y);
        assert_eq!(svc.decision_function(&x).unwrap().dim(), (30, 3));
    }

    #[test]
    fn test_intercept_and_raw_features() {
        let (x, y) = data();
        let mut svc = LinearSvc::new(SvcParameters {
            normalize: false,
            fit_intercept: true,
            ..SvcParameters::default()
        });
        svc.fit(&x, &y).unwrap();
        assert_eq!(svc.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_predict_before_fit() {
        let svc = LinearSvc::new(SvcParameters::default());
        assert!(matches!(svc.predict(&data().0), Err(HyperclassError::NotFitted(_))));
    }

    #[test]
    fn test_fit_is_reproducible() {
        let (x, y) = data();
        let mut a = LinearSvc::new(SvcParameters::default());
        let mut b = LinearSvc::new(SvcParameters::default());
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.decision_function(&x).unwrap(), b.decision_function(&x).unwrap());
    }
}
