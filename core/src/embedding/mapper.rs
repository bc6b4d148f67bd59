//! UMAP-style dimensionality reduction
//!
//! Fitting follows the usual three stages:
//!
//! 1. Local fuzzy membership from the neighbor graph. Each sample gets a
//!    `rho` (distance to its nearest distinct neighbor) and a `sigma` found
//!    by binary search so that its memberships sum to `log2(k + 1)`.
//! 2. Fuzzy union of the directed memberships, `w = a + b - a·b`.
//!    Known labels act as weak supervision: an edge joining two different
//!    classes keeps only `1 - target_weight` of its weight.
//! 3. Stochastic gradient descent on the low-dimensional layout with
//!    negative sampling, using the curve `1 / (1 + a·d^(2b))` fitted to
//!    `min_dist` and `spread`.
//!
//! The optimisation runs single-threaded from one seeded `StdRng`, so a
//! fixed `random_state` reproduces the same layout.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::UmapParameters;
use crate::error::{HyperclassError, Result};
use crate::graph::neighbors::euclidean;
use crate::graph::NeighborGraph;

const SMOOTH_K_TOLERANCE: f32 = 1e-5;
const SMOOTH_K_STEPS: usize = 64;
const MIN_K_DIST_SCALE: f32 = 1e-3;
/// Gradient components are clipped to this magnitude
const GRADIENT_CLIP: f32 = 4.0;
const INIT_RANGE: f32 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainingSet {
    samples: Array2<f32>,
    embedding: Array2<f32>,
    /// Neighbors per sample used during the fit
    n_neighbors: usize,
}

/// A dimensionality-reduction model bound to one training set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapper {
    params: UmapParameters,
    n_components: usize,
    /// Parameters of the curve 1 / (1 + a·d^(2b))
    a: f32,
    b: f32,
    training: Option<TrainingSet>,
}

/// One directed edge of the fuzzy graph
#[derive(Debug, Clone, Copy)]
struct Edge {
    head: usize,
    tail: usize,
    weight: f32,
}

impl Mapper {
    pub fn new(params: UmapParameters, n_components: usize) -> Self {
        let (a, b) = fit_curve(params.spread, params.min_dist);
        Self {
            params,
            n_components,
            a,
            b,
            training: None,
        }
    }

    pub fn params(&self) -> &UmapParameters {
        &self.params
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn curve(&self) -> (f32, f32) {
        (self.a, self.b)
    }

    pub fn is_fitted(&self) -> bool {
        self.training.is_some()
    }

    /// Training set size, zero before fitting
    pub fn n_samples(&self) -> usize {
        self.training.as_ref().map_or(0, |t| t.samples.nrows())
    }

    /// Layout of the training samples
    pub fn embedding(&self) -> Option<&Array2<f32>> {
        self.training.as_ref().map(|t| &t.embedding)
    }

    /// Fits the layout of `samples`, whose neighbor structure is `graph`.
    /// `labels` (one per sample, positive values are classes) are optional
    /// weak supervision.
    pub fn fit(&mut self, samples: &Array2<f32>, graph: &NeighborGraph, labels: Option<&[i16]>) -> Result<()> {
        let n = samples.nrows();
        if n < 2 {
            return Err(HyperclassError::InsufficientData { samples: n, required: 2 });
        }
        if graph.n_samples() != n {
            return Err(HyperclassError::InvalidGraph(format!(
                "graph covers {} samples, training set has {n}",
                graph.n_samples()
            )));
        }
        if let Some(labels) = labels {
            if labels.len() != n {
                return Err(HyperclassError::InvalidParameter {
                    name: "labels".to_owned(),
                    reason: format!("{} labels for {n} samples", labels.len()),
                });
            }
        }
        if self.n_components == 0 {
            return Err(HyperclassError::InvalidParameter {
                name: "n_components".to_owned(),
                reason: "must be positive".to_owned(),
            });
        }

        let started = Instant::now();
        let (rhos, sigmas) = smooth_knn_distances(graph);
        let mut edges = fuzzy_union(graph, &rhos, &sigmas);
        if let Some(labels) = labels {
            let cut = apply_label_supervision(&mut edges, labels, self.params.target_weight);
            debug!("Weakened {cut} cross-class edges");
        }
        let mut rng = StdRng::seed_from_u64(self.params.random_state);
        let mut coords: Vec<f32> = (0..n * self.n_components)
            .map(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE))
            .collect();
        self.optimize(&mut coords, &edges, n, &mut rng);

        let embedding = Array2::from_shape_vec((n, self.n_components), coords).map_err(|e| {
            HyperclassError::InvalidParameter {
                name: "n_components".to_owned(),
                reason: e.to_string(),
            }
        })?;
        self.training = Some(TrainingSet {
            samples: samples.clone(),
            embedding,
            n_neighbors: graph.k(),
        });
        info!(
            "Completed UMAP fit of {n} samples to {} dimensions in {:?}",
            self.n_components,
            started.elapsed()
        );
        Ok(())
    }

    pub fn fit_transform(
        &mut self,
        samples: &Array2<f32>,
        graph: &NeighborGraph,
        labels: Option<&[i16]>,
    ) -> Result<Array2<f32>> {
        self.fit(samples, graph, labels)?;
        self.embedding()
            .cloned()
            .ok_or_else(|| HyperclassError::NotFitted("mapper fit produced no embedding".to_owned()))
    }

    /// Embeds new samples without refitting. Each sample lands at the
    /// membership-weighted mean of its nearest training samples' positions.
    /// Cost is a brute-force scan of the training set per sample.
    pub fn transform(&self, samples: &Array2<f32>) -> Result<Array2<f32>> {
        let training = self
            .training
            .as_ref()
            .ok_or_else(|| HyperclassError::NotFitted("transform requested before fit".to_owned()))?;
        if samples.ncols() != training.samples.ncols() {
            return Err(HyperclassError::InvalidParameter {
                name: "samples".to_owned(),
                reason: format!(
                    "{} bands, mapper was fitted on {}",
                    samples.ncols(),
                    training.samples.ncols()
                ),
            });
        }
        if samples == &training.samples {
            return Ok(training.embedding.clone());
        }

        let started = Instant::now();
        let k = training.n_neighbors.clamp(1, training.samples.nrows());
        let rows: Vec<Vec<f32>> = (0..samples.nrows())
            .into_par_iter()
            .map(|i| self.place(training, samples.row(i), k))
            .collect();
        let mut out = Array2::zeros((samples.nrows(), self.n_components));
        for (mut target, row) in out.axis_iter_mut(Axis(0)).zip(rows) {
            for (slot, value) in target.iter_mut().zip(row) {
                *slot = value;
            }
        }
        info!("Completed transform of {} samples in {:?}", samples.nrows(), started.elapsed());
        Ok(out)
    }

    fn place(&self, training: &TrainingSet, sample: ArrayView1<f32>, k: usize) -> Vec<f32> {
        let mut nearest: Vec<(usize, f32)> = training
            .samples
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(index, row)| (index, euclidean(sample, row)))
            .collect();
        if k < nearest.len() {
            nearest.select_nth_unstable_by(k - 1, |a, b| a.1.total_cmp(&b.1));
            nearest.truncate(k);
        }
        nearest.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let distances: Vec<f32> = nearest.iter().map(|&(_, d)| d).collect();
        let mean = distances.iter().sum::<f32>() / distances.len() as f32;
        let (rho, sigma) = smooth_knn(&distances, mean);
        let weights: Vec<f32> = distances.iter().map(|&d| membership(d, rho, sigma)).collect();
        let total: f32 = weights.iter().sum();

        let mut position = vec![0.0f32; self.n_components];
        for (&(index, _), &weight) in nearest.iter().zip(&weights) {
            let share = if total > 0.0 { weight / total } else { 1.0 / nearest.len() as f32 };
            for (slot, value) in position.iter_mut().zip(training.embedding.row(index)) {
                *slot += share * value;
            }
        }
        position
    }

    fn optimize(&self, coords: &mut [f32], edges: &[Edge], n: usize, rng: &mut StdRng) {
        let n_epochs = self.params.n_epochs;
        let max_weight = edges.iter().map(|e| e.weight).fold(0.0f32, f32::max);
        if n_epochs == 0 || max_weight <= 0.0 {
            return;
        }
        // Edges too weak to be sampled once in n_epochs are dropped.
        let edges: Vec<Edge> = edges
            .iter()
            .copied()
            .filter(|e| e.weight >= max_weight / n_epochs as f32)
            .collect();
        let dim = self.n_components;
        let (a, b) = (self.a, self.b);
        let negative_rate = self.params.negative_sample_rate.max(1) as f32;

        let epochs_per_sample: Vec<f32> = edges.iter().map(|e| max_weight / e.weight).collect();
        let epochs_per_negative: Vec<f32> = epochs_per_sample.iter().map(|e| e / negative_rate).collect();
        let mut next_sample = epochs_per_sample.clone();
        let mut next_negative = epochs_per_negative.clone();
        debug!("SGD over {} edges for {n_epochs} epochs", edges.len());

        for epoch in 1..=n_epochs {
            let now = epoch as f32;
            let alpha = self.params.learning_rate * (1.0 - (epoch - 1) as f32 / n_epochs as f32);
            for (e, edge) in edges.iter().enumerate() {
                if next_sample[e] > now {
                    continue;
                }
                let (head, tail) = (edge.head * dim, edge.tail * dim);
                let dist_sq = squared_distance(coords, head, tail, dim);
                let coeff = if dist_sq > 0.0 {
                    -2.0 * a * b * dist_sq.powf(b - 1.0) / (a * dist_sq.powf(b) + 1.0)
                } else {
                    0.0
                };
                for d in 0..dim {
                    let grad = clip(coeff * (coords[head + d] - coords[tail + d]));
                    coords[head + d] += grad * alpha;
                    coords[tail + d] -= grad * alpha;
                }
                next_sample[e] += epochs_per_sample[e];

                let negatives = ((now - next_negative[e]) / epochs_per_negative[e]).max(0.0) as usize;
                for _ in 0..negatives {
                    let other = rng.gen_range(0..n);
                    if other == edge.head {
                        continue;
                    }
                    let other = other * dim;
                    let dist_sq = squared_distance(coords, head, other, dim);
                    let coeff = if dist_sq > 0.0 {
                        2.0 * b / ((0.001 + dist_sq) * (a * dist_sq.powf(b) + 1.0))
                    } else {
                        0.0
                    };
                    for d in 0..dim {
                        let grad = if coeff > 0.0 {
                            clip(coeff * (coords[head + d] - coords[other + d]))
                        } else {
                            GRADIENT_CLIP
                        };
                        coords[head + d] += grad * alpha;
                    }
                }
                next_negative[e] += negatives as f32 * epochs_per_negative[e];
            }
        }
    }

    /// Reads a cached mapper; missing or corrupt files yield `None`
    pub fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Mapper>(&text) {
            Ok(mapper) => {
                info!("Loaded mapper from {}", path.display());
                Some(mapper)
            }
            Err(e) => {
                warn!("Ignoring corrupt mapper file {}: {e}", path.display());
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        info!("Saved mapper to {}", path.display());
        Ok(())
    }
}

#[inline]
fn clip(value: f32) -> f32 {
    value.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

#[inline]
fn squared_distance(coords: &[f32], a: usize, b: usize, dim: usize) -> f32 {
    (0..dim)
        .map(|d| {
            let diff = coords[a + d] - coords[b + d];
            diff * diff
        })
        .sum()
}

#[inline]
fn membership(distance: f32, rho: f32, sigma: f32) -> f32 {
    let excess = distance - rho;
    if excess <= 0.0 {
        1.0
    } else {
        (-excess / sigma).exp()
    }
}

/// `rho` and `sigma` for one sorted row of neighbor distances
fn smooth_knn(distances: &[f32], mean_distance: f32) -> (f32, f32) {
    let target = ((distances.len() + 1) as f32).log2();
    let rho = distances.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);
    let (mut lo, mut hi, mut sigma) = (0.0f32, f32::INFINITY, 1.0f32);
    for _ in 0..SMOOTH_K_STEPS {
        let total: f32 = distances.iter().map(|&d| membership(d, rho, sigma)).sum();
        if (total - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if total > target {
            hi = sigma;
            sigma = (lo + hi) / 2.0;
        } else {
            lo = sigma;
            sigma = if hi.is_infinite() { sigma * 2.0 } else { (lo + hi) / 2.0 };
        }
    }
    let row_mean = distances.iter().sum::<f32>() / distances.len().max(1) as f32;
    let floor = if rho > 0.0 { row_mean } else { mean_distance };
    (rho, sigma.max(MIN_K_DIST_SCALE * floor).max(f32::MIN_POSITIVE))
}

fn smooth_knn_distances(graph: &NeighborGraph) -> (Vec<f32>, Vec<f32>) {
    let mean_distance = graph.distances().mean().unwrap_or(0.0);
    (0..graph.n_samples())
        .into_par_iter()
        .map(|i| {
            let row: Vec<f32> = graph.distances().row(i).to_vec();
            smooth_knn(&row, mean_distance)
        })
        .unzip()
}

/// Symmetrised membership graph, both directions of every edge, in a
/// deterministic order
fn fuzzy_union(graph: &NeighborGraph, rhos: &[f32], sigmas: &[f32]) -> Vec<Edge> {
    let mut pairs: BTreeMap<(usize, usize), (f32, f32)> = BTreeMap::new();
    for i in 0..graph.n_samples() {
        for (j, distance) in graph.neighbors(i) {
            if i == j {
                continue;
            }
            let weight = membership(distance, rhos[i], sigmas[i]);
            let entry = pairs.entry((i.min(j), i.max(j))).or_insert((0.0, 0.0));
            if i < j {
                entry.0 = entry.0.max(weight);
            } else {
                entry.1 = entry.1.max(weight);
            }
        }
    }
    let mut edges = Vec::with_capacity(pairs.len() * 2);
    for ((lo, hi), (forward, backward)) in pairs {
        let weight = forward + backward - forward * backward;
        if weight > 0.0 {
            edges.push(Edge { head: lo, tail: hi, weight });
            edges.push(Edge { head: hi, tail: lo, weight });
        }
    }
    edges
}

/// Scales edges joining two different known classes; returns how many
fn apply_label_supervision(edges: &mut [Edge], labels: &[i16], target_weight: f32) -> usize {
    let keep = (1.0 - target_weight).clamp(0.0, 1.0);
    let mut cut = 0;
    for edge in edges.iter_mut() {
        let (a, b) = (labels[edge.head], labels[edge.tail]);
        if a > 0 && b > 0 && a != b {
            edge.weight *= keep;
            cut += 1;
        }
    }
    cut
}

/// Least-squares fit of `1 / (1 + a·x^(2b))` to the target curve that is 1
/// up to `min_dist` and decays as `exp(-(x - min_dist) / spread)` beyond
/// it. Coarse-to-fine grid search over `ln a` and `b`.
pub fn fit_curve(spread: f32, min_dist: f32) -> (f32, f32) {
    let xs: Vec<f64> = (1..=300).map(|i| i as f64 * 3.0 * spread as f64 / 300.0).collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist as f64 {
                1.0
            } else {
                (-(x - min_dist as f64) / spread as f64).exp()
            }
        })
        .collect();
    let error = |ln_a: f64, b: f64| -> f64 {
        let a = ln_a.exp();
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let fitted = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (fitted - y) * (fitted - y)
            })
            .sum()
    };

    const STEPS: usize = 40;
    let (mut ln_a_lo, mut ln_a_hi) = ((0.01f64).ln(), (100.0f64).ln());
    let (mut b_lo, mut b_hi) = (0.1f64, 3.0f64);
    let mut best = (0.0f64, 1.0f64, f64::INFINITY);
    for _ in 0..6 {
        let a_step = (ln_a_hi - ln_a_lo) / STEPS as f64;
        let b_step = (b_hi - b_lo) / STEPS as f64;
        for i in 0..=STEPS {
            let ln_a = ln_a_lo + i as f64 * a_step;
            for j in 0..=STEPS {
                let b = b_lo + j as f64 * b_step;
                let e = error(ln_a, b);
                if e < best.2 {
                    best = (ln_a, b, e);
                }
            }
        }
        ln_a_lo = best.0 - 2.0 * a_step;
        ln_a_hi = best.0 + 2.0 * a_step;
        b_lo = (best.1 - 2.0 * b_step).max(1e-3);
        b_hi = best.1 + 2.0 * b_step;
    }
    (best.0.exp() as f32, best.1 as f32)
}
