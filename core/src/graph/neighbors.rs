//! Approximate k-nearest-neighbor graph over point samples
//!
//! Small sample sets are solved exactly by a parallel brute-force scan,
//! O(n² · bands). Larger sets use NN-descent: every sample starts from
//! random neighbor lists and repeatedly improves them by joining the
//! neighbors of its neighbors, which needs roughly O(n · k² · iters) distance
//! evaluations instead of O(n²).
//!
//! # Reproducibility
//! All randomness is drawn from `StdRng` streams derived from the configured
//! seed and the sample index, and parallel phases collect their results in
//! sample order before applying them, so a fixed seed yields the same graph
//! on every run regardless of thread count.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::time::Instant;

use log::{debug, info};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::GraphParameters;
use crate::data::PointData;
use crate::error::{HyperclassError, Result};

/// Fraction of n·k list updates below which NN-descent stops early
const EARLY_TERMINATION_DELTA: f64 = 0.001;

/// Directed k-NN lists: row `s` holds the k nearest samples to `s`
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborGraph {
    indices: Array2<usize>,
    distances: Array2<f32>,
}

/// Undirected view of a neighbor graph in compressed sparse row layout
#[derive(Debug, Clone, PartialEq)]
pub struct Adjacency {
    offsets: Vec<usize>,
    targets: Vec<usize>,
    weights: Vec<f32>,
}

impl Adjacency {
    pub fn n_samples(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Neighbors of `sample` with edge lengths, in list order
    pub fn neighbors(&self, sample: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let range = self.offsets[sample]..self.offsets[sample + 1];
        self.targets[range.clone()]
            .iter()
            .copied()
            .zip(self.weights[range].iter().copied())
    }

    pub fn degree(&self, sample: usize) -> usize {
        self.offsets[sample + 1] - self.offsets[sample]
    }
}

impl NeighborGraph {
    /// Wraps externally computed arrays after checking their consistency
    pub fn from_parts(indices: Array2<usize>, distances: Array2<f32>) -> Result<Self> {
        if indices.shape() != distances.shape() {
            return Err(HyperclassError::InvalidGraph(format!(
                "index shape {:?} does not match distance shape {:?}",
                indices.shape(),
                distances.shape()
            )));
        }
        let n = indices.nrows();
        if let Some(bad) = indices.iter().find(|&&index| index >= n) {
            return Err(HyperclassError::InvalidGraph(format!(
                "neighbor index {bad} outside {n} samples"
            )));
        }
        if distances.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(HyperclassError::InvalidGraph(
                "distances must be finite and non-negative".to_owned(),
            ));
        }
        Ok(Self { indices, distances })
    }

    pub fn n_samples(&self) -> usize {
        self.indices.nrows()
    }

    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    pub fn indices(&self) -> &Array2<usize> {
        &self.indices
    }

    pub fn distances(&self) -> &Array2<f32> {
        &self.distances
    }

    /// Directed neighbor row of `sample`
    pub fn neighbors(&self, sample: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices
            .row(sample)
            .into_iter()
            .copied()
            .zip(self.distances.row(sample).into_iter().copied())
    }

    /// Symmetrised adjacency: each sample's own list in native order,
    /// followed by samples that list it, in increasing index order.
    /// Self-loops and duplicate edges are dropped.
    pub fn symmetric_adjacency(&self) -> Adjacency {
        let n = self.n_samples();
        let mut reverse: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];
        for source in 0..n {
            for (target, distance) in self.neighbors(source) {
                reverse[target].push((source, distance));
            }
        }

        let mut offsets = Vec::with_capacity(n + 1);
        let mut targets = Vec::with_capacity(n * self.k() * 2);
        let mut weights = Vec::with_capacity(n * self.k() * 2);
        offsets.push(0);
        for sample in 0..n {
            let start = targets.len();
            let forward = self.neighbors(sample);
            let backward = reverse[sample].iter().copied();
            for (target, distance) in forward.chain(backward) {
                if target == sample || targets[start..].contains(&target) {
                    continue;
                }
                targets.push(target);
                weights.push(distance);
            }
            offsets.push(targets.len());
        }
        Adjacency {
            offsets,
            targets,
            weights,
        }
    }
}

#[inline]
pub(crate) fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Bounded neighbor list kept sorted by distance
#[derive(Debug, Clone)]
struct NeighborList {
    capacity: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    index: usize,
    distance: f32,
    is_new: bool,
}

impl NeighborList {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    /// Inserts a candidate; returns true when the list changed
    fn push(&mut self, index: usize, distance: f32) -> bool {
        if self.entries.len() == self.capacity {
            match self.entries.last() {
                Some(worst) if distance >= worst.distance => return false,
                _ => {}
            }
        }
        if self.entries.iter().any(|entry| entry.index == index) {
            return false;
        }
        let position = self.entries.partition_point(|entry| entry.distance <= distance);
        self.entries.insert(
            position,
            Entry {
                index,
                distance,
                is_new: true,
            },
        );
        self.entries.truncate(self.capacity);
        true
    }
}

/// Neighbor graph construction with configurable tuning
#[derive(Debug, Clone)]
pub struct NeighborGraphBuilder {
    params: GraphParameters,
}

impl NeighborGraphBuilder {
    pub fn new(params: GraphParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GraphParameters {
        &self.params
    }

    pub fn build(&self, points: &PointData) -> Result<NeighborGraph> {
        let n = points.n_samples();
        let k = self.params.n_neighbors;
        if k == 0 {
            return Err(HyperclassError::InvalidParameter {
                name: "graph.n_neighbors".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if n < k + 1 {
            return Err(HyperclassError::InsufficientData {
                samples: n,
                required: k + 1,
            });
        }
        let started = Instant::now();
        let graph = if n <= self.params.brute_force_threshold {
            self.build_exact(points.samples(), k)
        } else {
            self.build_descent(points.samples(), k)
        };
        info!(
            "Completed computing {k}-NN graph over {n} samples in {:?}",
            started.elapsed()
        );
        Ok(graph)
    }

    fn build_exact(&self, samples: &Array2<f32>, k: usize) -> NeighborGraph {
        let n = samples.nrows();
        let rows: Vec<Vec<(usize, f32)>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let anchor = samples.row(i);
                let mut candidates: Vec<(usize, f32)> = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| (j, euclidean(anchor, samples.row(j))))
                    .collect();
                candidates.select_nth_unstable_by(k - 1, |a, b| compare(a, b));
                candidates.truncate(k);
                candidates.sort_by(compare);
                candidates
            })
            .collect();
        assemble(rows, k)
    }

    fn build_descent(&self, samples: &Array2<f32>, k: usize) -> NeighborGraph {
        let n = samples.nrows();
        let restarts = self.params.trees_for(n);
        let iterations = self.params.iterations_for(n);
        let max_candidates = self.params.max_candidates.max(k);
        let seed = self.params.seed;
        debug!("NN-descent over {n} samples: {restarts} restarts, {iterations} iterations");

        let mut lists: Vec<NeighborList> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let mut list = NeighborList::new(k);
                for _ in 0..restarts {
                    for j in rand::seq::index::sample(&mut rng, n, (k + 1).min(n)).into_iter() {
                        if j != i {
                            list.push(j, euclidean(samples.row(i), samples.row(j)));
                        }
                    }
                }
                list
            })
            .collect();

        for iteration in 0..iterations {
            let (new_candidates, old_candidates) = collect_candidates(&mut lists, max_candidates);

            let proposals: Vec<Vec<(usize, usize, f32)>> = (0..n)
                .into_par_iter()
                .map(|i| {
                    let news = &new_candidates[i];
                    let olds = &old_candidates[i];
                    let mut local = Vec::new();
                    for (a, &u) in news.iter().enumerate() {
                        for &v in news[a + 1..].iter().chain(olds.iter()) {
                            if u != v {
                                local.push((u, v, euclidean(samples.row(u), samples.row(v))));
                            }
                        }
                    }
                    local
                })
                .collect();

            let mut updates = 0usize;
            for (u, v, distance) in proposals.into_iter().flatten() {
                updates += usize::from(lists[u].push(v, distance));
                updates += usize::from(lists[v].push(u, distance));
            }
            debug!("NN-descent iteration {iteration}: {updates} updates");
            if (updates as f64) < EARLY_TERMINATION_DELTA * (n * k) as f64 {
                break;
            }
        }

        let rows = lists
            .into_iter()
            .map(|list| list.entries.into_iter().map(|e| (e.index, e.distance)).collect())
            .collect();
        assemble(rows, k)
    }
}

/// Splits each list into new and old candidates (with reverse edges) and
/// marks the sampled new entries as old.
fn collect_candidates(lists: &mut [NeighborList], max_candidates: usize) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    let n = lists.len();
    let mut news: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut olds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for entry in lists[i].entries.iter_mut() {
            if entry.is_new {
                if news[i].len() < max_candidates {
                    news[i].push(entry.index);
                    entry.is_new = false;
                }
            } else if olds[i].len() < max_candidates {
                olds[i].push(entry.index);
            }
        }
    }
    let mut reverse_new: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut reverse_old: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for &j in &news[i] {
            if reverse_new[j].len() < max_candidates {
                reverse_new[j].push(i);
            }
        }
        for &j in &olds[i] {
            if reverse_old[j].len() < max_candidates {
                reverse_old[j].push(i);
            }
        }
    }
    for i in 0..n {
        for j in reverse_new[i].drain(..) {
            if !news[i].contains(&j) {
                news[i].push(j);
            }
        }
        for j in reverse_old[i].drain(..) {
            if !olds[i].contains(&j) {
                olds[i].push(j);
            }
        }
    }
    (news, olds)
}

fn compare(a: &(usize, f32), b: &(usize, f32)) -> std::cmp::Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

fn assemble(rows: Vec<Vec<(usize, f32)>>, k: usize) -> NeighborGraph {
    let n = rows.len();
    let mut indices = Array2::zeros((n, k));
    let mut distances = Array2::zeros((n, k));
    for (i, row) in rows.into_iter().enumerate() {
        for (slot, (index, distance)) in row.into_iter().enumerate().take(k) {
            indices[[i, slot]] = index;
            distances[[i, slot]] = distance;
        }
    }
    NeighborGraph { indices, distances }
}
