//! Hierarchical configuration
//!
//! A JSON document with typed sections. Every key has a default, so partial
//! documents are accepted; generic dotted-path lookup is served from a
//! `serde_json::Value` view of the same document.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HyperclassError, Result};

/// Dimensionality-reduction hyperparameters (`umap` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UmapParameters {
    /// Neighbors used for the fuzzy simplicial set
    pub n_neighbors: usize,

    /// Output dimensionality
    pub n_components: usize,

    /// SGD epochs over the edge set
    pub n_epochs: usize,

    pub min_dist: f32,
    pub spread: f32,
    pub learning_rate: f32,

    /// Negative samples drawn per positive edge update
    pub negative_sample_rate: usize,

    /// Strength of label weak supervision (0 disables it)
    pub target_weight: f32,

    pub random_state: u64,
}

impl Default for UmapParameters {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            n_components: 3,
            n_epochs: 200,
            min_dist: 0.1,
            spread: 1.0,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            target_weight: 0.5,
            random_state: 0,
        }
    }
}

/// Neighbor graph construction (`graph` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphParameters {
    pub n_neighbors: usize,

    /// Random restarts per neighbor list; derived from sample count if unset
    pub n_trees: Option<usize>,

    /// Local-join iterations; derived from sample count if unset
    pub n_iters: Option<usize>,

    pub max_candidates: usize,

    /// Sample count at or below which the exact builder is used
    pub brute_force_threshold: usize,

    pub seed: u64,
}

impl Default for GraphParameters {
    fn default() -> Self {
        Self {
            n_neighbors: 10,
            n_trees: None,
            n_iters: None,
            max_candidates: 60,
            brute_force_threshold: 2048,
            seed: 0,
        }
    }
}

impl GraphParameters {
    /// trees ≈ 5 + sqrt(n)/20
    pub fn trees_for(&self, n_samples: usize) -> usize {
        self.n_trees
            .unwrap_or_else(|| 5 + ((n_samples as f64).sqrt() / 20.0).round() as usize)
    }

    /// iterations ≈ max(5, log2(n))
    pub fn iterations_for(&self, n_samples: usize) -> usize {
        self.n_iters.unwrap_or_else(|| {
            let log2 = (n_samples.max(1) as f64).log2().round() as usize;
            log2.max(5)
        })
    }
}

/// Label spreading (`flow` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParameters {
    /// Fixed number of propagation rounds
    pub iterations: usize,
}

impl Default for FlowParameters {
    fn default() -> Self {
        Self { iterations: 5 }
    }
}

/// Embedding manager (`embedding` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingParameters {
    /// Output dimension of the classification feature model
    pub feature_dimensions: usize,

    /// Blocks whose mappers are retained in memory
    pub max_cached_blocks: usize,
}

impl Default for EmbeddingParameters {
    fn default() -> Self {
        Self {
            feature_dimensions: 8,
            max_cached_blocks: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathParameters {
    pub labels_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for PathParameters {
    fn default() -> Self {
        Self {
            labels_dir: PathBuf::from("labels"),
            cache_dir: PathBuf::from("cache"),
        }
    }
}

/// Complete configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub umap: UmapParameters,
    pub graph: GraphParameters,
    pub flow: FlowParameters,
    pub embedding: EmbeddingParameters,
    pub paths: PathParameters,

    /// Block activated at startup, as (block row, block column)
    pub block_index: [usize; 2],

    /// Block shape in pixels, as (rows, columns)
    pub block_size: [usize; 2],
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            umap: UmapParameters::default(),
            graph: GraphParameters::default(),
            flow: FlowParameters::default(),
            embedding: EmbeddingParameters::default(),
            paths: PathParameters::default(),
            block_index: [0, 0],
            block_size: [256, 256],
        }
    }
}

impl Configuration {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Configuration = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rejects settings no component can operate with
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 5] = [
            ("umap.n_neighbors", self.umap.n_neighbors > 0),
            ("umap.n_components", self.umap.n_components > 0),
            ("graph.n_neighbors", self.graph.n_neighbors > 0),
            ("embedding.feature_dimensions", self.embedding.feature_dimensions > 0),
            ("block_size", self.block_size[0] > 0 && self.block_size[1] > 0),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(HyperclassError::InvalidParameter {
                    name: name.to_owned(),
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.umap.target_weight) {
            return Err(HyperclassError::InvalidParameter {
                name: "umap.target_weight".to_owned(),
                reason: "must lie in [0, 1]".to_owned(),
            });
        }
        Ok(())
    }

    /// Looks up a dotted key path such as `umap.n_neighbors`
    pub fn value(&self, key_path: &str) -> Option<serde_json::Value> {
        let root = serde_json::to_value(self).ok()?;
        key_path
            .split('.')
            .try_fold(&root, |node, key| node.get(key))
            .cloned()
    }

    /// Whole section as a key-value map
    pub fn section(&self, name: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
        match self.value(name)? {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = Configuration::from_json_str(r#"{ "umap": { "n_neighbors": 8 }, "block_index": [1, 2] }"#)
            .unwrap();
        assert_eq!(config.umap.n_neighbors, 8);
        assert_eq!(config.umap.n_components, 3);
        assert_eq!(config.block_index, [1, 2]);
        assert_eq!(config.flow.iterations, 5);
    }

    #[test]
    fn test_dotted_lookup() {
        let config = Configuration::default();
        assert_eq!(config.value("umap.n_neighbors"), Some(serde_json::json!(15)));
        assert_eq!(config.value("umap.missing"), None);
        let section = config.section("graph").unwrap();
        assert!(section.contains_key("max_candidates"));
    }

    #[test]
    fn test_validation_rejects_zero_neighbors() {
        let result = Configuration::from_json_str(r#"{ "graph": { "n_neighbors": 0 } }"#);
        assert!(matches!(result, Err(HyperclassError::InvalidParameter { .. })));
    }

    #[test]
    fn test_graph_tuning_defaults() {
        let params = GraphParameters::default();
        assert_eq!(params.trees_for(10_000), 10);
        assert_eq!(params.iterations_for(16), 5);
        assert_eq!(params.iterations_for(65_536), 16);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("hyperclass.json");
        let mut config = Configuration::default();
        config.flow.iterations = 12;
        config.to_file(&path).unwrap();
        assert_eq!(Configuration::from_file(&path).unwrap(), config);
    }
}
