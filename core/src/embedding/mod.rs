//! Dimensionality reduction of block samples and embedding display routing
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingParameters, UmapParameters};

pub mod manager;
pub mod mapper;
pub mod view;

pub use self::manager::{EmbeddingManager, FitContext};
pub use self::mapper::Mapper;
pub use self::view::{EmbeddingView, ViewTarget};

/// Named mapper configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Layout shown in the point-cloud view, `umap.n_components` wide
    PointCloud,
    /// Classification features of the given width
    Features(usize),
}

impl ModelType {
    pub fn features(settings: &EmbeddingParameters) -> Self {
        ModelType::Features(settings.feature_dimensions)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelType::PointCloud => "pointcloud",
            ModelType::Features(_) => "features",
        }
    }

    pub fn dimensions(&self, umap: &UmapParameters) -> usize {
        match self {
            ModelType::PointCloud => umap.n_components,
            ModelType::Features(dimensions) => *dimensions,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
