//! Hyperclass core: interactive labeling of hyperspectral imagery
//!
//! A tile is cut into blocks. For the active block the core builds a
//! nearest-neighbor graph over its valid pixels, records the user's point
//! labels, spreads them over the graph, and fits cached low-dimensional
//! embeddings for display and classification. Everything runs against an
//! explicit [`LabelingSession`]; long operations go to a worker pool and
//! are collected from the interface thread.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod cache;
pub mod config;
pub mod data;
pub mod embedding;
pub mod error;
pub mod events;
pub mod execution;
pub mod graph;
pub mod labels;
pub mod learn;
pub mod session;

use env_logger::{Builder, Env};

pub use self::config::Configuration;
pub use self::data::{Block, BlockId, GeoTransform, PointData, Tile};
pub use self::embedding::{EmbeddingManager, EmbeddingView, FitContext, Mapper, ModelType};
pub use self::error::{HyperclassError, Result};
pub use self::events::{Event, EventBus, EventClient, EventMode};
pub use self::graph::{NeighborGraph, NeighborGraphBuilder};
pub use self::labels::{ClassLabelSet, LabelFile, LabelStore, PointLabel, Rgba};
pub use self::session::{LabelingSession, PollReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs the process logger, `info` unless `RUST_LOG` says otherwise.
/// Repeated calls are harmless.
pub fn init_logging() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}
