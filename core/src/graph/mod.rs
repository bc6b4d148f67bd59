//! Nearest-neighbor graph construction and caching
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod cache;
pub mod neighbors;

pub use self::cache::GraphCache;
pub use self::neighbors::{Adjacency, NeighborGraph, NeighborGraphBuilder};
