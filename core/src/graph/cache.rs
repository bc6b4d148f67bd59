//! Per-block neighbor graph cache

use std::sync::Arc;

use log::debug;

use crate::cache::KeyedCache;
use crate::config::GraphParameters;
use crate::data::{Block, BlockId};
use crate::error::Result;
use crate::graph::neighbors::{NeighborGraph, NeighborGraphBuilder};

/// Graphs keyed by block identity; concurrent requests for the same block
/// share a single build.
#[derive(Debug)]
pub struct GraphCache {
    builder: NeighborGraphBuilder,
    graphs: KeyedCache<BlockId, NeighborGraph>,
}

impl GraphCache {
    pub fn new(params: GraphParameters) -> Self {
        Self {
            builder: NeighborGraphBuilder::new(params),
            graphs: KeyedCache::new(),
        }
    }

    pub fn builder(&self) -> &NeighborGraphBuilder {
        &self.builder
    }

    pub fn get_or_build(&self, block: &Block, refresh: bool) -> Result<Arc<NeighborGraph>> {
        self.graphs.get_or_try_insert_with(&block.id(), refresh, || {
            debug!("Building neighbor graph for block {}", block.id());
            self.builder.build(&block.point_data())
        })
    }

    pub fn get(&self, block: BlockId) -> Option<Arc<NeighborGraph>> {
        self.graphs.get(&block)
    }

    /// Drops the graph of a block whose data changed
    pub fn invalidate(&self, block: BlockId) {
        if self.graphs.invalidate(&block).is_some() {
            debug!("Invalidated neighbor graph for block {block}");
        }
    }
}
