//! Raster tile and its block grid
//!
//! Raster file I/O lives outside this crate; a tile is built from an array
//! already in memory. Blocks are cut on demand and cached by [`BlockId`].
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::sync::Arc;

use log::debug;
use ndarray::{s, Array3, Axis};

use crate::cache::KeyedCache;
use crate::config::Configuration;
use crate::data::block::{Block, BlockId, GeoTransform};
use crate::error::{HyperclassError, Result};

#[derive(Debug)]
pub struct Tile {
    name: String,
    data: Arc<Array3<f32>>,
    transform: GeoTransform,
    block_size: (usize, usize),
    blocks: KeyedCache<BlockId, Block>,
}

impl Tile {
    pub fn new(
        name: impl Into<String>,
        data: Array3<f32>,
        transform: GeoTransform,
        block_size: (usize, usize),
    ) -> Result<Self> {
        if block_size.0 == 0 || block_size.1 == 0 {
            return Err(HyperclassError::InvalidParameter {
                name: "block_size".to_owned(),
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(Self {
            name: name.into(),
            data: Arc::new(data),
            transform,
            block_size,
            blocks: KeyedCache::new(),
        })
    }

    /// Tile cut with the configured `block_size`
    pub fn with_config(
        name: impl Into<String>,
        data: Array3<f32>,
        transform: GeoTransform,
        config: &Configuration,
    ) -> Result<Self> {
        let [rows, cols] = config.block_size;
        Self::new(name, data, transform, (rows, cols))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block shape as (rows, cols)
    pub fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn n_bands(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// Spatial shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.data.len_of(Axis(1)), self.data.len_of(Axis(2)))
    }

    /// Number of block rows and columns; edge blocks may be partial
    pub fn block_grid(&self) -> (usize, usize) {
        let (rows, cols) = self.shape();
        (
            (rows + self.block_size.0 - 1) / self.block_size.0,
            (cols + self.block_size.1 - 1) / self.block_size.1,
        )
    }

    pub fn get_block(&self, block_row: usize, block_col: usize) -> Result<Arc<Block>> {
        let (grid_rows, grid_cols) = self.block_grid();
        if block_row >= grid_rows || block_col >= grid_cols {
            return Err(HyperclassError::InvalidParameter {
                name: "block_index".to_owned(),
                reason: format!(
                    "block ({block_row}, {block_col}) outside {grid_rows}x{grid_cols} grid of tile {}",
                    self.name
                ),
            });
        }
        let id = BlockId::new(block_row, block_col);
        self.blocks.get_or_try_insert_with(&id, false, || Ok(self.cut_block(id)))
    }

    fn cut_block(&self, id: BlockId) -> Block {
        let (rows, cols) = self.shape();
        let r0 = id.row * self.block_size.0;
        let c0 = id.col * self.block_size.1;
        let r1 = (r0 + self.block_size.0).min(rows);
        let c1 = (c0 + self.block_size.1).min(cols);
        debug!("Cutting block {id} of tile {}: rows {r0}..{r1}, cols {c0}..{c1}", self.name);
        let data = self.data.slice(s![.., r0..r1, c0..c1]).to_owned();
        Block::new(id, self.name.clone(), (r0, c0), data, self.transform.offset(r0, c0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile() -> Tile {
        let data = Array3::from_shape_fn((2, 5, 7), |(b, r, c)| (b * 1000 + r * 10 + c) as f32);
        Tile::new("ang2017", data, GeoTransform::new(0.0, 1.0, 0.0, 1.0), (3, 4)).unwrap()
    }

    #[test]
    fn test_block_grid_covers_partial_edges() {
        let tile = tile();
        assert_eq!(tile.block_grid(), (2, 2));
        let edge = tile.get_block(1, 1).unwrap();
        assert_eq!(edge.shape(), (2, 3));
        assert_eq!(edge.offset(), (3, 4));
        assert_eq!(edge.data()[[0, 0, 0]], 34.0);
    }

    #[test]
    fn test_blocks_are_cached() {
        let tile = tile();
        let a = tile.get_block(0, 1).unwrap();
        let b = tile.get_block(0, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_block_coordinates_are_tile_global() {
        let tile = tile();
        let block = tile.get_block(1, 0).unwrap();
        assert_eq!(block.coord2index(3.5, 0.5), Some((0, 0)));
        assert_eq!(block.coord2index(0.5, 0.5), None);
    }

    #[test]
    fn test_out_of_grid_block() {
        assert!(matches!(tile().get_block(2, 0), Err(HyperclassError::InvalidParameter { .. })));
    }

    #[test]
    fn test_tile_cut_from_configuration() {
        let mut config = Configuration::default();
        config.block_size = [2, 5];
        let tile = Tile::with_config("cfg", Array3::zeros((1, 5, 7)), GeoTransform::identity(), &config).unwrap();
        assert_eq!(tile.block_size(), (2, 5));
        assert_eq!(tile.block_grid(), (3, 2));
    }
}
