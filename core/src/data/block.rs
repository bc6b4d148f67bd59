//! Rectangular sub-regions of a raster tile
//!
//! A block owns a band × row × col array cut from its tile, together with
//! the affine transform that maps its pixel indices to map coordinates.
//! Blocks are immutable once constructed.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fmt;
use std::sync::{Arc, OnceLock};

use log::warn;
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::data::point_data::PointData;

/// Block position in its tile's block grid
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockId {
    pub row: usize,
    pub col: usize,
}

impl BlockId {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.row, self.col)
    }
}

/// Affine pixel-to-map transform without rotation terms.
///
/// Pixel (row, col) covers map x in `[x0 + col*dx, x0 + (col+1)*dx)` and map y
/// in `[y0 + row*dy, y0 + (row+1)*dy)`; `dy` is usually negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub x0: f64,
    pub dx: f64,
    pub y0: f64,
    pub dy: f64,
}

impl GeoTransform {
    pub fn new(x0: f64, dx: f64, y0: f64, dy: f64) -> Self {
        Self { x0, dx, y0, dy }
    }

    /// Pixel indices equal map coordinates
    pub fn identity() -> Self {
        Self::new(0.0, 1.0, 0.0, 1.0)
    }

    /// Same transform with its origin moved by a pixel offset
    pub fn offset(&self, rows: usize, cols: usize) -> Self {
        Self {
            x0: self.x0 + cols as f64 * self.dx,
            y0: self.y0 + rows as f64 * self.dy,
            ..*self
        }
    }

    /// Fractional pixel position of a map coordinate
    pub fn to_pixel(&self, cy: f64, cx: f64) -> (f64, f64) {
        ((cy - self.y0) / self.dy, (cx - self.x0) / self.dx)
    }

    /// Map coordinate of a pixel centre
    pub fn to_coord(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.y0 + (row as f64 + 0.5) * self.dy,
            self.x0 + (col as f64 + 0.5) * self.dx,
        )
    }
}

#[derive(Debug)]
pub struct Block {
    id: BlockId,
    tile_name: String,
    /// Pixel offset of this block's origin inside the tile
    offset: (usize, usize),
    data: Array3<f32>,
    transform: GeoTransform,
    point_data: OnceLock<Arc<PointData>>,
}

impl Block {
    pub fn new(
        id: BlockId,
        tile_name: impl Into<String>,
        offset: (usize, usize),
        data: Array3<f32>,
        transform: GeoTransform,
    ) -> Self {
        Self {
            id,
            tile_name: tile_name.into(),
            offset,
            data,
            transform,
            point_data: OnceLock::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn tile_name(&self) -> &str {
        &self.tile_name
    }

    pub fn offset(&self) -> (usize, usize) {
        self.offset
    }

    /// Band × row × col values
    pub fn data(&self) -> &Array3<f32> {
        &self.data
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

    /// Local pixel index for a map coordinate, `None` outside the block
    pub fn coord2index(&self, cy: f64, cx: f64) -> Option<(usize, usize)> {
        let (fy, fx) = self.transform.to_pixel(cy, cx);
        if !fy.is_finite() || !fx.is_finite() {
            return None;
        }
        let (row, col) = (fy.floor(), fx.floor());
        let (rows, cols) = self.shape();
        if row < 0.0 || col < 0.0 || row >= rows as f64 || col >= cols as f64 {
            return None;
        }
        Some((row as usize, col as usize))
    }

    pub fn index2coord(&self, row: usize, col: usize) -> (f64, f64) {
        self.transform.to_coord(row, col)
    }

    /// A pixel is valid when every band holds a finite value
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.data
            .slice(ndarray::s![.., row, col])
            .iter()
            .all(|value| value.is_finite())
    }

    pub fn valid_mask(&self) -> Array2<bool> {
        let (rows, cols) = self.shape();
        Array2::from_shape_fn((rows, cols), |(row, col)| self.is_valid(row, col))
    }

    /// Flattened valid pixels, computed once per block
    pub fn point_data(&self) -> Arc<PointData> {
        Arc::clone(self.point_data.get_or_init(|| Arc::new(PointData::from_block(self))))
    }

    /// Spectra at the given map coordinates. Coordinates outside the block or
    /// on no-data pixels are skipped; the returned indices say which inputs
    /// were kept.
    pub fn selected_point_data(&self, coords: &[(f64, f64)]) -> (Array2<f32>, Vec<usize>) {
        let mut kept = Vec::with_capacity(coords.len());
        let mut rows = Vec::with_capacity(coords.len() * self.n_bands());
        for (index, &(cy, cx)) in coords.iter().enumerate() {
            match self.coord2index(cy, cx) {
                Some((row, col)) if self.is_valid(row, col) => {
                    rows.extend(self.data.slice(ndarray::s![.., row, col]).iter().copied());
                    kept.push(index);
                }
                _ => warn!("Skipping out-of-bounds selection at ({cy}, {cx}) in block {}", self.id),
            }
        }
        let selected = Array2::from_shape_vec((kept.len(), self.n_bands()), rows)
            .unwrap_or_else(|_| Array2::zeros((0, self.n_bands())));
        (selected, kept)
    }
}
