//! Flattened sample view of a block
//!
//! Sample `i` corresponds to exactly one valid pixel; the pixel map makes the
//! correspondence reversible so per-sample results can be written back into
//! raster shape.

use ndarray::{Array2, Axis};

use crate::data::block::Block;

#[derive(Debug, Clone)]
pub struct PointData {
    /// Sample × band values
    samples: Array2<f32>,
    /// (row, col) of every sample
    pixels: Vec<(usize, usize)>,
    /// Sample index of every pixel in row-major order
    sample_of_pixel: Vec<Option<usize>>,
    shape: (usize, usize),
}

impl PointData {
    pub(crate) fn from_block(block: &Block) -> Self {
        let (rows, cols) = block.shape();
        let n_bands = block.n_bands();
        let data = block.data();
        let mut values = Vec::new();
        let mut pixels = Vec::new();
        let mut sample_of_pixel = vec![None; rows * cols];
        for row in 0..rows {
            for col in 0..cols {
                if !block.is_valid(row, col) {
                    continue;
                }
                sample_of_pixel[row * cols + col] = Some(pixels.len());
                pixels.push((row, col));
                values.extend((0..n_bands).map(|band| data[[band, row, col]]));
            }
        }
        let samples = Array2::from_shape_vec((pixels.len(), n_bands), values)
            .unwrap_or_else(|_| Array2::zeros((0, n_bands)));
        Self {
            samples,
            pixels,
            sample_of_pixel,
            shape: (rows, cols),
        }
    }

    /// Builds point data directly from samples laid out on a single raster row
    pub fn from_samples(samples: Array2<f32>) -> Self {
        let n = samples.len_of(Axis(0));
        Self {
            samples,
            pixels: (0..n).map(|col| (0, col)).collect(),
            sample_of_pixel: (0..n).map(Some).collect(),
            shape: (1, n),
        }
    }

    pub fn samples(&self) -> &Array2<f32> {
        &self.samples
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len_of(Axis(0))
    }

    pub fn n_bands(&self) -> usize {
        self.samples.len_of(Axis(1))
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples() == 0
    }

    /// Raster shape the samples were drawn from
    pub fn raster_shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn pixel(&self, sample: usize) -> Option<(usize, usize)> {
        self.pixels.get(sample).copied()
    }

    pub fn sample_at(&self, row: usize, col: usize) -> Option<usize> {
        let (rows, cols) = self.shape;
        if row >= rows || col >= cols {
            return None;
        }
        self.sample_of_pixel[row * cols + col]
    }

    /// Picks the raster values at the sample pixels
    pub fn raster_to_points<T: Copy>(&self, raster: &Array2<T>) -> Vec<T> {
        self.pixels.iter().map(|&(row, col)| raster[[row, col]]).collect()
    }

    /// Scatters per-sample values back into raster shape
    pub fn points_to_raster<T: Copy>(&self, values: &[T], fill: T) -> Array2<T> {
        let mut raster = Array2::from_elem(self.shape, fill);
        for (&(row, col), &value) in self.pixels.iter().zip(values) {
            raster[[row, col]] = value;
        }
        raster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::block::{BlockId, GeoTransform};
    use ndarray::Array3;

    fn block_with_hole() -> Block {
        let mut data = Array3::from_shape_fn((3, 2, 3), |(b, r, c)| (b + r * 3 + c) as f32);
        data[[0, 0, 1]] = f32::NAN;
        Block::new(BlockId::new(0, 0), "tile", (0, 0), data, GeoTransform::identity())
    }

    #[test]
    fn test_invalid_pixels_are_dropped() {
        let points = block_with_hole().point_data();
        assert_eq!(points.n_samples(), 5);
        assert_eq!(points.n_bands(), 3);
        assert_eq!(points.sample_at(0, 1), None);
        assert_eq!(points.sample_at(0, 2), Some(1));
        assert_eq!(points.pixel(1), Some((0, 2)));
        assert_eq!(points.samples().row(1).to_vec(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_raster_point_correspondence() {
        let points = block_with_hole().point_data();
        let raster = Array2::from_shape_fn((2, 3), |(r, c)| (r * 3 + c) as i16);
        let values = points.raster_to_points(&raster);
        assert_eq!(values, vec![0, 2, 3, 4, 5]);
        let restored = points.points_to_raster(&values, -9);
        assert_eq!(restored[[0, 1]], -9);
        assert_eq!(restored[[1, 2]], 5);
    }

    #[test]
    fn test_from_samples_layout() {
        let points = PointData::from_samples(Array2::zeros((4, 2)));
        assert_eq!(points.raster_shape(), (1, 4));
        assert_eq!(points.sample_at(0, 3), Some(3));
    }
}
