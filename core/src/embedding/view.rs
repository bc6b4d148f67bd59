//! Visualization seam for embeddings
//!
//! Rendering lives outside this crate. Whatever front end implements
//! [`EmbeddingView`] receives embeddings already routed by dimension:
//! 2D layouts go to a scatter/density plot, 3D layouts to a point cloud,
//! and any other dimensionality is shown through two or three caller-chosen
//! axes.

use ndarray::{Array2, Axis};

use crate::error::{HyperclassError, Result};
use crate::labels::Rgba;

pub trait EmbeddingView: Send + Sync {
    fn show_scatter_2d(&self, points: &Array2<f32>, colors: &[Rgba]);

    fn show_point_cloud(&self, points: &Array2<f32>, colors: &[Rgba]);

    /// Recolors the points currently shown
    fn set_point_colors(&self, colors: &[Rgba]);

    /// Overlays highlighted markers for labeled samples
    fn plot_markers(&self, points: &Array2<f32>, colors: &[Rgba]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewTarget {
    Scatter2d,
    PointCloud3d,
    /// Higher or lower dimensional embedding shown through selected axes
    Projected { axes: Vec<usize> },
}

impl ViewTarget {
    /// Chooses the view for an embedding of dimension `dim`. Dimensions
    /// other than 2 and 3 need `axes`: two or three distinct column indices
    /// below `dim`.
    pub fn route(dim: usize, axes: Option<&[usize]>) -> Result<Self> {
        match (dim, axes) {
            (2, None) => Ok(ViewTarget::Scatter2d),
            (3, None) => Ok(ViewTarget::PointCloud3d),
            (_, Some(axes)) => {
                let distinct = axes.iter().enumerate().all(|(i, a)| !axes[..i].contains(a));
                if (axes.len() == 2 || axes.len() == 3) && distinct && axes.iter().all(|&a| a < dim) {
                    Ok(ViewTarget::Projected { axes: axes.to_vec() })
                } else {
                    Err(HyperclassError::InvalidParameter {
                        name: "axes".to_owned(),
                        reason: format!("need 2 or 3 distinct axes below {dim}, got {axes:?}"),
                    })
                }
            }
            (dim, None) => Err(HyperclassError::InvalidParameter {
                name: "axes".to_owned(),
                reason: format!("a {dim}-dimensional embedding needs 2 or 3 axes selected for display"),
            }),
        }
    }

    /// Sends `points` to the view this target names
    pub fn show(&self, view: &dyn EmbeddingView, points: &Array2<f32>, colors: &[Rgba]) {
        match self {
            ViewTarget::Scatter2d => view.show_scatter_2d(points, colors),
            ViewTarget::PointCloud3d => view.show_point_cloud(points, colors),
            ViewTarget::Projected { axes } => {
                let selected = points.select(Axis(1), axes);
                if axes.len() == 2 {
                    view.show_scatter_2d(&selected, colors);
                } else {
                    view.show_point_cloud(&selected, colors);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_routing() {
        assert_eq!(ViewTarget::route(2, None).unwrap(), ViewTarget::Scatter2d);
        assert_eq!(ViewTarget::route(3, None).unwrap(), ViewTarget::PointCloud3d);
        assert!(ViewTarget::route(8, None).is_err());
        assert_eq!(
            ViewTarget::route(8, Some(&[0, 5, 7])).unwrap(),
            ViewTarget::Projected { axes: vec![0, 5, 7] }
        );
        assert!(ViewTarget::route(8, Some(&[0, 8])).is_err());
        assert!(ViewTarget::route(8, Some(&[1, 1])).is_err());
        assert!(ViewTarget::route(8, Some(&[0])).is_err());
    }
}
