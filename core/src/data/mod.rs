//! Raster data model: tiles, blocks and flattened point samples
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod block;
pub mod point_data;
pub mod tile;

pub use self::block::{Block, BlockId, GeoTransform};
pub use self::point_data::PointData;
pub use self::tile::Tile;
