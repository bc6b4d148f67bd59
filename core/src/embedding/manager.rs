//! Per-block mapper cache and embedding services
//!
//! Mappers are cached per (block, model type). A fit for one key runs while
//! holding that key's slot, so concurrent requests share a single fit.
//! Fitted mappers are also written to a cache directory and reloaded on the
//! next request that does not ask for a refresh. Only the most recently used
//! blocks keep their mappers and graphs in memory.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{Array2, Array3, Axis};
use parking_lot::{Mutex, RwLock};

use crate::cache::KeyedCache;
use crate::config::{Configuration, EmbeddingParameters, GraphParameters, UmapParameters};
use crate::data::{Block, BlockId};
use crate::embedding::mapper::Mapper;
use crate::embedding::view::{EmbeddingView, ViewTarget};
use crate::embedding::ModelType;
use crate::error::Result;
use crate::graph::GraphCache;
use crate::labels::{ClassLabelSet, PointLabel, Rgba};

/// Inputs of a fit: the block and, optionally, one label per sample used as
/// weak supervision
#[derive(Debug, Clone, Copy)]
pub struct FitContext<'a> {
    pub block: &'a Block,
    pub labels: Option<&'a [i16]>,
}

impl<'a> FitContext<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self { block, labels: None }
    }

    pub fn with_labels(block: &'a Block, labels: &'a [i16]) -> Self {
        Self {
            block,
            labels: Some(labels),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MapperKey {
    block: BlockId,
    model: ModelType,
}

pub struct EmbeddingManager {
    umap: UmapParameters,
    settings: EmbeddingParameters,
    cache_dir: Option<PathBuf>,
    classes: Arc<ClassLabelSet>,
    /// Graphs with the UMAP neighbor count, separate from the spreading graphs
    graphs: GraphCache,
    mappers: KeyedCache<MapperKey, Mapper>,
    /// Blocks in least-recently-used order
    recent: Mutex<VecDeque<BlockId>>,
    view: RwLock<Option<Arc<dyn EmbeddingView>>>,
    axes: RwLock<Option<Vec<usize>>>,
}

impl std::fmt::Debug for EmbeddingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingManager")
            .field("umap", &self.umap)
            .field("cache_dir", &self.cache_dir)
            .field("mappers", &self.mappers.len())
            .field("recent", &*self.recent.lock())
            .finish()
    }
}

impl EmbeddingManager {
    pub fn new(config: &Configuration, classes: Arc<ClassLabelSet>) -> Self {
        let graph_params = GraphParameters {
            n_neighbors: config.umap.n_neighbors,
            ..config.graph.clone()
        };
        Self {
            umap: config.umap.clone(),
            settings: config.embedding.clone(),
            cache_dir: Some(config.paths.cache_dir.clone()),
            classes,
            graphs: GraphCache::new(graph_params),
            mappers: KeyedCache::new(),
            recent: Mutex::new(VecDeque::new()),
            view: RwLock::new(None),
            axes: RwLock::new(None),
        }
    }

    /// Disables or redirects the mapper cache files
    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    pub fn set_view(&self, view: Arc<dyn EmbeddingView>) {
        *self.view.write() = Some(view);
    }

    /// Axes used to display embeddings that are neither 2D nor 3D
    pub fn set_axes(&self, axes: Option<Vec<usize>>) {
        *self.axes.write() = axes;
    }

    fn view(&self) -> Option<Arc<dyn EmbeddingView>> {
        self.view.read().clone()
    }

    pub fn feature_model(&self) -> ModelType {
        ModelType::features(&self.settings)
    }

    /// Mapper cache file for a block and model type
    pub fn cache_path(&self, block: &Block, model: ModelType) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        Some(dir.join(format!(
            "{}.{}.{}.nn-{}.d-{}.json",
            block.tile_name(),
            block.id(),
            model.name(),
            self.umap.n_neighbors,
            model.dimensions(&self.umap)
        )))
    }

    /// Cached mapper for the block and model type, fitting one when absent
    /// or when `refresh` is set. A refit replaces the previous mapper.
    pub fn get_mapper(&self, ctx: FitContext<'_>, model: ModelType, refresh: bool) -> Result<Arc<Mapper>> {
        let block = ctx.block;
        let key = MapperKey {
            block: block.id(),
            model,
        };
        self.touch(block.id());
        self.mappers.get_or_try_insert_with(&key, refresh, || {
            let path = self.cache_path(block, model);
            if !refresh {
                if let Some(mapper) = path.as_deref().and_then(Mapper::load) {
                    if self.is_usable(&mapper, block, model) {
                        return Ok(mapper);
                    }
                    warn!("Cached mapper for block {} does not match its configuration, refitting", block.id());
                }
            }
            let mapper = self.fit(ctx, model)?;
            if let Some(path) = path {
                if let Err(e) = mapper.save(&path) {
                    warn!("Unable to write mapper cache {}: {e}", path.display());
                }
            }
            Ok(mapper)
        })
    }

    /// Mapper already in memory, without fitting
    pub fn cached_mapper(&self, block: BlockId, model: ModelType) -> Option<Arc<Mapper>> {
        self.mappers.get(&MapperKey { block, model })
    }

    fn is_usable(&self, mapper: &Mapper, block: &Block, model: ModelType) -> bool {
        mapper.is_fitted()
            && mapper.params() == &self.umap
            && mapper.n_components() == model.dimensions(&self.umap)
            && mapper.n_samples() == block.point_data().n_samples()
    }

    fn fit(&self, ctx: FitContext<'_>, model: ModelType) -> Result<Mapper> {
        let block = ctx.block;
        info!("Computing {} embedding for block {}", model.name(), block.id());
        let graph = self.graphs.get_or_build(block, false)?;
        let mut mapper = Mapper::new(self.umap.clone(), model.dimensions(&self.umap));
        mapper.fit(block.point_data().samples(), &graph, ctx.labels)?;
        Ok(mapper)
    }

    /// Fits (or refits with `refresh`) and, for the point-cloud model,
    /// shows the layout colored by `ctx.labels`
    pub fn embed(&self, ctx: FitContext<'_>, model: ModelType, refresh: bool) -> Result<Arc<Mapper>> {
        let mapper = self.get_mapper(ctx, model, refresh)?;
        if model == ModelType::PointCloud {
            if let (Some(view), Some(embedding)) = (self.view(), mapper.embedding()) {
                let colors = match ctx.labels {
                    Some(labels) => self.label_colors(labels),
                    None => vec![self.classes.color_for_label(0); embedding.nrows()],
                };
                let target = ViewTarget::route(embedding.ncols(), self.axes.read().as_deref())?;
                target.show(view.as_ref(), embedding, &colors);
            }
        }
        Ok(mapper)
    }

    /// Projects a block through an already fitted mapper
    pub fn transform(&self, block: &Block, mapper: &Mapper) -> Result<Array2<f32>> {
        mapper.transform(block.point_data().samples())
    }

    /// Embedding as a model-dim × row × col raster, NaN at no-data pixels
    pub fn transform_raster(&self, block: &Block, mapper: &Mapper) -> Result<Array3<f32>> {
        let points = block.point_data();
        let embedded = self.transform(block, mapper)?;
        let (rows, cols) = block.shape();
        let mut raster = Array3::from_elem((embedded.ncols(), rows, cols), f32::NAN);
        for (sample, values) in embedded.axis_iter(Axis(0)).enumerate() {
            if let Some((row, col)) = points.pixel(sample) {
                for (dim, value) in values.iter().enumerate() {
                    raster[[dim, row, col]] = *value;
                }
            }
        }
        Ok(raster)
    }

    fn label_colors(&self, labels: &[i16]) -> Vec<Rgba> {
        labels.iter().map(|&label| self.classes.color_for_label(label)).collect()
    }

    /// Class colors for per-sample labels, pushed to the view when one is set
    pub fn color_point_cloud(&self, labels: &[i16]) -> Vec<Rgba> {
        let colors = self.label_colors(labels);
        if let Some(view) = self.view() {
            view.set_point_colors(&colors);
        }
        colors
    }

    /// Highlights labeled points in embedding space; returns how many were
    /// plotted. Selections outside the block or on no-data are skipped.
    pub fn plot_markers(&self, block: &Block, selection: &[PointLabel], mapper: &Mapper) -> Result<usize> {
        let coords: Vec<(f64, f64)> = selection.iter().map(|p| (p.row, p.col)).collect();
        let (samples, kept) = block.selected_point_data(&coords);
        if kept.is_empty() {
            return Ok(0);
        }
        let points = mapper.transform(&samples)?;
        let colors: Vec<Rgba> = kept
            .iter()
            .map(|&i| self.classes.color_for_label(selection[i].class as i16))
            .collect();
        if let Some(view) = self.view() {
            let points = match ViewTarget::route(points.ncols(), self.axes.read().as_deref())? {
                ViewTarget::Projected { axes } => points.select(Axis(1), &axes),
                _ => points,
            };
            view.plot_markers(&points, &colors);
        }
        debug!("Plotted {} markers for block {}", kept.len(), block.id());
        Ok(kept.len())
    }

    /// Drops every mapper and graph held for a block
    pub fn invalidate_block(&self, block: BlockId) {
        self.mappers.retain(|key| key.block != block);
        self.graphs.invalidate(block);
        self.recent.lock().retain(|b| *b != block);
        debug!("Released embedding state of block {block}");
    }

    /// Blocks currently retained, least recently used first
    pub fn cached_blocks(&self) -> Vec<BlockId> {
        self.recent.lock().iter().copied().collect()
    }

    fn touch(&self, block: BlockId) {
        let evicted: Vec<BlockId> = {
            let mut recent = self.recent.lock();
            recent.retain(|b| *b != block);
            recent.push_back(block);
            let excess = recent.len().saturating_sub(self.settings.max_cached_blocks.max(1));
            recent.drain(..excess).collect()
        };
        for old in evicted {
            self.invalidate_block(old);
        }
    }
}
