//! Interactive labeling session
//!
//! The session is the explicit context every operation runs against: the
//! configuration, class set, tile, event bus, worker pool, graph and mapper
//! caches, and one label store per visited block. Long operations (graph
//! builds, spreads, refits) go to the worker pool; their handles are kept
//! until [`LabelingSession::poll`] collects them on the interface thread,
//! where results for a block that is no longer active are dropped.
//!
//! Each block has a single writer. While a spread runs on a block, edits to
//! it and further spreads are refused rather than queued.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, error, info, warn};
use ndarray::{Array2, Axis};
use parking_lot::{Mutex, RwLock};

use crate::config::Configuration;
use crate::data::{Block, BlockId, Tile};
use crate::embedding::{EmbeddingManager, FitContext, Mapper, ModelType};
use crate::error::{HyperclassError, Result};
use crate::events::{
    DataEvent, Event, EventBus, EventClient, GuiEvent, LabelEvent, ModelEvent, PickSource,
};
use crate::execution::{TaskHandle, TaskRunner};
use crate::graph::GraphCache;
use crate::labels::{ClassLabelSet, LabelFile, LabelStore, PointLabel, SpreadOutcome, NO_DATA};
use crate::learn::{LearningModel, LinearSvc, SvcParameters};

/// Label store of one block and its spread-in-progress flag
#[derive(Debug)]
struct BlockSlot {
    store: Mutex<LabelStore>,
    spreading: AtomicBool,
}

impl BlockSlot {
    fn new(store: LabelStore) -> Self {
        Self {
            store: Mutex::new(store),
            spreading: AtomicBool::new(false),
        }
    }

    fn is_spreading(&self) -> bool {
        self.spreading.load(Ordering::Acquire)
    }
}

/// Clears the spreading flag when the spread task ends, panics included
struct SpreadClaim(Arc<BlockSlot>);

impl Drop for SpreadClaim {
    fn drop(&mut self) {
        self.0.spreading.store(false, Ordering::Release);
    }
}

/// Background work awaiting collection
enum Pending {
    Graph(TaskHandle<Result<()>>),
    Spread(TaskHandle<Result<SpreadOutcome>>),
    Refit(TaskHandle<Result<Arc<Mapper>>>),
}

impl Pending {
    fn is_finished(&self) -> bool {
        match self {
            Pending::Graph(handle) => handle.is_finished(),
            Pending::Spread(handle) => handle.is_finished(),
            Pending::Refit(handle) => handle.is_finished(),
        }
    }

    fn block(&self) -> Option<BlockId> {
        match self {
            Pending::Graph(handle) => handle.block(),
            Pending::Spread(handle) => handle.block(),
            Pending::Refit(handle) => handle.block(),
        }
    }

    fn label(&self) -> &str {
        match self {
            Pending::Graph(handle) => handle.label(),
            Pending::Spread(handle) => handle.label(),
            Pending::Refit(handle) => handle.label(),
        }
    }
}

/// What one [`LabelingSession::poll`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Results applied to the active block
    pub applied: usize,
    /// Results dropped because their block is no longer active
    pub stale: usize,
    /// Tasks that ended in an error, reported as status events
    pub failed: usize,
}

impl PollReport {
    fn merge(&mut self, other: PollReport) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.failed += other.failed;
    }
}

pub struct LabelingSession {
    config: Configuration,
    classes: Arc<ClassLabelSet>,
    tile: Arc<Tile>,
    bus: Arc<EventBus>,
    runner: Arc<TaskRunner>,
    /// Graphs used for spreading (`graph` section)
    graphs: Arc<GraphCache>,
    embedding: Arc<EmbeddingManager>,
    slots: DashMap<BlockId, Arc<BlockSlot>>,
    active: RwLock<Option<BlockId>>,
    selected_class: AtomicU16,
    pending: Mutex<Vec<Pending>>,
}

impl std::fmt::Debug for LabelingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelingSession")
            .field("tile", &self.tile.name())
            .field("active", &*self.active.read())
            .field("blocks", &self.slots.len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Bus registration that does not keep the session alive
struct SessionClient(Weak<LabelingSession>);

impl EventClient for SessionClient {
    fn process_event(&self, event: &Event, data: &DataEvent) -> Result<()> {
        match self.0.upgrade() {
            Some(session) => session.process_event(event, data),
            None => Ok(()),
        }
    }

    fn is_interesting(&self, event: &Event) -> bool {
        self.0.upgrade().is_some_and(|session| session.is_interesting(event))
    }

    fn client_name(&self) -> &str {
        "labeling-session"
    }
}

fn busy() -> HyperclassError {
    HyperclassError::WorkflowViolation("Label spreading in progress, wait for it to finish".to_owned())
}

fn collect<T>(handle: TaskHandle<Result<T>>) -> Result<T> {
    handle.wait()?
}

/// Writes the current selection of a block. A block that was never labeled
/// and has no file yet is left alone.
fn write_labels(slot: &BlockSlot, classes: &ClassLabelSet, path: &Path) -> Result<()> {
    let selection = slot.store.lock().selection().to_vec();
    if selection.is_empty() && !path.exists() {
        return Ok(());
    }
    LabelFile::new(classes, &selection).write(path)
}

impl LabelingSession {
    /// Builds the session context with a worker pool sized to the machine
    /// and registers the session on its own bus. The tile must be cut with
    /// the configured `block_size` and contain the configured `block_index`.
    pub fn new(config: Configuration, classes: ClassLabelSet, tile: Tile) -> Result<Arc<Self>> {
        config.validate()?;
        let [size_rows, size_cols] = config.block_size;
        if tile.block_size() != (size_rows, size_cols) {
            return Err(HyperclassError::InvalidParameter {
                name: "block_size".to_owned(),
                reason: format!(
                    "tile {} is cut into {:?} blocks, configuration asks for {:?}",
                    tile.name(),
                    tile.block_size(),
                    config.block_size
                ),
            });
        }
        let [index_row, index_col] = config.block_index;
        let (grid_rows, grid_cols) = tile.block_grid();
        if index_row >= grid_rows || index_col >= grid_cols {
            return Err(HyperclassError::InvalidParameter {
                name: "block_index".to_owned(),
                reason: format!(
                    "{:?} is outside the {grid_rows}x{grid_cols} block grid of tile {}",
                    config.block_index,
                    tile.name()
                ),
            });
        }
        let runner = Arc::new(TaskRunner::new(0)?);
        let classes = Arc::new(classes);
        let embedding = EmbeddingManager::new(&config, Arc::clone(&classes));
        let session = Arc::new(Self {
            graphs: Arc::new(GraphCache::new(config.graph.clone())),
            embedding: Arc::new(embedding),
            bus: Arc::new(EventBus::new(Arc::clone(&runner))),
            runner,
            classes,
            tile: Arc::new(tile),
            slots: DashMap::new(),
            active: RwLock::new(None),
            selected_class: AtomicU16::new(0),
            pending: Mutex::new(Vec::new()),
            config,
        });
        session
            .bus
            .add_client(Arc::new(SessionClient(Arc::downgrade(&session))));
        info!(
            "Started labeling session on tile {} ({} classes, {}x{} blocks)",
            session.tile.name(),
            session.classes.len(),
            session.tile.block_grid().0,
            session.tile.block_grid().1
        );
        Ok(session)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn classes(&self) -> &Arc<ClassLabelSet> {
        &self.classes
    }

    pub fn tile(&self) -> &Arc<Tile> {
        &self.tile
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn embedding(&self) -> &Arc<EmbeddingManager> {
        &self.embedding
    }

    pub fn active_block(&self) -> Option<BlockId> {
        *self.active.read()
    }

    pub fn selected_class(&self) -> u16 {
        self.selected_class.load(Ordering::Relaxed)
    }

    /// Tasks submitted and not yet collected by `poll`
    pub fn pending_tasks(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs `read` against a block's store, waiting for a running spread
    pub fn with_store<R>(&self, block: BlockId, read: impl FnOnce(&LabelStore) -> R) -> Option<R> {
        let slot = self.slots.get(&block).map(|slot| Arc::clone(slot.value()))?;
        let store = slot.store.lock();
        Some(read(&store))
    }

    /// Location of a block's label file
    pub fn label_path(&self, block: BlockId) -> PathBuf {
        LabelFile::path_for(
            &self.config.paths.labels_dir,
            &format!("{}.{block}", self.tile.name()),
        )
    }

    /// Makes a block the target of all further interaction. Its labels are
    /// loaded before this returns, the previous block's selection is written
    /// out in the background, and its neighbor graph is built in the
    /// background unless already cached.
    pub fn activate_block(&self, block_row: usize, block_col: usize) -> Result<BlockId> {
        let block = self.tile.get_block(block_row, block_col)?;
        let id = block.id();
        let slot = self.slot_for(&block);
        let previous = self.active.write().replace(id);
        if let Some(previous) = previous.filter(|previous| *previous != id) {
            self.flush_in_background(previous);
        }

        if self.graphs.get(id).is_none() {
            let graphs = Arc::clone(&self.graphs);
            let task_block = Arc::clone(&block);
            let handle = self.runner.start_for_block(id, "graph", move || {
                graphs.get_or_build(&task_block, false).map(|_| ())
            });
            self.pending.lock().push(Pending::Graph(handle));
        }

        let points = slot.store.try_lock().map_or(0, |store| store.selection().len());
        info!("Activated block {id} of tile {} with {points} point labels", self.tile.name());
        self.bus.publish(Event::Labels(LabelEvent::Updated { block: id, points }));
        Ok(id)
    }

    /// Activates the block named by the `block_index` setting
    pub fn activate_default_block(&self) -> Result<BlockId> {
        let [row, col] = self.config.block_index;
        self.activate_block(row, col)
    }

    fn slot_for(&self, block: &Arc<Block>) -> Arc<BlockSlot> {
        let slot = self
            .slots
            .entry(block.id())
            .or_insert_with(|| Arc::new(BlockSlot::new(self.load_store(block))));
        Arc::clone(slot.value())
    }

    fn load_store(&self, block: &Arc<Block>) -> LabelStore {
        let path = self.label_path(block.id());
        match LabelFile::read(&path) {
            Some(file) => {
                if file.class_names != self.classes.names() {
                    warn!(
                        "Label file {} was written with classes {:?}, session uses {:?}",
                        path.display(),
                        file.class_names,
                        self.classes.names()
                    );
                }
                LabelStore::with_selection(Arc::clone(block), file.selection)
            }
            None => LabelStore::new(Arc::clone(block)),
        }
    }

    fn active_slot(&self) -> Result<(BlockId, Arc<BlockSlot>)> {
        let id = self
            .active_block()
            .ok_or_else(|| HyperclassError::WorkflowViolation("Activate a block first".to_owned()))?;
        let slot = self
            .slots
            .get(&id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| HyperclassError::WorkflowViolation(format!("Block {id} has no label store")))?;
        Ok((id, slot))
    }

    /// Applies an edit to the active block and announces the new selection
    fn edit<R>(&self, apply: impl FnOnce(&mut LabelStore) -> Result<R>) -> Result<R> {
        let (id, slot) = self.active_slot()?;
        if slot.is_spreading() {
            return Err(busy());
        }
        let (result, points) = {
            let mut store = slot.store.lock();
            let result = apply(&mut store)?;
            (result, store.selection().len())
        };
        self.bus.publish(Event::Labels(LabelEvent::Updated { block: id, points }));
        Ok(result)
    }

    /// Labels the pixel at map coordinate (`cy`, `cx`) of the active block
    pub fn add_label(&self, cy: f64, cx: f64, class: u16) -> Result<()> {
        let block = self.edit(|store| {
            if store.block().coord2index(cy, cx).is_none() {
                return Err(HyperclassError::OutOfBounds { row: cy, col: cx });
            }
            store.add_label(cy, cx, class)?;
            Ok(Arc::clone(store.block()))
        })?;
        debug!("Added label {class} at ({cy}, {cx}) in block {}", block.id());
        self.refresh_markers(&block);
        Ok(())
    }

    /// Highlights the selection in the point cloud when a layout exists.
    /// The projection through the mapper runs on the worker pool.
    fn refresh_markers(&self, block: &Arc<Block>) {
        let Some(mapper) = self.embedding.cached_mapper(block.id(), ModelType::PointCloud) else {
            return;
        };
        let Some(slot) = self.slots.get(&block.id()).map(|slot| Arc::clone(slot.value())) else {
            return;
        };
        let selection: Vec<PointLabel> = slot.store.lock().selection().to_vec();
        let embedding = Arc::clone(&self.embedding);
        let block = Arc::clone(block);
        self.runner.spawn("markers", move || {
            if let Err(e) = embedding.plot_markers(&block, &selection, &mapper) {
                warn!("Unable to plot label markers for block {}: {e}", block.id());
            }
        });
    }

    /// Removes the most recent point label of the active block
    pub fn undo(&self) -> Result<Option<PointLabel>> {
        let removed = self.edit(|store| Ok(store.undo()))?;
        if removed.is_none() {
            debug!("Nothing to undo");
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.edit(|store| {
            store.clear();
            Ok(())
        })
    }

    /// Class assigned by subsequent image picks
    pub fn select_class(&self, class: u16) -> Result<()> {
        if !self.classes.is_user_class(usize::from(class)) {
            return Err(HyperclassError::InvalidParameter {
                name: "class".to_owned(),
                reason: format!("{class} is not one of the {} user classes", self.classes.len() - 1),
            });
        }
        self.selected_class.store(class, Ordering::Relaxed);
        debug!("Selected class {class} ({})", self.classes.name(usize::from(class)).unwrap_or("?"));
        Ok(())
    }

    /// Drops the spread prediction of the active block, keeping the point
    /// labels, and recolors the point cloud with them
    pub fn reset(&self) -> Result<()> {
        let labels = self.edit(|store| {
            store.discard_prediction();
            Ok(store.labeled_point_data())
        })?;
        self.embedding.color_point_cloud(&labels);
        Ok(())
    }

    /// Starts spreading the active block's labels in the background. Fails
    /// right away, without touching the labels, when the block has no
    /// labeled point or a spread is already running on it.
    pub fn submit(&self) -> Result<()> {
        let (id, slot) = self.active_slot()?;
        if slot
            .spreading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(busy());
        }
        let claim = SpreadClaim(Arc::clone(&slot));
        if !slot.store.lock().has_labels() {
            return Err(HyperclassError::WorkflowViolation(
                "Label at least one point before spreading".to_owned(),
            ));
        }

        let graphs = Arc::clone(&self.graphs);
        let iterations = self.config.flow.iterations;
        let handle = self.runner.start_for_block(id, "spread", move || {
            let claim = claim;
            let mut store = claim.0.store.lock();
            let graph = graphs.get_or_build(store.block(), false)?;
            store.spread(&graph, iterations)
        });
        info!("Spreading labels of block {id} over {iterations} rounds");
        self.pending.lock().push(Pending::Spread(handle));
        Ok(())
    }

    /// Refits the point-cloud layout of the active block in the background,
    /// using the spread labels when present as weak supervision
    pub fn remodel(&self) -> Result<()> {
        let (id, slot) = self.active_slot()?;
        let labels = slot.store.try_lock().map(|store| store.extended_label_points()).ok_or_else(busy)?;
        let block = self.tile.get_block(id.row, id.col)?;
        let embedding = Arc::clone(&self.embedding);
        let handle = self.runner.start_for_block(id, "remodel", move || {
            embedding.get_mapper(FitContext::with_labels(&block, &labels), ModelType::PointCloud, true)
        });
        info!("Refitting point cloud layout of block {id}");
        self.pending.lock().push(Pending::Refit(handle));
        Ok(())
    }

    /// Collects finished background work. Results for the active block are
    /// applied and announced; results for any other block stay in the
    /// caches and stores but are not shown. Task errors become status events.
    pub fn poll(&self) -> PollReport {
        let finished: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let (finished, running): (Vec<_>, Vec<_>) = pending.drain(..).partition(Pending::is_finished);
            *pending = running;
            finished
        };
        let active = self.active_block();
        let mut report = PollReport::default();
        for task in finished {
            let block = task.block();
            if block.is_none() || block != active {
                let label = task.label().to_owned();
                match self.finish(task, false) {
                    Err(HyperclassError::StaleResult(block)) => {
                        debug!("Discarded stale {label} result for block {block}")
                    }
                    Err(e) => debug!("Stale {label} task had failed: {e}"),
                    Ok(()) => {}
                }
                report.stale += 1;
                continue;
            }
            match self.finish(task, true) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    if e.is_recoverable() {
                        warn!("{e}");
                    } else {
                        error!("{e}");
                    }
                    self.bus.publish(Event::status(e.status_message()));
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Polls until no task is pending or `timeout` has passed
    pub fn settle(&self, timeout: Duration) -> PollReport {
        let started = Instant::now();
        let mut report = PollReport::default();
        loop {
            report.merge(self.poll());
            if self.pending_tasks() == 0 || started.elapsed() >= timeout {
                return report;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Collects one task. Without `apply`, a successful spread or refit
    /// comes back as `StaleResult`.
    fn finish(&self, task: Pending, apply: bool) -> Result<()> {
        match task {
            Pending::Graph(handle) => {
                let block = handle.block();
                collect(handle)?;
                debug!("Neighbor graph ready for block {block:?}");
            }
            Pending::Spread(handle) => {
                let Some(id) = handle.block() else {
                    return Ok(());
                };
                let outcome = collect(handle)?;
                if !apply {
                    return Err(HyperclassError::StaleResult(id));
                }
                self.apply_spread(id, &outcome);
            }
            Pending::Refit(handle) => {
                let Some(id) = handle.block() else {
                    return Ok(());
                };
                collect(handle)?;
                if !apply {
                    return Err(HyperclassError::StaleResult(id));
                }
                self.apply_refit(id)?;
            }
        }
        Ok(())
    }

    fn apply_spread(&self, id: BlockId, outcome: &SpreadOutcome) {
        info!(
            "Spread reached {} of {} samples in block {id} after {} rounds",
            outcome.coverage(),
            outcome.labels.len(),
            outcome.rounds
        );
        if let Some(labels) = self.with_store(id, LabelStore::extended_label_points) {
            self.embedding.color_point_cloud(&labels);
        }
        self.bus.publish(Event::Labels(LabelEvent::Spread {
            block: id,
            coverage: outcome.coverage(),
            rounds: outcome.rounds,
        }));
    }

    fn apply_refit(&self, id: BlockId) -> Result<()> {
        let block = self.tile.get_block(id.row, id.col)?;
        let labels = self.with_store(id, LabelStore::extended_label_points);
        let ctx = match &labels {
            Some(labels) => FitContext::with_labels(&block, labels),
            None => FitContext::new(&block),
        };
        self.embedding.embed(ctx, ModelType::PointCloud, false)?;
        self.refresh_markers(&block);
        self.bus.publish(Event::Model(ModelEvent::Refit {
            block: id,
            model: ModelType::PointCloud,
        }));
        Ok(())
    }

    /// Predicts a class for every valid pixel of the active block with a
    /// linear classifier trained on the labeled pixels in feature space.
    /// Runs on the calling thread.
    pub fn classify(&self) -> Result<Array2<i16>> {
        let (id, slot) = self.active_slot()?;
        let labels = slot.store.try_lock().map(|store| store.labeled_point_data()).ok_or_else(busy)?;
        let (rows, targets): (Vec<usize>, Vec<u16>) = labels
            .iter()
            .enumerate()
            .filter_map(|(sample, &label)| {
                u16::try_from(label).ok().filter(|&class| class > 0).map(|class| (sample, class))
            })
            .unzip();
        if rows.is_empty() {
            return Err(HyperclassError::WorkflowViolation(
                "Label at least one point before classifying".to_owned(),
            ));
        }

        let block = self.tile.get_block(id.row, id.col)?;
        let model = self.embedding.feature_model();
        let mapper = self.embedding.get_mapper(FitContext::new(&block), model, false)?;
        let features = self.embedding.transform(&block, &mapper)?;

        let mut classifier = LinearSvc::new(SvcParameters::default());
        classifier.fit(&features.select(Axis(0), &rows), &targets)?;
        let predicted: Vec<i16> = classifier
            .predict(&features)?
            .into_iter()
            .map(|class| i16::try_from(class).unwrap_or(NO_DATA))
            .collect();
        info!("Classified {} samples of block {id} from {} labels", predicted.len(), rows.len());
        Ok(block.point_data().points_to_raster(&predicted, NO_DATA))
    }

    fn flush_in_background(&self, block: BlockId) {
        let Some(slot) = self.slots.get(&block).map(|slot| Arc::clone(slot.value())) else {
            return;
        };
        let classes = Arc::clone(&self.classes);
        let path = self.label_path(block);
        self.runner.spawn("flush-labels", move || {
            if let Err(e) = write_labels(&slot, &classes, &path) {
                error!("Unable to save labels of block {block}: {e}");
            }
        });
    }

    /// Writes the selection of every visited block. All blocks are
    /// attempted; the first failure is returned.
    pub fn exit(&self) -> Result<()> {
        let slots: Vec<(BlockId, Arc<BlockSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut first_error = None;
        for (block, slot) in slots {
            if let Err(e) = write_labels(&slot, &self.classes, &self.label_path(block)) {
                error!("Unable to save labels of block {block}: {e}");
                first_error.get_or_insert(e);
            }
        }
        info!("Closed labeling session on tile {}", self.tile.name());
        first_error.map_or(Ok(()), Err)
    }
}

impl EventClient for LabelingSession {
    fn process_event(&self, event: &Event, data: &DataEvent) -> Result<()> {
        match event {
            Event::Pick(pick) if pick.source == PickSource::Image => {
                let Some((cy, cx)) = data.location else {
                    return Err(HyperclassError::OutOfBounds {
                        row: pick.row,
                        col: pick.col,
                    });
                };
                self.add_label(cy, cx, self.selected_class())
            }
            Event::Gui(gui) => match gui {
                GuiEvent::Submit => self.submit(),
                GuiEvent::Undo => self.undo().map(|_| ()),
                GuiEvent::Clear => self.clear(),
                GuiEvent::Remodel => self.remodel(),
                GuiEvent::Reset => self.reset(),
                GuiEvent::SelectClass { class } => self.select_class(*class),
                GuiEvent::ActivateBlock { row, col } => self.activate_block(*row, *col).map(|_| ()),
                GuiEvent::KeyPress { .. } | GuiEvent::KeyRelease { .. } | GuiEvent::Slider { .. } => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn is_interesting(&self, event: &Event) -> bool {
        matches!(event, Event::Pick(_) | Event::Gui(_)) && !event.is_key_event()
    }

    fn client_name(&self) -> &str {
        "labeling-session"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::GeoTransform;
    use crate::embedding::EmbeddingView;
    use crate::events::{EventMode, PickEvent};
    use crate::labels::{LabelState, Rgba};
    use ndarray::Array3;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(30);

    /// 4 x 8 tile cut into two 4 x 4 blocks. The left half of every block
    /// is one material, the right half another; pixel (3, 3) is no-data.
    fn tile() -> Tile {
        let mut data = Array3::from_shape_fn((3, 4, 8), |(b, r, c)| {
            let base = if c % 4 < 2 { 1.0 } else { 10.0 };
            base + b as f32 + (r * 4 + c) as f32 * 0.01
        });
        for band in 0..3 {
            data[[band, 3, 3]] = f32::NAN;
        }
        Tile::new("test", data, GeoTransform::identity(), (4, 4)).unwrap()
    }

    fn classes() -> ClassLabelSet {
        ClassLabelSet::new([
            ("Unlabeled", Rgba::rgb(1.0, 1.0, 1.0)),
            ("Soil", Rgba::rgb(0.6, 0.4, 0.2)),
            ("Water", Rgba::rgb(0.0, 0.0, 1.0)),
        ])
        .unwrap()
    }

    fn config(dir: &TempDir) -> Configuration {
        let mut config = Configuration::default();
        config.umap.n_neighbors = 3;
        config.umap.n_epochs = 100;
        config.graph.n_neighbors = 3;
        config.embedding.feature_dimensions = 2;
        config.flow.iterations = 10;
        config.block_size = [4, 4];
        config.paths.labels_dir = dir.path().join("labels");
        config.paths.cache_dir = dir.path().join("cache");
        config
    }

    fn session(dir: &TempDir) -> Arc<LabelingSession> {
        LabelingSession::new(config(dir), classes(), tile()).unwrap()
    }

    /// Map coordinate of the center of a tile pixel
    fn at(row: usize, col: usize) -> (f64, f64) {
        (row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Occupies every worker until the returned sender is dropped
    fn hold_workers(session: &LabelingSession) -> crossbeam_channel::Sender<()> {
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let threads = session.runner.threads();
        for _ in 0..threads {
            let gate = gate.clone();
            let started = started_tx.clone();
            session.runner.spawn("hold", move || {
                let _ = started.send(());
                let _ = gate.recv();
            });
        }
        for _ in 0..threads {
            started_rx.recv_timeout(WAIT).unwrap();
        }
        release
    }

    /// Records the size of every marker batch
    #[derive(Default)]
    struct Markers(Mutex<Vec<usize>>);

    impl EmbeddingView for Markers {
        fn show_scatter_2d(&self, _: &Array2<f32>, _: &[Rgba]) {}

        fn show_point_cloud(&self, _: &Array2<f32>, _: &[Rgba]) {}

        fn set_point_colors(&self, _: &[Rgba]) {}

        fn plot_markers(&self, points: &Array2<f32>, _: &[Rgba]) {
            self.0.lock().push(points.nrows());
        }
    }

    #[test]
    fn test_tile_must_match_configured_blocks() {
        let dir = TempDir::new().unwrap();
        let mut resized = config(&dir);
        resized.block_size = [2, 2];
        assert!(matches!(
            LabelingSession::new(resized, classes(), tile()),
            Err(HyperclassError::InvalidParameter { .. })
        ));

        let mut outside = config(&dir);
        outside.block_index = [1, 0];
        assert!(matches!(
            LabelingSession::new(outside, classes(), tile()),
            Err(HyperclassError::InvalidParameter { .. })
        ));

        let mut second = config(&dir);
        second.block_index = [0, 1];
        let session = LabelingSession::new(second, classes(), tile()).unwrap();
        assert_eq!(session.active_block(), None);
        assert_eq!(session.activate_default_block().unwrap(), BlockId::new(0, 1));
        assert_eq!(session.active_block(), Some(BlockId::new(0, 1)));
    }

    #[test]
    fn test_edits_require_active_block() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let (y, x) = at(0, 0);
        assert!(matches!(session.add_label(y, x, 1), Err(HyperclassError::WorkflowViolation(_))));
        assert!(matches!(session.submit(), Err(HyperclassError::WorkflowViolation(_))));
    }

    #[test]
    fn test_submit_without_labels_is_refused() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let id = session.activate_block(0, 0).unwrap();
        assert!(matches!(session.submit(), Err(HyperclassError::WorkflowViolation(_))));
        assert_eq!(session.with_store(id, LabelStore::state), Some(LabelState::Unlabeled));
        // The refused submit must not leave the block marked busy.
        let (y, x) = at(0, 0);
        session.add_label(y, x, 1).unwrap();
    }

    #[test]
    fn test_spread_result_is_applied_to_active_block() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let mut pump = session.bus().subscribe_gui();
        let id = session.activate_block(0, 0).unwrap();
        let (y, x) = at(0, 0);
        session.add_label(y, x, 1).unwrap();
        let (y, x) = at(0, 3);
        session.add_label(y, x, 2).unwrap();
        session.submit().unwrap();

        let report = session.settle(WAIT);
        assert_eq!(report.failed, 0);
        assert_eq!(report.stale, 0);
        assert_eq!(session.pending_tasks(), 0);

        let map = session.with_store(id, |store| store.label_map().cloned()).flatten().unwrap();
        assert_eq!(map[[2, 0]], 1);
        assert_eq!(map[[2, 3]], 2);
        assert_eq!(map[[3, 3]], NO_DATA);

        let events = pump.pump();
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Labels(LabelEvent::Spread { block, .. }) if *block == id)));
    }

    #[test]
    fn test_block_is_locked_while_spreading() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let id = session.activate_block(0, 0).unwrap();
        let (y, x) = at(0, 0);
        session.add_label(y, x, 1).unwrap();
        session.settle(WAIT);

        let release = hold_workers(&session);
        session.submit().unwrap();
        let (y, x) = at(1, 3);
        for result in [
            session.add_label(y, x, 2),
            session.undo().map(|_| ()),
            session.clear(),
            session.reset(),
            session.submit(),
        ] {
            assert!(matches!(result, Err(HyperclassError::WorkflowViolation(_))));
        }
        assert_eq!(session.with_store(id, |store| store.selection().len()), Some(1));

        drop(release);
        let report = session.settle(WAIT);
        assert_eq!(report.failed, 0);
        assert_eq!(report.applied, 1);
        assert_eq!(session.with_store(id, LabelStore::state), Some(LabelState::Spread));
        session.add_label(y, x, 2).unwrap();
        assert_eq!(session.undo().unwrap(), Some(PointLabel::new(y, x, 2)));
    }

    #[test]
    fn test_markers_are_projected_on_the_worker_pool() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let view = Arc::new(Markers::default());
        session.embedding().set_view(Arc::clone(&view) as Arc<dyn EmbeddingView>);
        session.activate_block(0, 0).unwrap();
        session.remodel().unwrap();
        assert_eq!(session.settle(WAIT).failed, 0);

        let release = hold_workers(&session);
        let (y, x) = at(1, 1);
        session.add_label(y, x, 2).unwrap();
        assert!(view.0.lock().is_empty());

        drop(release);
        let started = Instant::now();
        while view.0.lock().is_empty() && started.elapsed() < WAIT {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*view.0.lock(), vec![1]);
    }

    #[test]
    fn test_finished_spread_for_inactive_block_is_stale() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        session.activate_block(0, 0).unwrap();
        let other = BlockId::new(0, 1);
        let handle = session.runner.start_for_block(other, "spread", || -> Result<SpreadOutcome> {
            Ok(SpreadOutcome {
                labels: vec![1],
                potentials: vec![0.0],
                rounds: 1,
            })
        });
        let result = session.finish(Pending::Spread(handle), false);
        assert!(matches!(result, Err(HyperclassError::StaleResult(block)) if block == other));
    }

    #[test]
    fn test_result_for_inactive_block_is_stale() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let first = session.activate_block(0, 0).unwrap();
        let (y, x) = at(1, 1);
        session.add_label(y, x, 2).unwrap();
        session.submit().unwrap();
        session.activate_block(0, 1).unwrap();

        let report = session.settle(WAIT);
        assert!(report.stale >= 1);
        // The stale spread still completed into its own store.
        let state = session.with_store(first, LabelStore::state).unwrap();
        assert_eq!(state, LabelState::Spread);
    }

    #[test]
    fn test_labels_persist_across_sessions() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let id = session.activate_block(0, 1).unwrap();
        let (y, x) = at(2, 5);
        session.add_label(y, x, 2).unwrap();
        session.exit().unwrap();
        assert!(session.label_path(id).exists());

        let reopened = LabelingSession::new(config(&dir), classes(), tile()).unwrap();
        reopened.activate_block(0, 1).unwrap();
        let selection = reopened.with_store(id, |store| store.selection().to_vec()).unwrap();
        assert_eq!(selection, vec![PointLabel::new(y, x, 2)]);
    }

    #[test]
    fn test_pick_outside_active_block_is_rejected() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let id = session.activate_block(0, 0).unwrap();
        let (y, x) = at(1, 6);
        assert!(matches!(session.add_label(y, x, 1), Err(HyperclassError::OutOfBounds { .. })));
        assert_eq!(session.with_store(id, |store| store.selection().len()), Some(0));
    }

    #[test]
    fn test_events_drive_the_session() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let bus = Arc::clone(session.bus());
        bus.submit_event(Event::Gui(GuiEvent::ActivateBlock { row: 0, col: 0 }), EventMode::Foreground);
        assert_eq!(session.active_block(), Some(BlockId::new(0, 0)));

        bus.submit_event(Event::Gui(GuiEvent::SelectClass { class: 2 }), EventMode::Foreground);
        let (y, x) = at(1, 2);
        bus.submit_event(Event::Pick(PickEvent::image(y, x)), EventMode::Foreground);
        let selection = session.with_store(BlockId::new(0, 0), |store| store.selection().to_vec()).unwrap();
        assert_eq!(selection, vec![PointLabel::new(y, x, 2)]);

        bus.submit_event(Event::Gui(GuiEvent::Undo), EventMode::Foreground);
        assert_eq!(session.with_store(BlockId::new(0, 0), |store| store.selection().len()), Some(0));
    }

    #[test]
    fn test_select_class_rejects_reserved_and_unknown() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        assert!(session.select_class(0).is_err());
        assert!(session.select_class(3).is_err());
        session.select_class(2).unwrap();
        assert_eq!(session.selected_class(), 2);
    }

    #[test]
    fn test_classify_separates_materials() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        session.activate_block(0, 0).unwrap();
        for (row, col, class) in [(0, 0, 1), (2, 1, 1), (0, 3, 2), (2, 2, 2)] {
            let (y, x) = at(row, col);
            session.add_label(y, x, class).unwrap();
        }
        let classified = session.classify().unwrap();
        assert_eq!(classified.dim(), (4, 4));
        assert_eq!(classified[[3, 3]], NO_DATA);
        assert_eq!(classified[[1, 0]], 1);
        assert_eq!(classified[[1, 3]], 2);
    }

    #[test]
    fn test_remodel_announces_refit() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let mut pump = session.bus().subscribe_gui();
        let id = session.activate_block(0, 0).unwrap();
        session.remodel().unwrap();
        let report = session.settle(WAIT);
        assert_eq!(report.failed, 0);
        assert!(session.embedding().cached_mapper(id, ModelType::PointCloud).is_some());
        assert!(pump
            .pump()
            .iter()
            .any(|event| matches!(event, Event::Model(ModelEvent::Refit { block, .. }) if *block == id)));
    }
}
