//! End-to-end labeling scenarios through the public API
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::sync::Arc;
use std::time::Duration;

use hyperclass_core::config::GraphParameters;
use hyperclass_core::events::{EventMode, GuiEvent, LabelEvent, PickEvent};
use hyperclass_core::labels::{LabelState, NO_DATA, UNLABELED};
use hyperclass_core::{
    Block, BlockId, ClassLabelSet, Configuration, EmbeddingManager, Event, FitContext, GeoTransform,
    HyperclassError, LabelFile, LabelStore, LabelingSession, ModelType, NeighborGraph, NeighborGraphBuilder,
    PointLabel, Rgba, Tile,
};
use ndarray::{array, Array3};
use tempfile::TempDir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn classes() -> ClassLabelSet {
    ClassLabelSet::new([
        ("Unlabeled", Rgba::rgb(1.0, 1.0, 1.0)),
        ("Forest", Rgba::rgb(0.0, 0.6, 0.0)),
        ("Road", Rgba::from_u8(128, 128, 128)),
    ])
    .unwrap()
}

/// One row of five valid pixels
fn strip() -> Arc<Block> {
    let data = Array3::from_shape_fn((2, 1, 5), |(b, _, c)| (c * 3 + b) as f32);
    Arc::new(Block::new(BlockId::new(0, 0), "strip", (0, 0), data, GeoTransform::identity()))
}

#[test]
fn spread_moves_one_hop_per_round() {
    init();
    // Ring 0-1-2-3-4-0, k = 2
    let graph = NeighborGraph::from_parts(
        array![[1usize, 4], [0, 2], [1, 3], [2, 4], [3, 0]],
        array![[1.0f32, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]],
    )
    .unwrap();

    let mut store = LabelStore::new(strip());
    store.add_label(0.5, 0.5, 1).unwrap();
    store.spread(&graph, 1).unwrap();
    let map = store.label_map().unwrap();
    assert_eq!(map.row(0).to_vec(), vec![1, 1, NO_DATA, NO_DATA, 1]);

    store.spread(&graph, 2).unwrap();
    let map = store.label_map().unwrap();
    assert_eq!(map.row(0).to_vec(), vec![1, 1, 1, 1, 1]);
}

#[test]
fn undo_restores_previous_labels() {
    init();
    let mut store = LabelStore::new(strip());
    store.add_label(0.5, 3.5, 2).unwrap();
    let before = store.labels().clone();
    store.add_label(0.5, 1.5, 1).unwrap();
    assert_eq!(store.undo(), Some(PointLabel::new(0.5, 1.5, 1)));
    assert_eq!(store.labels(), &before);

    store.clear();
    assert!(store.labeled_point_data().iter().all(|&v| v == UNLABELED || v == NO_DATA));
}

#[test]
fn spread_without_labels_is_a_workflow_violation() {
    init();
    let mut store = LabelStore::new(strip());
    let graph = NeighborGraphBuilder::new(GraphParameters {
        n_neighbors: 2,
        ..GraphParameters::default()
    })
    .build(store.point_data())
    .unwrap();
    let before = store.labels().clone();
    let err = store.spread(&graph, 3).unwrap_err();
    assert!(matches!(err, HyperclassError::WorkflowViolation(_)));
    assert!(err.is_recoverable());
    assert_eq!(store.labels(), &before);
    assert_eq!(store.state(), LabelState::Unlabeled);
}

#[test]
fn too_few_samples_for_the_graph() {
    init();
    let store = LabelStore::new(strip());
    let result = NeighborGraphBuilder::new(GraphParameters {
        n_neighbors: 5,
        ..GraphParameters::default()
    })
    .build(store.point_data());
    assert!(matches!(result, Err(HyperclassError::InsufficientData { .. })));
}

#[test]
fn label_file_round_trip() {
    init();
    let dir = TempDir::new().unwrap();
    let path = LabelFile::path_for(dir.path(), "scene.0-1");
    let selection = vec![PointLabel::new(10.5, 4.5, 2), PointLabel::new(3.5, 7.5, 1)];
    let file = LabelFile::new(&classes(), &selection);
    file.write(&path).unwrap();

    let read = LabelFile::read(&path).unwrap();
    assert_eq!(read, file);
    assert_eq!(read.class_set().unwrap(), classes());

    std::fs::write(&path, "{ not json").unwrap();
    assert!(LabelFile::read(&path).is_none());
}

#[test]
fn get_mapper_returns_the_cached_instance() {
    init();
    let mut config = Configuration::default();
    config.umap.n_neighbors = 3;
    config.umap.n_epochs = 20;
    let manager = EmbeddingManager::new(&config, Arc::new(classes())).with_cache_dir(None);
    let data = Array3::from_shape_fn((3, 4, 4), |(b, r, c)| (b + r * 4 + c) as f32);
    let block = Block::new(BlockId::new(0, 0), "scene", (0, 0), data, GeoTransform::identity());

    let first = manager.get_mapper(FitContext::new(&block), ModelType::PointCloud, false).unwrap();
    let second = manager.get_mapper(FitContext::new(&block), ModelType::PointCloud, false).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let refit = manager.get_mapper(FitContext::new(&block), ModelType::PointCloud, true).unwrap();
    assert!(!Arc::ptr_eq(&first, &refit));
}

#[test]
fn session_workflow_over_the_event_bus() {
    init();
    let dir = TempDir::new().unwrap();
    let mut config = Configuration::default();
    config.graph.n_neighbors = 3;
    config.umap.n_neighbors = 3;
    config.umap.n_epochs = 20;
    config.flow.iterations = 20;
    config.block_size = [3, 3];
    config.paths.labels_dir = dir.path().join("labels");
    config.paths.cache_dir = dir.path().join("cache");

    let data = Array3::from_shape_fn((2, 3, 6), |(b, r, c)| (b * 100 + r * 6 + c) as f32);
    let tile = Tile::with_config("scene", data, GeoTransform::identity(), &config).unwrap();
    let session = LabelingSession::new(config, classes(), tile).unwrap();
    let bus = Arc::clone(session.bus());
    let mut pump = bus.subscribe_gui();

    for event in [
        Event::Gui(GuiEvent::ActivateBlock { row: 0, col: 0 }),
        Event::Gui(GuiEvent::SelectClass { class: 1 }),
        Event::Pick(PickEvent::image(0.5, 0.5)),
        Event::Gui(GuiEvent::Submit),
    ] {
        bus.submit_event(event, EventMode::Foreground);
    }
    let report = session.settle(Duration::from_secs(30));
    assert_eq!(report.failed, 0);

    let block = BlockId::new(0, 0);
    let state = session.with_store(block, LabelStore::state).unwrap();
    assert_eq!(state, LabelState::Spread);
    let events = pump.pump();
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::Labels(LabelEvent::Spread { coverage: 9, .. }))));

    // Submitting on a block without labels reports a status line.
    bus.submit_event(Event::Gui(GuiEvent::ActivateBlock { row: 0, col: 1 }), EventMode::Foreground);
    bus.submit_event(Event::Gui(GuiEvent::Submit), EventMode::Foreground);
    assert!(pump
        .pump()
        .iter()
        .any(|event| matches!(event, Event::Status { message } if message.contains("Label at least one point"))));

    session.settle(Duration::from_secs(30));
    session.exit().unwrap();
    assert!(session.label_path(block).exists());
    assert!(!session.label_path(BlockId::new(0, 1)).exists());
}
