//! Closed event vocabulary shared by the bus and its clients
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use serde::{Deserialize, Serialize};

use crate::data::BlockId;
use crate::embedding::ModelType;

/// Where a pick originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickSource {
    Image,
    Plot,
    VtkPoint,
}

/// Mouse pick on one of the views. Raster picks carry map coordinates in
/// `row`/`col`; point-cloud picks carry the picked sample in `pid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickEvent {
    pub source: PickSource,
    pub row: f64,
    pub col: f64,
    pub button: Option<u8>,
    pub pid: Option<usize>,
    pub cid: Option<u16>,
}

impl PickEvent {
    /// Left-button pick on the raster view
    pub fn image(row: f64, col: f64) -> Self {
        Self {
            source: PickSource::Image,
            row,
            col,
            button: Some(1),
            pid: None,
            cid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuiEvent {
    Reset,
    KeyPress { key: String },
    KeyRelease { key: String },
    Slider { name: String, value: f64 },
    Submit,
    Undo,
    Clear,
    Remodel,
    SelectClass { class: u16 },
    ActivateBlock { row: usize, col: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LabelEvent {
    /// The sparse selection of a block changed
    Updated { block: BlockId, points: usize },
    /// A spread result was applied
    Spread { block: BlockId, coverage: usize, rounds: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    Refit { block: BlockId, model: ModelType },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Pick(PickEvent),
    Gui(GuiEvent),
    Labels(LabelEvent),
    Model(ModelEvent),
    Status { message: String },
}

impl Event {
    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
        }
    }

    /// Event family name
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Pick(_) => "pick",
            Event::Gui(_) => "gui",
            Event::Labels(_) => "labels",
            Event::Model(_) => "model",
            Event::Status { .. } => "status",
        }
    }

    /// Event type within its family
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Pick(pick) => match pick.source {
                PickSource::Image => "image",
                PickSource::Plot => "plot",
                PickSource::VtkPoint => "vtkpoint",
            },
            Event::Gui(gui) => match gui {
                GuiEvent::Reset => "reset",
                GuiEvent::KeyPress { .. } => "keyPress",
                GuiEvent::KeyRelease { .. } => "keyRelease",
                GuiEvent::Slider { .. } => "slider",
                GuiEvent::Submit => "submit",
                GuiEvent::Undo => "undo",
                GuiEvent::Clear => "clear",
                GuiEvent::Remodel => "remodel",
                GuiEvent::SelectClass { .. } => "selectClass",
                GuiEvent::ActivateBlock { .. } => "activateBlock",
            },
            Event::Labels(LabelEvent::Updated { .. }) => "updated",
            Event::Labels(LabelEvent::Spread { .. }) => "spread",
            Event::Model(ModelEvent::Refit { .. }) => "refit",
            Event::Status { .. } => "message",
        }
    }

    /// Raw keyboard traffic, which no core client acts on
    pub fn is_key_event(&self) -> bool {
        matches!(
            self,
            Event::Gui(GuiEvent::KeyPress { .. }) | Event::Gui(GuiEvent::KeyRelease { .. })
        )
    }
}

/// Payload fields parsed once per submitted event and shared with every
/// client of that dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataEvent {
    pub sequence: u64,
    pub kind: &'static str,
    pub type_name: &'static str,
    /// Map coordinates of a raster pick
    pub location: Option<(f64, f64)>,
    /// Sample index of a point-cloud pick
    pub sample: Option<usize>,
    pub block: Option<BlockId>,
}

impl DataEvent {
    pub fn from_event(sequence: u64, event: &Event) -> Self {
        let mut data = DataEvent {
            sequence,
            kind: event.kind(),
            type_name: event.type_name(),
            ..DataEvent::default()
        };
        match event {
            Event::Pick(pick) => {
                if pick.row.is_finite() && pick.col.is_finite() {
                    data.location = Some((pick.row, pick.col));
                }
                data.sample = pick.pid;
            }
            Event::Gui(GuiEvent::ActivateBlock { row, col }) => {
                data.block = Some(BlockId::new(*row, *col));
            }
            Event::Labels(LabelEvent::Updated { block, .. })
            | Event::Labels(LabelEvent::Spread { block, .. })
            | Event::Model(ModelEvent::Refit { block, .. }) => data.block = Some(*block),
            _ => {}
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let pick = Event::Pick(PickEvent::image(10.0, 20.0));
        assert_eq!((pick.kind(), pick.type_name()), ("pick", "image"));
        let reset = Event::Gui(GuiEvent::Reset);
        assert_eq!((reset.kind(), reset.type_name()), ("gui", "reset"));
        assert!(Event::Gui(GuiEvent::KeyRelease { key: "a".into() }).is_key_event());
        assert!(!reset.is_key_event());
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(Event::Gui(GuiEvent::Reset)).unwrap();
        assert_eq!(value["event"], "gui");
        assert_eq!(value["type"], "reset");
    }

    #[test]
    fn test_data_event_parses_payload() {
        let data = DataEvent::from_event(7, &Event::Pick(PickEvent::image(1.5, 2.5)));
        assert_eq!(data.sequence, 7);
        assert_eq!(data.location, Some((1.5, 2.5)));
        let data = DataEvent::from_event(8, &Event::Gui(GuiEvent::ActivateBlock { row: 1, col: 2 }));
        assert_eq!(data.block, Some(BlockId::new(1, 2)));
        assert_eq!(data.location, None);
    }
}
