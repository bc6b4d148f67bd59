//! Interaction events and the bus that routes them
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod bus;
pub mod types;

pub use self::bus::{EventBus, EventClient, EventMode, GuiPump};
pub use self::types::{DataEvent, Event, GuiEvent, LabelEvent, ModelEvent, PickEvent, PickSource};
