//! Class definitions, per-block label state, spreading and persistence
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod class_set;
pub mod io;
pub mod spread;
pub mod store;

pub use self::class_set::{ClassLabel, ClassLabelSet, Rgba};
pub use self::io::LabelFile;
pub use self::spread::{LabelSpreader, SpreadOutcome, NO_LABEL};
pub use self::store::{LabelState, LabelStore, PointLabel, NO_DATA, UNLABELED};
