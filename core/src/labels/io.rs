//! Label file persistence
//!
//! One JSON document per block holding the class names, class colors and the
//! raw point selection. Unreadable files are treated as absent so that a
//! damaged file never prevents a session from starting.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::labels::class_set::{ClassLabelSet, Rgba};
use crate::labels::store::PointLabel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFile {
    pub class_names: Vec<String>,
    pub class_colors: Vec<Rgba>,
    pub selection: Vec<PointLabel>,
}

impl LabelFile {
    pub fn new(classes: &ClassLabelSet, selection: &[PointLabel]) -> Self {
        Self {
            class_names: classes.names(),
            class_colors: classes.colors(),
            selection: selection.to_vec(),
        }
    }

    /// Location of a label file; `key` names the tile and block
    pub fn path_for(labels_dir: &Path, key: &str) -> PathBuf {
        labels_dir.join(format!("{key}.labels.json"))
    }

    /// Reads a label file; missing or corrupt files yield `None`
    pub fn read(path: &Path) -> Option<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Ignoring unreadable label file {}: {e}", path.display());
                return None;
            }
        };
        match serde_json::from_str::<LabelFile>(&text) {
            Ok(file) => {
                info!("Reading {} point labels from file {}", file.selection.len(), path.display());
                Some(file)
            }
            Err(e) => {
                warn!("Ignoring corrupt label file {}: {e}", path.display());
                None
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("Writing {} point labels to file {}", self.selection.len(), path.display());
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Class set stored in the file, if it is well formed
    pub fn class_set(&self) -> Option<ClassLabelSet> {
        match ClassLabelSet::from_parts(&self.class_names, &self.class_colors) {
            Ok(classes) => Some(classes),
            Err(e) => {
                warn!("Ignoring class definitions in label file: {e}");
                None
            }
        }
    }
}
