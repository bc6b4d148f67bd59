//! Ordered class names with display colors

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::error::{HyperclassError, Result};

/// RGBA color with components in [0, 1]. Deserializes from either three or
/// four components; a missing alpha is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Rgba(pub [f32; 4]);

impl Rgba {
    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self([r, g, b, 1.0])
    }

    /// From 0-255 channel values
    pub fn from_u8(r: u8, g: u8, b: u8) -> Self {
        Self::rgb(f32::from(r) / 255.0, f32::from(g) / 255.0, f32::from(b) / 255.0)
    }

    pub fn with_alpha(self, alpha: f32) -> Self {
        let [r, g, b, _] = self.0;
        Self([r, g, b, alpha])
    }
}

impl TryFrom<Vec<f32>> for Rgba {
    type Error = String;

    fn try_from(components: Vec<f32>) -> std::result::Result<Self, Self::Error> {
        match components.as_slice() {
            [r, g, b] => Ok(Self::rgb(*r, *g, *b)),
            [r, g, b, a] => Ok(Self([*r, *g, *b, *a])),
            other => Err(format!("color needs 3 or 4 components, got {}", other.len())),
        }
    }
}

impl From<Rgba> for Vec<f32> {
    fn from(color: Rgba) -> Self {
        color.0.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassLabel {
    pub name: String,
    pub color: Rgba,
}

/// Class index 0 is reserved for unlabeled / background pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassLabelSet {
    classes: Vec<ClassLabel>,
}

impl ClassLabelSet {
    pub fn new<S: Into<String>>(classes: impl IntoIterator<Item = (S, Rgba)>) -> Result<Self> {
        let classes: Vec<ClassLabel> = classes
            .into_iter()
            .map(|(name, color)| ClassLabel {
                name: name.into(),
                color,
            })
            .collect();
        match classes.first() {
            Some(first) if is_reserved_name(&first.name) => Ok(Self { classes }),
            Some(first) => Err(HyperclassError::InvalidParameter {
                name: "class_labels".to_owned(),
                reason: format!("first class label must be 'Unlabeled', found '{}'", first.name),
            }),
            None => Err(HyperclassError::InvalidParameter {
                name: "class_labels".to_owned(),
                reason: "at least the 'Unlabeled' class is required".to_owned(),
            }),
        }
    }

    /// Builds a set from parallel name and color lists, as stored in label files
    pub fn from_parts(names: &[String], colors: &[Rgba]) -> Result<Self> {
        if names.len() != colors.len() {
            return Err(HyperclassError::InvalidParameter {
                name: "class_colors".to_owned(),
                reason: format!("{} names but {} colors", names.len(), colors.len()),
            });
        }
        Self::new(names.iter().cloned().zip(colors.iter().copied()))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ClassLabel> {
        self.classes.get(index)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.get(index).map(|class| class.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|class| class.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|class| class.name.clone()).collect()
    }

    pub fn colors(&self) -> Vec<Rgba> {
        self.classes.iter().map(|class| class.color).collect()
    }

    /// Display color of a label value; unlabeled and unknown values map to class 0
    pub fn color_for_label(&self, label: i16) -> Rgba {
        let index = usize::try_from(label).ok().filter(|&i| i < self.classes.len()).unwrap_or(0);
        self.classes[index].color
    }

    /// True for a user class index (1..N)
    pub fn is_user_class(&self, index: usize) -> bool {
        index > 0 && index < self.classes.len()
    }
}

fn is_reserved_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("unlabeled") || name.eq_ignore_ascii_case("background")
}
