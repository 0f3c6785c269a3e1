use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

/// Caption placed over the working image. Position and font size are
/// percentages of the image so overlays survive display scaling. Flattening
/// overlays into pixels happens in the compositing collaborator, outside the
/// engine; the engine only tracks the list and clears it when the base image
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOverlay {
    pub id: String,
    pub text: String,
    pub font_family: String,
    /// Percent of the image height.
    pub font_size: f32,
    pub color: String,
    pub text_align: TextAlign,
    /// Percent offsets from the top-left corner.
    pub x: f32,
    pub y: f32,
}

impl TextOverlay {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            font_family: "Arial".to_string(),
            font_size: 5.0,
            color: "#FFFFFF".to_string(),
            text_align: TextAlign::Center,
            x: 50.0,
            y: 50.0,
        }
    }
}
