use crate::geometry::BoundingBox;

/// One detected plate: pixel box plus detector confidence in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }
}

/// One text candidate returned by a recogniser.
#[derive(Clone, Debug, PartialEq)]
pub struct TextReading {
    pub text: String,
    pub confidence: f32,
    /// Corner points of the text inside the crop, when the backend reports them.
    pub polygon: Vec<(i32, i32)>,
}

impl TextReading {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            polygon: Vec::new(),
        }
    }
}

/// Highest-confidence reading. NaN scores never win.
pub fn best_reading(readings: Vec<TextReading>) -> Option<TextReading> {
    readings
        .into_iter()
        .filter(|r| !r.confidence.is_nan())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}
