use crate::detect::backend::{Detector, TextRecognizer};
use crate::detect::result::{Detection, TextReading};
use crate::error::PipelineResult;
use crate::frame::Frame;
use crate::geometry::DetectionRegion;

/// Stub detector for `stub://` pipelines and tests.
///
/// Reports fixed boxes given in fractional frame coordinates, so the same stub works for
/// any frame size.
pub struct StubDetector {
    boxes: Vec<(DetectionRegion, f32)>,
}

impl StubDetector {
    pub fn new(boxes: Vec<(DetectionRegion, f32)>) -> Self {
        Self { boxes }
    }
}

impl Default for StubDetector {
    /// One plate-shaped box in the middle of the frame.
    fn default() -> Self {
        Self::new(vec![(DetectionRegion::new(0.4, 0.45, 0.6, 0.55), 0.8)])
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame, confidence_threshold: f32) -> PipelineResult<Vec<Detection>> {
        Ok(self
            .boxes
            .iter()
            .filter(|(_, confidence)| *confidence >= confidence_threshold)
            .map(|(rect, confidence)| {
                Detection::new(rect.to_pixels(frame.width, frame.height), *confidence)
            })
            .collect())
    }
}

/// Stub recogniser returning the same reading for every crop.
pub struct StubRecognizer {
    text: String,
    confidence: f32,
}

impl StubRecognizer {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new("STUB 001", 0.9)
    }
}

impl TextRecognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn read(&mut self, crop: &Frame) -> PipelineResult<Vec<TextReading>> {
        if crop.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![TextReading::new(self.text.clone(), self.confidence)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_detector_scales_boxes_and_filters_threshold() -> anyhow::Result<()> {
        let mut detector = StubDetector::new(vec![
            (DetectionRegion::new(0.0, 0.0, 0.5, 0.5), 0.9),
            (DetectionRegion::new(0.5, 0.5, 1.0, 1.0), 0.2),
        ]);
        let frame = Frame::from_rgb(vec![0; 200 * 100 * 3], 200, 100);
        let found = detector.infer(&frame, 0.25)?;
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].bbox.x2, found[0].bbox.y2), (100, 50));
        Ok(())
    }
}
