use crate::error::PipelineResult;
use crate::frame::Frame;

use super::result::{Detection, TextReading};

/// Plate detector.
///
/// `infer` returns `Ok(vec![])` when nothing is found. An `Err` means the backend itself
/// failed; the caller skips detection for that frame and carries on.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect plates in `frame`, keeping only boxes scoring at least `confidence_threshold`.
    ///
    /// Boxes are in the pixel coordinates of `frame`.
    fn infer(&mut self, frame: &Frame, confidence_threshold: f32) -> PipelineResult<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Text recogniser run on a cropped plate image.
///
/// Same contract as `Detector`: an empty list is a valid answer.
pub trait TextRecognizer: Send {
    fn name(&self) -> &'static str;

    fn read(&mut self, crop: &Frame) -> PipelineResult<Vec<TextReading>>;
}
