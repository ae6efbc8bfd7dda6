//! Backends that replay a fixed script, one entry per call. Used to drive the pipeline
//! deterministically in tests and demos.

use std::collections::VecDeque;

use crate::detect::backend::{Detector, TextRecognizer};
use crate::detect::result::{Detection, TextReading};
use crate::error::PipelineResult;
use crate::frame::Frame;

/// Replays one scripted answer per frame; reports nothing once the script runs out.
#[derive(Default)]
pub struct ScriptedDetector {
    script: VecDeque<PipelineResult<Vec<Detection>>>,
}

impl ScriptedDetector {
    pub fn new(script: impl IntoIterator<Item = PipelineResult<Vec<Detection>>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, _frame: &Frame, confidence_threshold: f32) -> PipelineResult<Vec<Detection>> {
        match self.script.pop_front() {
            Some(Ok(found)) => Ok(found
                .into_iter()
                .filter(|d| d.confidence >= confidence_threshold)
                .collect()),
            Some(Err(err)) => Err(err),
            None => Ok(Vec::new()),
        }
    }
}

/// Replays one scripted answer per crop; reports nothing once the script runs out.
#[derive(Default)]
pub struct ScriptedRecognizer {
    script: VecDeque<PipelineResult<Vec<TextReading>>>,
}

impl ScriptedRecognizer {
    pub fn new(script: impl IntoIterator<Item = PipelineResult<Vec<TextReading>>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn read(&mut self, _crop: &Frame) -> PipelineResult<Vec<TextReading>> {
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
