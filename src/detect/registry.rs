use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{Detector, TextRecognizer};
use super::backends::{StubDetector, StubRecognizer};

/// Builds a fresh detector for one stream.
pub type DetectorFactory = Arc<dyn Fn() -> Result<Box<dyn Detector>> + Send + Sync>;

/// Builds a fresh text recogniser for one stream.
pub type RecognizerFactory = Arc<dyn Fn() -> Result<Box<dyn TextRecognizer>> + Send + Sync>;

/// Named detector and recogniser factories.
///
/// Backends take `&mut self`, so instead of sharing one instance behind a `Mutex` the
/// registry hands out factories and every processing loop builds its own.
pub struct BackendRegistry {
    detectors: HashMap<String, DetectorFactory>,
    recognizers: HashMap<String, RecognizerFactory>,
    default_detector: Option<String>,
    default_recognizer: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
            recognizers: HashMap::new(),
            default_detector: None,
            default_recognizer: None,
        }
    }

    /// Registry pre-loaded with the `stub` detector and recogniser.
    pub fn with_stub_backends() -> Self {
        let mut registry = Self::new();
        registry.register_detector(
            "stub",
            Arc::new(|| Ok(Box::new(StubDetector::default()) as Box<dyn Detector>)),
        );
        registry.register_recognizer(
            "stub",
            Arc::new(|| Ok(Box::new(StubRecognizer::default()) as Box<dyn TextRecognizer>)),
        );
        registry
    }

    /// Register a detector factory. The first one registered becomes the default.
    pub fn register_detector(&mut self, name: &str, factory: DetectorFactory) {
        if self.default_detector.is_none() {
            self.default_detector = Some(name.to_string());
        }
        self.detectors.insert(name.to_string(), factory);
    }

    /// Register a recogniser factory. The first one registered becomes the default.
    pub fn register_recognizer(&mut self, name: &str, factory: RecognizerFactory) {
        if self.default_recognizer.is_none() {
            self.default_recognizer = Some(name.to_string());
        }
        self.recognizers.insert(name.to_string(), factory);
    }

    pub fn set_default_detector(&mut self, name: &str) -> Result<()> {
        if !self.detectors.contains_key(name) {
            return Err(anyhow!("detector backend '{}' not registered", name));
        }
        self.default_detector = Some(name.to_string());
        Ok(())
    }

    pub fn set_default_recognizer(&mut self, name: &str) -> Result<()> {
        if !self.recognizers.contains_key(name) {
            return Err(anyhow!("recognizer backend '{}' not registered", name));
        }
        self.default_recognizer = Some(name.to_string());
        Ok(())
    }

    /// Detector factory by name, or the default when `name` is `None`.
    pub fn detector(&self, name: Option<&str>) -> Result<DetectorFactory> {
        let name = name
            .or(self.default_detector.as_deref())
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.detectors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("detector backend '{}' not registered", name))
    }

    /// Recogniser factory by name, or the default when `name` is `None`.
    pub fn recognizer(&self, name: Option<&str>) -> Result<RecognizerFactory> {
        let name = name
            .or(self.default_recognizer.as_deref())
            .ok_or_else(|| anyhow!("no recognizer backend registered"))?;
        self.recognizers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("recognizer backend '{}' not registered", name))
    }

    /// Registered detector names, sorted.
    pub fn list_detectors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.detectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_recognizers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recognizers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
