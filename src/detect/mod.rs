//! Plate detector and text recogniser collaborators.
//!
//! Both are opaque to the pipeline: only their input/output contracts matter.
//! Backends are created per stream through factories held in a `BackendRegistry`,
//! so each `ProcessingLoop` owns its own instance and no locking is needed.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{Detector, TextRecognizer};
pub use backends::{ScriptedDetector, ScriptedRecognizer, StubDetector, StubRecognizer};
pub use registry::{BackendRegistry, DetectorFactory, RecognizerFactory};
pub use result::{best_reading, Detection, TextReading};
