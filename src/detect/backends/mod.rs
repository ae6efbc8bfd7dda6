pub mod scripted;
pub mod stub;

pub use scripted::{ScriptedDetector, ScriptedRecognizer};
pub use stub::{StubDetector, StubRecognizer};
