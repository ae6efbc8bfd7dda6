//! Plate Watch
//!
//! Multi-stream licence plate ingestion. Every configured video stream gets a supervisor
//! that runs two threads sharing a bounded frame buffer:
//!
//! - a capture loop that reads, validates and rate-limits frames from a `StreamConnection`
//! - a processing loop that detects plates, reads their text, deduplicates readings by
//!   location with a `PlateTracker` and hands the best ones to persistence
//!
//! Saved plates are gated globally by a `PlateArchive` (best confidence per normalized
//! plate), written by a `PlateStore` and optionally forwarded to a downstream receiver.
//!
//! # Module Structure
//!
//! - `connection`, `ingest`: video sources and the retrying connection around them
//! - `capture`, `processing`, `frame`: the two per-stream loops and their buffer
//! - `detect`, `tracker`, `plates`, `storage`: detection, deduplication and persistence
//! - `supervisor`, `fleet`: per-stream lifecycle and the configured set of streams
//! - `transport`: downstream delivery and the receiving side

pub mod annotate;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod connection;
pub mod detect;
pub mod error;
pub mod fleet;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod plates;
pub mod processing;
pub mod status;
pub mod storage;
pub mod supervisor;
pub mod tracker;
pub mod transport;

pub use annotate::{AnnotatedFrame, DisplaySink, OverlayLabel};
pub use cancel::CancelToken;
pub use capture::{CaptureExit, CaptureLoop, CapturePolicy, CaptureReport};
pub use config::{PlateWatchConfig, StreamConfig};
pub use connection::{ConnectionPolicy, FrameRejection, ReadOutcome, StreamConnection};
pub use detect::{BackendRegistry, Detection, Detector, TextReading, TextRecognizer};
pub use error::{PipelineError, PipelineResult};
pub use fleet::{FleetManager, ReconcileSummary};
pub use frame::{Frame, FrameBuffer};
pub use geometry::{BoundingBox, DetectionRegion, LocationKey};
pub use ingest::{DefaultSourceFactory, SourceFactory, SourceRequest, VideoSource};
pub use plates::{
    normalize_plate, InMemoryPlateStore, PlateArchive, PlateCapture, PlateStore, SaveDecision,
    SavedArtifacts, SavedPlate,
};
pub use processing::{DetectionSettings, FrameProcessor, ProcessingLoop};
pub use status::{EventKind, EventSink, StatusReporter, StreamEvent, StreamStatus};
pub use storage::FilesystemPlateStore;
pub use supervisor::{PipelineSettings, StreamServices, StreamSupervisor};
pub use tracker::{PlateReading, PlateTrack, PlateTracker};
pub use transport::{BundleReceiver, DownstreamDispatcher, DownstreamTarget, TcpDownstreamSender};
