//! Saved-plate registry and the persistence seam.
//!
//! `PlateArchive` is the process-wide record of the best confidence ever saved per
//! normalised plate string. Every processing loop offers readings to the same archive;
//! the gate check and the store write happen under one lock so concurrent streams cannot
//! both save the same improvement.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::Result;

use crate::error::{PipelineError, PipelineResult};
use crate::frame::Frame;
use crate::geometry::{BoundingBox, DetectionRegion};

pub const MIN_SAVE_CONFIDENCE: f32 = 0.5;

/// Uppercase ASCII letters and digits only.
pub fn normalize_plate(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Best saved confidence for one plate, as found on disk at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedPlate {
    pub plate: String,
    pub confidence: f32,
}

/// Everything a store needs to persist one reading.
pub struct PlateCapture<'a> {
    pub stream_id: &'a str,
    /// Text as recognised, before normalisation.
    pub text: &'a str,
    pub confidence: f32,
    /// Plate box in `frame` pixel coordinates.
    pub bbox: BoundingBox,
    /// Active detection region, if any.
    pub region: Option<DetectionRegion>,
    /// Clean full frame.
    pub frame: &'a Frame,
    pub plate_crop: &'a Frame,
    pub captured_at: SystemTime,
}

/// Files written for one saved reading.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedArtifacts {
    pub plate: String,
    pub confidence: f32,
    pub vehicle_image: PathBuf,
    pub plate_image: PathBuf,
    pub metadata: PathBuf,
}

pub trait PlateStore: Send + Sync {
    /// Previously saved readings, used to seed the archive.
    fn load_existing(&self) -> Result<Vec<SavedPlate>>;

    /// Persist one reading under the normalised `plate` string.
    fn save(&self, plate: &str, capture: &PlateCapture<'_>) -> PipelineResult<SavedArtifacts>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    EmptyText,
    LowConfidence,
    NotBetter { previous: f32 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SaveDecision {
    Saved(SavedArtifacts),
    Skipped(SkipReason),
}

pub struct PlateArchive {
    store: Arc<dyn PlateStore>,
    min_confidence: f32,
    best: Mutex<HashMap<String, f32>>,
}

impl PlateArchive {
    /// Build the archive and seed it from `store.load_existing()`.
    pub fn open(store: Arc<dyn PlateStore>, min_confidence: f32) -> Result<Self> {
        let mut best: HashMap<String, f32> = HashMap::new();
        for saved in store.load_existing()? {
            let plate = normalize_plate(&saved.plate);
            if plate.is_empty() {
                continue;
            }
            let entry = best.entry(plate).or_insert(saved.confidence);
            if saved.confidence > *entry {
                *entry = saved.confidence;
            }
        }
        log::info!("PlateArchive: loaded {} saved plates", best.len());
        Ok(Self {
            store,
            min_confidence,
            best: Mutex::new(best),
        })
    }

    /// Save `capture` if it passes the gate: confidence at least the minimum, and either
    /// a new plate or strictly better than the best saved reading of that plate.
    pub fn offer(&self, capture: &PlateCapture<'_>) -> PipelineResult<SaveDecision> {
        let plate = normalize_plate(capture.text);
        if plate.is_empty() {
            return Ok(SaveDecision::Skipped(SkipReason::EmptyText));
        }
        if capture.confidence.is_nan() || capture.confidence < self.min_confidence {
            return Ok(SaveDecision::Skipped(SkipReason::LowConfidence));
        }

        let mut best = self
            .best
            .lock()
            .map_err(|_| PipelineError::persistence("saved-plate registry lock poisoned"))?;
        if let Some(previous) = best.get(&plate).copied() {
            if capture.confidence <= previous {
                return Ok(SaveDecision::Skipped(SkipReason::NotBetter { previous }));
            }
        }
        let artifacts = self.store.save(&plate, capture)?;
        best.insert(plate.clone(), capture.confidence);
        drop(best);

        log::info!(
            "PlateArchive: saved {} ({:.2}) from {}",
            plate,
            capture.confidence,
            capture.stream_id
        );
        Ok(SaveDecision::Saved(artifacts))
    }

    pub fn best_confidence(&self, plate: &str) -> Option<f32> {
        self.best
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_plate(plate))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.best.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }
}

/// Keeps saved readings in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryPlateStore {
    existing: Vec<SavedPlate>,
    saved: Mutex<Vec<SavedArtifacts>>,
    fail_saves: bool,
}

impl InMemoryPlateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing(existing: Vec<SavedPlate>) -> Self {
        Self {
            existing,
            ..Self::default()
        }
    }

    /// A store whose every `save` fails.
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<SavedArtifacts> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PlateStore for InMemoryPlateStore {
    fn load_existing(&self) -> Result<Vec<SavedPlate>> {
        Ok(self.existing.clone())
    }

    fn save(&self, plate: &str, capture: &PlateCapture<'_>) -> PipelineResult<SavedArtifacts> {
        if self.fail_saves {
            return Err(PipelineError::persistence("in-memory store rejects saves"));
        }
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| PipelineError::persistence("in-memory store lock poisoned"))?;
        let stem = format!("{}_{}", plate, saved.len());
        let artifacts = SavedArtifacts {
            plate: plate.to_string(),
            confidence: capture.confidence,
            vehicle_image: PathBuf::from(format!("{}_vehicle.jpg", stem)),
            plate_image: PathBuf::from(format!("{}_plate.jpg", stem)),
            metadata: PathBuf::from(format!("{}.txt", stem)),
        };
        saved.push(artifacts.clone());
        Ok(artifacts)
    }
}
