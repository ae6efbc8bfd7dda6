//! Spatial deduplication of plate readings.
//!
//! A track is the best reading seen at one `LocationKey`. Per processed frame the caller
//! runs `tick()` before applying detections and `evict_stale()` after; a track nobody
//! re-confirms for more than `max_missing_frames` frames disappears.
//!
//! The tracker is owned by a single processing loop and needs no locking.

use std::collections::HashMap;

use crate::geometry::LocationKey;

pub const DEFAULT_MAX_MISSING_FRAMES: u32 = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct PlateReading {
    pub text: String,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlateTrack {
    pub best_text: String,
    pub best_confidence: f32,
    pub frames_missing: u32,
    pub first_seen_tick: u64,
    pub last_confirmed_tick: u64,
    pub observations: u32,
}

impl PlateTrack {
    pub fn reading(&self) -> PlateReading {
        PlateReading {
            text: self.best_text.clone(),
            confidence: self.best_confidence,
        }
    }
}

pub struct PlateTracker {
    tracks: HashMap<LocationKey, PlateTrack>,
    max_missing_frames: u32,
    tick: u64,
}

impl PlateTracker {
    pub fn new(max_missing_frames: u32) -> Self {
        Self {
            tracks: HashMap::new(),
            max_missing_frames,
            tick: 0,
        }
    }

    /// Start a new frame: every existing track is one frame older.
    pub fn tick(&mut self) -> u64 {
        self.tick += 1;
        for track in self.tracks.values_mut() {
            track.frames_missing = track.frames_missing.saturating_add(1);
        }
        self.tick
    }

    /// Apply one reading at `key` and return the track's best reading.
    ///
    /// A strictly higher confidence replaces the stored reading; equal or lower keeps it.
    pub fn observe(&mut self, key: LocationKey, text: &str, confidence: f32) -> PlateReading {
        let tick = self.tick;
        let track = self.tracks.entry(key).or_insert_with(|| {
            log::debug!("PlateTracker: new track at {} ({} {:.2})", key, text, confidence);
            PlateTrack {
                best_text: text.to_string(),
                best_confidence: confidence,
                frames_missing: 0,
                first_seen_tick: tick,
                last_confirmed_tick: tick,
                observations: 0,
            }
        });
        if confidence > track.best_confidence {
            track.best_text = text.to_string();
            track.best_confidence = confidence;
        }
        track.frames_missing = 0;
        track.last_confirmed_tick = tick;
        track.observations = track.observations.saturating_add(1);
        track.reading()
    }

    /// Drop tracks missing for more than `max_missing_frames` frames.
    pub fn evict_stale(&mut self) -> usize {
        let limit = self.max_missing_frames;
        let before = self.tracks.len();
        self.tracks.retain(|key, track| {
            let keep = track.frames_missing <= limit;
            if !keep {
                log::debug!("PlateTracker: evicting track at {} ({})", key, track.best_text);
            }
            keep
        });
        before - self.tracks.len()
    }

    pub fn get(&self, key: &LocationKey) -> Option<&PlateTrack> {
        self.tracks.get(key)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LocationKey, &PlateTrack)> {
        self.tracks.iter()
    }

    pub fn max_missing_frames(&self) -> u32 {
        self.max_missing_frames
    }
}

impl Default for PlateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSING_FRAMES)
    }
}
