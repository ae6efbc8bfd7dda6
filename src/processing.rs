//! Processing loop: frames in, detections, plate readings and annotated frames out.

use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::annotate::{AnnotatedFrame, Annotator, DisplaySink};
use crate::cancel::CancelToken;
use crate::detect::{best_reading, Detection, Detector, TextRecognizer};
use crate::frame::{Frame, FrameBuffer, DEFAULT_POP_TIMEOUT};
use crate::geometry::{active_region, BoundingBox, DetectionRegion, LocationKey};
use crate::plates::{PlateArchive, PlateCapture, SaveDecision};
use crate::status::StatusReporter;
use crate::tracker::PlateTracker;
use crate::transport::{DownstreamDispatcher, DownstreamTarget};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSettings {
    pub confidence_threshold: f32,
    pub location_threshold: u32,
    pub max_missing_frames: u32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            location_threshold: crate::geometry::DEFAULT_LOCATION_THRESHOLD,
            max_missing_frames: crate::tracker::DEFAULT_MAX_MISSING_FRAMES,
        }
    }
}

/// Per-stream settings that can change while the stream runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveSettings {
    pub region: Option<DetectionRegion>,
    pub downstream: Option<DownstreamTarget>,
}

pub type SharedSettings = Arc<RwLock<LiveSettings>>;

/// Counters for one processed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub detections: usize,
    pub readings: usize,
    pub saved: usize,
    pub errors: usize,
    pub evicted: usize,
}

/// Everything the processing side of one stream owns.
pub struct FrameProcessor {
    stream_id: String,
    detector: Box<dyn Detector>,
    recognizer: Box<dyn TextRecognizer>,
    tracker: PlateTracker,
    settings: DetectionSettings,
    live: SharedSettings,
    archive: Arc<PlateArchive>,
    downstream: Option<Arc<DownstreamDispatcher>>,
    status: StatusReporter,
}

impl FrameProcessor {
    pub fn new(
        detector: Box<dyn Detector>,
        recognizer: Box<dyn TextRecognizer>,
        settings: DetectionSettings,
        live: SharedSettings,
        archive: Arc<PlateArchive>,
        downstream: Option<Arc<DownstreamDispatcher>>,
        status: StatusReporter,
    ) -> Self {
        Self {
            stream_id: status.stream_id().to_string(),
            tracker: PlateTracker::new(settings.max_missing_frames),
            detector,
            recognizer,
            settings,
            live,
            archive,
            downstream,
            status,
        }
    }

    pub fn tracker(&self) -> &PlateTracker {
        &self.tracker
    }

    pub fn warm_up(&mut self) {
        if let Err(err) = self.detector.warm_up() {
            self.status.warn(err.to_string());
        }
    }

    /// Run one frame through detection, recognition, tracking and persistence.
    ///
    /// The tracker ages every track before this frame's readings and evicts after them.
    /// With `annotate`, also returns an annotated copy of the frame.
    pub fn process(&mut self, frame: &Frame, annotate: bool) -> (Option<AnnotatedFrame>, FrameReport) {
        let live = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let region = active_region(live.region);
        let mut report = FrameReport::default();
        let mut annotator = if annotate { Annotator::new(frame) } else { None };

        self.tracker.tick();
        for detection in self.detect(frame, region, &mut report) {
            report.detections += 1;
            if let Some(annotator) = annotator.as_mut() {
                annotator.detection(&detection);
            }
            let Some((text, confidence)) = self.recognize(frame, &detection, &mut report) else {
                continue;
            };
            report.readings += 1;

            let key = LocationKey::for_box(&detection.bbox, self.settings.location_threshold);
            let best = self.tracker.observe(key, &text, confidence);
            if let Some(annotator) = annotator.as_mut() {
                annotator.plate_text(&detection.bbox, &best.text, best.confidence);
            }
            self.persist(frame, &detection, region, &best.text, best.confidence, &live, &mut report);
        }
        report.evicted = self.tracker.evict_stale();

        if let (Some(annotator), Some(region)) = (annotator.as_mut(), region) {
            annotator.region(&region);
        }
        (annotator.map(|a| a.finish(&self.stream_id)), report)
    }

    /// Detections in full-frame coordinates whose centre lies inside the region.
    fn detect(
        &mut self,
        frame: &Frame,
        region: Option<DetectionRegion>,
        report: &mut FrameReport,
    ) -> Vec<Detection> {
        let rect = region.map(|r| r.to_pixels(frame.width, frame.height));
        let (input, origin) = match rect.and_then(|rect| Some((frame.crop(&rect)?, rect))) {
            Some((crop, rect)) => (crop, (rect.x1, rect.y1)),
            None => (frame.clone(), (0, 0)),
        };

        let found = match self
            .detector
            .infer(&input, self.settings.confidence_threshold)
        {
            Ok(found) => found,
            Err(err) => {
                report.errors += 1;
                self.status.warn(err.to_string());
                return Vec::new();
            }
        };

        found
            .into_iter()
            .map(|d| {
                let b = d.bbox;
                Detection::new(
                    BoundingBox::new(b.x1 + origin.0, b.y1 + origin.1, b.x2 + origin.0, b.y2 + origin.1),
                    d.confidence,
                )
            })
            .filter(|d| match region {
                Some(region) => {
                    let (cx, cy) = d.bbox.center();
                    region.contains_point(cx, cy, frame.width, frame.height)
                }
                None => true,
            })
            .collect()
    }

    fn recognize(
        &mut self,
        frame: &Frame,
        detection: &Detection,
        report: &mut FrameReport,
    ) -> Option<(String, f32)> {
        let crop = frame.crop(&detection.bbox)?;
        match self.recognizer.read(&crop) {
            Ok(readings) => {
                let best = best_reading(readings)?;
                let text = best.text.trim();
                (!text.is_empty()).then(|| (text.to_string(), best.confidence))
            }
            Err(err) => {
                report.errors += 1;
                self.status.warn(err.to_string());
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        frame: &Frame,
        detection: &Detection,
        region: Option<DetectionRegion>,
        text: &str,
        confidence: f32,
        live: &LiveSettings,
        report: &mut FrameReport,
    ) {
        let Some(plate_crop) = frame.crop(&detection.bbox) else {
            return;
        };
        let capture = PlateCapture {
            stream_id: &self.stream_id,
            text,
            confidence,
            bbox: detection.bbox,
            region,
            frame,
            plate_crop: &plate_crop,
            captured_at: frame.captured_at(),
        };
        match self.archive.offer(&capture) {
            Ok(SaveDecision::Saved(artifacts)) => {
                report.saved += 1;
                self.status.plate_saved(&artifacts.plate, artifacts.confidence);
                if let (Some(dispatcher), Some(target)) = (&self.downstream, &live.downstream) {
                    dispatcher.dispatch(&self.stream_id, target, &artifacts);
                }
            }
            Ok(SaveDecision::Skipped(reason)) => {
                log::trace!("ProcessingLoop[{}]: not saved: {:?}", self.stream_id, reason);
            }
            Err(err) => {
                report.errors += 1;
                self.status.warn(err.to_string());
            }
        }
    }
}

/// Totals for a finished processing thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    pub frames_processed: u64,
    pub plates_saved: u64,
    pub errors: u64,
}

pub struct ProcessingLoop {
    processor: FrameProcessor,
    buffer: FrameBuffer,
    display: DisplaySink,
    cancel: CancelToken,
    pop_timeout: Duration,
}

impl ProcessingLoop {
    pub fn new(
        processor: FrameProcessor,
        buffer: FrameBuffer,
        display: DisplaySink,
        cancel: CancelToken,
    ) -> Self {
        Self {
            processor,
            buffer,
            display,
            cancel,
            pop_timeout: DEFAULT_POP_TIMEOUT,
        }
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn spawn(self) -> Result<JoinHandle<ProcessingReport>> {
        std::thread::Builder::new()
            .name(format!("process-{}", self.processor.stream_id))
            .spawn(move || self.run())
            .context("spawn processing thread")
    }

    pub fn run(mut self) -> ProcessingReport {
        let mut totals = ProcessingReport::default();
        self.processor.warm_up();
        let annotate = self.display.is_enabled();

        while !self.cancel.is_cancelled() {
            let Some(frame) = self.buffer.pop(self.pop_timeout) else {
                continue;
            };
            let (annotated, report) = self.processor.process(&frame, annotate);
            totals.frames_processed += 1;
            totals.plates_saved += report.saved as u64;
            totals.errors += report.errors as u64;
            if let Some(annotated) = annotated {
                self.display.push(annotated);
            }
        }

        log::debug!(
            "ProcessingLoop[{}]: exiting after {} frames ({} saved)",
            self.processor.stream_id,
            totals.frames_processed,
            totals.plates_saved
        );
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ScriptedDetector, ScriptedRecognizer, TextReading};
    use crate::error::PipelineError;
    use crate::plates::InMemoryPlateStore;
    use crate::status::{EventKind, EventSink};

    fn textured(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for i in 0..width * height {
            data.extend_from_slice(&[(i % 251) as u8, 60, 120]);
        }
        Frame::from_rgb(data, width, height)
    }

    fn plate_at(x: i32, y: i32, conf: f32) -> Vec<Detection> {
        vec![Detection::new(BoundingBox::new(x, y, x + 40, y + 12), conf)]
    }

    fn read(text: &str, conf: f32) -> Vec<TextReading> {
        vec![TextReading::new(text, conf)]
    }

    struct Fixture {
        processor: FrameProcessor,
        store: Arc<InMemoryPlateStore>,
        live: SharedSettings,
        events: crossbeam_channel::Receiver<crate::status::StreamEvent>,
    }

    fn fixture(detector: ScriptedDetector, recognizer: ScriptedRecognizer) -> Result<Fixture> {
        let store = Arc::new(InMemoryPlateStore::new());
        let archive = Arc::new(PlateArchive::open(store.clone(), 0.5)?);
        let live: SharedSettings = Arc::default();
        let (sink, events) = EventSink::channel(64);
        let processor = FrameProcessor::new(
            Box::new(detector),
            Box::new(recognizer),
            DetectionSettings::default(),
            live.clone(),
            archive,
            None,
            StatusReporter::new("cam", sink),
        );
        Ok(Fixture {
            processor,
            store,
            live,
            events,
        })
    }

    #[test]
    fn keeps_best_reading_per_location_and_saves_improvements() -> Result<()> {
        // All three boxes centre in bucket (3, 4).
        let detector = ScriptedDetector::new(vec![
            Ok(plate_at(140, 200, 0.9)),
            Ok(plate_at(142, 201, 0.9)),
            Ok(plate_at(141, 199, 0.9)),
        ]);
        let recognizer = ScriptedRecognizer::new(vec![
            Ok(read("AB12CD", 0.6)),
            Ok(read("AB12CD3", 0.4)),
            Ok(read("AB12XY", 0.9)),
        ]);
        let mut fx = fixture(detector, recognizer)?;
        let frame = textured(320, 240);
        for _ in 0..3 {
            fx.processor.process(&frame, false);
        }

        let track = fx
            .processor
            .tracker()
            .get(&LocationKey::new(3, 4))
            .expect("track at (3,4)");
        assert_eq!((track.best_text.as_str(), track.best_confidence), ("AB12XY", 0.9));
        let saved: Vec<String> = fx.store.saved().into_iter().map(|s| s.plate).collect();
        assert_eq!(saved, vec!["AB12CD".to_string(), "AB12XY".to_string()]);
        Ok(())
    }

    #[test]
    fn collaborator_failures_are_recoverable() -> Result<()> {
        let detector = ScriptedDetector::new(vec![
            Err(PipelineError::detector("model crashed")),
            Ok(plate_at(10, 10, 0.8)),
            Ok(plate_at(10, 10, 0.8)),
        ]);
        let recognizer = ScriptedRecognizer::new(vec![
            Err(PipelineError::ocr("ocr timeout")),
            Ok(read("KA01", 0.7)),
        ]);
        let mut fx = fixture(detector, recognizer)?;
        let frame = textured(100, 100);

        let (_, first) = fx.processor.process(&frame, false);
        assert_eq!(first.errors, 1);
        let (_, second) = fx.processor.process(&frame, false);
        assert_eq!((second.detections, second.readings, second.errors), (1, 0, 1));
        let (_, third) = fx.processor.process(&frame, false);
        assert_eq!(third.saved, 1);

        let kinds: Vec<EventKind> = fx.events.try_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Warning("detector failed: model crashed".into()),
                EventKind::Warning("text recognition failed: ocr timeout".into()),
                EventKind::PlateSaved {
                    plate: "KA01".into(),
                    confidence: 0.7
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn region_offsets_and_filters_detections() -> Result<()> {
        let detector = ScriptedDetector::new(vec![Ok(vec![
            // Crop coordinates; the crop starts at x=100.
            Detection::new(BoundingBox::new(10, 10, 50, 30), 0.9),
            Detection::new(BoundingBox::new(90, 10, 190, 30), 0.9),
        ])]);
        let recognizer = ScriptedRecognizer::new(vec![Ok(read("RG1", 0.8))]);
        let mut fx = fixture(detector, recognizer)?;
        fx.live
            .write()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .region = Some(DetectionRegion::new(0.5, 0.0, 1.0, 1.0));

        let (annotated, report) = fx.processor.process(&textured(200, 100), true);
        assert_eq!(report.detections, 1);
        assert_eq!(report.saved, 1);
        let track = fx.processor.tracker().iter().next().map(|(k, _)| *k);
        // Box (110,10)-(150,30): centre (130, 20).
        assert_eq!(track, Some(LocationKey::new(2, 0)));
        assert!(annotated.is_some());
        Ok(())
    }

    #[test]
    fn loop_feeds_display_until_cancelled() -> Result<()> {
        let mut fx = fixture(
            ScriptedDetector::new(vec![Ok(plate_at(5, 5, 0.9))]),
            ScriptedRecognizer::new(vec![Ok(read("LP1", 0.95))]),
        )?;
        fx.processor.warm_up();
        let buffer = FrameBuffer::new(4);
        buffer.push(textured(64, 48));
        buffer.push(textured(64, 48));
        let (display, frames) = DisplaySink::channel(4);
        let cancel = CancelToken::new();

        let handle = ProcessingLoop::new(fx.processor, buffer.clone(), display, cancel.clone())
            .with_pop_timeout(Duration::from_millis(10))
            .spawn()?;
        let first = frames.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(first.labels[0].text, "License Plate 0.90");
        frames.recv_timeout(Duration::from_secs(5))?;
        cancel.cancel();

        let report = handle.join().map_err(|_| anyhow::anyhow!("processing panicked"))?;
        assert_eq!(report.frames_processed, 2);
        assert_eq!(report.plates_saved, 1);
        assert!(buffer.is_empty());
        Ok(())
    }
}
