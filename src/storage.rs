use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::{ImageFormat, RgbImage};
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::annotate::{draw_box, DETECTION_COLOR};
use crate::error::{PipelineError, PipelineResult};
use crate::geometry::active_region;
use crate::plates::{PlateCapture, PlateStore, SavedArtifacts, SavedPlate};

pub const DEFAULT_OUTPUT_DIR: &str = "detected_plates";

/// Writes each saved reading as a plate crop, a vehicle image and a metadata text file.
///
/// File names are `<PLATE>_<YYYYmmdd_HHMMSS>` plus `_plate.jpg`, `_vehicle.jpg` or `.txt`.
pub struct FilesystemPlateStore {
    output_dir: PathBuf,
    plate_line: Regex,
    confidence_line: Regex,
}

impl FilesystemPlateStore {
    pub fn open(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        Ok(Self {
            output_dir,
            plate_line: Regex::new(r"^Plate Number:\s*(.*?)\s*$")?,
            confidence_line: Regex::new(r"^Confidence:\s*([0-9]*\.?[0-9]+)\s*$")?,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Parse the first two lines of a metadata file.
    fn parse_metadata(&self, contents: &str) -> Option<SavedPlate> {
        let mut lines = contents.lines();
        let plate = self
            .plate_line
            .captures(lines.next()?)?
            .get(1)?
            .as_str()
            .to_string();
        let confidence = self
            .confidence_line
            .captures(lines.next()?)?
            .get(1)?
            .as_str()
            .parse::<f32>()
            .ok()?;
        Some(SavedPlate { plate, confidence })
    }

    fn vehicle_image(capture: &PlateCapture<'_>) -> PipelineResult<RgbImage> {
        let frame = capture.frame;
        let region = active_region(capture.region)
            .map(|r| r.to_pixels(frame.width, frame.height))
            .and_then(|rect| Some((frame.crop(&rect)?, rect)));
        let (source, bbox) = match region {
            Some((crop, rect)) => (crop, capture.bbox.relative_to(&rect)),
            None => (frame.clone(), capture.bbox),
        };
        let mut image = source
            .to_image()
            .ok_or_else(|| PipelineError::persistence("vehicle frame has inconsistent size"))?;
        draw_box(&mut image, &bbox, DETECTION_COLOR);
        Ok(image)
    }
}

fn write_jpeg(image: &RgbImage, path: &Path) -> PipelineResult<()> {
    image
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|err| PipelineError::persistence(format!("write {}: {}", path.display(), err)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl PlateStore for FilesystemPlateStore {
    fn load_existing(&self) -> Result<Vec<SavedPlate>> {
        let mut plates = Vec::new();
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(plates),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read output dir {}", self.output_dir.display()))
            }
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(contents) => match self.parse_metadata(&contents) {
                    Some(saved) => plates.push(saved),
                    None => log::warn!(
                        "FilesystemPlateStore: skipping malformed metadata {}",
                        path.display()
                    ),
                },
                Err(err) => {
                    log::warn!("FilesystemPlateStore: cannot read {}: {}", path.display(), err)
                }
            }
        }
        Ok(plates)
    }

    fn save(&self, plate: &str, capture: &PlateCapture<'_>) -> PipelineResult<SavedArtifacts> {
        let timestamp: DateTime<Local> = capture.captured_at.into();
        let stem = format!("{}_{}", plate, timestamp.format("%Y%m%d_%H%M%S"));
        let plate_image = self.output_dir.join(format!("{}_plate.jpg", stem));
        let vehicle_image = self.output_dir.join(format!("{}_vehicle.jpg", stem));
        let metadata = self.output_dir.join(format!("{}.txt", stem));

        let crop = capture
            .plate_crop
            .to_image()
            .ok_or_else(|| PipelineError::persistence("plate crop has inconsistent size"))?;
        write_jpeg(&crop, &plate_image)?;
        write_jpeg(&Self::vehicle_image(capture)?, &vehicle_image)?;

        let bbox = capture.bbox;
        let mut text = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(text, "Plate Number: {}", plate);
        let _ = writeln!(text, "Confidence: {:.2}", capture.confidence);
        let _ = writeln!(text, "Timestamp: {}", timestamp.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(text, "Plate Image: {}", file_name(&plate_image));
        let _ = writeln!(text, "Vehicle Image: {}", file_name(&vehicle_image));
        let _ = writeln!(
            text,
            "Detection Coordinates: x1={}, y1={}, x2={}, y2={}",
            bbox.x1, bbox.y1, bbox.x2, bbox.y2
        );
        let _ = writeln!(text, "Stream: {}", capture.stream_id);
        std::fs::write(&metadata, text).map_err(|err| {
            PipelineError::persistence(format!("write {}: {}", metadata.display(), err))
        })?;

        Ok(SavedArtifacts {
            plate: plate.to_string(),
            confidence: capture.confidence,
            vehicle_image,
            plate_image,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::geometry::{BoundingBox, DetectionRegion};
    use crate::plates::{PlateArchive, SaveDecision};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn frame() -> Frame {
        let mut data = Vec::new();
        for i in 0..(64 * 48) {
            data.extend_from_slice(&[(i % 200) as u8, 90, 40]);
        }
        Frame::from_rgb(data, 64, 48)
    }

    #[test]
    fn save_writes_three_files_and_reloads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemPlateStore::open(dir.path())?;
        let frame = frame();
        let bbox = BoundingBox::new(10, 10, 30, 20);
        let crop = frame.crop(&bbox).expect("crop");
        let capture = PlateCapture {
            stream_id: "gate",
            text: "ab 12 cd",
            confidence: 0.876,
            bbox,
            region: Some(DetectionRegion::new(0.0, 0.0, 0.75, 0.75)),
            frame: &frame,
            plate_crop: &crop,
            captured_at: SystemTime::now(),
        };

        let saved = store.save("AB12CD", &capture)?;
        assert!(saved.plate_image.exists());
        assert!(saved.vehicle_image.exists());
        let vehicle = image::open(&saved.vehicle_image)?;
        assert_eq!((vehicle.width(), vehicle.height()), (48, 36));

        let text = std::fs::read_to_string(&saved.metadata)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Plate Number: AB12CD");
        assert_eq!(lines[1], "Confidence: 0.88");
        assert!(lines[3].starts_with("Plate Image: AB12CD_"));
        assert_eq!(lines[5], "Detection Coordinates: x1=10, y1=10, x2=30, y2=20");

        let loaded = store.load_existing()?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].plate, "AB12CD");
        assert!((loaded[0].confidence - 0.88).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn load_skips_malformed_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("junk.txt"), "hello\nworld\n")?;
        std::fs::write(
            dir.path().join("XY99_20240101_101010.txt"),
            "Plate Number: XY99\nConfidence: 0.71\n",
        )?;
        std::fs::write(dir.path().join("notes.md"), "Plate Number: NOPE\n")?;
        let store = FilesystemPlateStore::open(dir.path())?;
        let loaded = store.load_existing()?;
        assert_eq!(
            loaded,
            vec![SavedPlate {
                plate: "XY99".into(),
                confidence: 0.71
            }]
        );
        Ok(())
    }

    #[test]
    fn archive_over_filesystem_store_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let frame = frame();
        let bbox = BoundingBox::new(0, 0, 16, 8);
        let crop = frame.crop(&bbox).expect("crop");
        let capture = PlateCapture {
            stream_id: "gate",
            text: "KL01",
            confidence: 0.8,
            bbox,
            region: None,
            frame: &frame,
            plate_crop: &crop,
            captured_at: SystemTime::now(),
        };

        let archive = PlateArchive::open(Arc::new(FilesystemPlateStore::open(dir.path())?), 0.5)?;
        assert!(matches!(archive.offer(&capture)?, SaveDecision::Saved(_)));
        drop(archive);

        let reopened = PlateArchive::open(Arc::new(FilesystemPlateStore::open(dir.path())?), 0.5)?;
        assert_eq!(reopened.best_confidence("KL01"), Some(0.8));
        assert!(matches!(reopened.offer(&capture)?, SaveDecision::Skipped(_)));
        Ok(())
    }
}
