use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::capture::DEFAULT_TARGET_FPS;
use crate::frame::DEFAULT_BUFFER_CAPACITY;
use crate::geometry::{DetectionRegion, DEFAULT_LOCATION_THRESHOLD};
use crate::ingest::is_camera_uri;
use crate::plates::MIN_SAVE_CONFIDENCE;
use crate::processing::{DetectionSettings, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::storage::DEFAULT_OUTPUT_DIR;
use crate::supervisor::PipelineSettings;
use crate::tracker::DEFAULT_MAX_MISSING_FRAMES;
use crate::transport::DownstreamTarget;

pub const CONFIG_ENV: &str = "PLATEWATCH_CONFIG";
const DEFAULT_BACKEND: &str = "stub";

#[derive(Debug, Deserialize, Default)]
struct PlateWatchConfigFile {
    video_settings: Option<VideoSettingsFile>,
    detection: Option<DetectionConfigFile>,
    output_dir: Option<PathBuf>,
    downstream: Option<DownstreamTarget>,
    streams: Option<Vec<StreamConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoSettingsFile {
    max_queue_size: Option<usize>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    location_threshold_px: Option<u32>,
    max_missing_frames: Option<u32>,
    min_save_confidence: Option<f32>,
    backend: Option<String>,
    recognizer: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One configured video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub detection_region: Option<DetectionRegion>,
    #[serde(default)]
    pub downstream: Option<DownstreamTarget>,
    #[serde(default)]
    pub is_camera: bool,
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            enabled: true,
            detection_region: None,
            downstream: None,
            is_camera: false,
        }
    }

    /// Enabled with something to connect to.
    pub fn is_runnable(&self) -> bool {
        self.enabled && !self.source.trim().is_empty()
    }

    /// Live devices are read as fast as they deliver.
    pub fn live_camera(&self) -> bool {
        self.is_camera || is_camera_uri(&self.source)
    }

    /// True when switching from `self` to `other` needs a new connection.
    pub fn needs_restart(&self, other: &StreamConfig) -> bool {
        self.source != other.source || self.live_camera() != other.live_camera()
    }
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub max_queue_size: usize,
    pub target_fps: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PlateWatchConfig {
    pub video: VideoSettings,
    pub detection: DetectionSettings,
    pub min_save_confidence: f32,
    pub detector_backend: String,
    pub recognizer_backend: Option<String>,
    pub output_dir: PathBuf,
    pub downstream: Option<DownstreamTarget>,
    pub streams: Vec<StreamConfig>,
}

impl PlateWatchConfig {
    /// Read the file named by `PLATEWATCH_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PlateWatchConfigFile) -> Result<Self> {
        let video_file = file.video_settings.unwrap_or_default();
        let video = VideoSettings {
            max_queue_size: video_file.max_queue_size.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            target_fps: video_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            width: video_file.width,
            height: video_file.height,
        };
        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            location_threshold: detection_file
                .location_threshold_px
                .unwrap_or(DEFAULT_LOCATION_THRESHOLD),
            max_missing_frames: detection_file
                .max_missing_frames
                .unwrap_or(DEFAULT_MAX_MISSING_FRAMES),
        };
        Ok(Self {
            video,
            detection,
            min_save_confidence: detection_file
                .min_save_confidence
                .unwrap_or(MIN_SAVE_CONFIDENCE),
            detector_backend: detection_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            recognizer_backend: detection_file.recognizer,
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            downstream: file.downstream,
            streams: file.streams.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("PLATEWATCH_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(fps) = std::env::var("PLATEWATCH_TARGET_FPS") {
            self.video.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("PLATEWATCH_TARGET_FPS must be a positive integer"))?;
        }
        if let Ok(size) = std::env::var("PLATEWATCH_QUEUE_SIZE") {
            self.video.max_queue_size = size
                .trim()
                .parse()
                .map_err(|_| anyhow!("PLATEWATCH_QUEUE_SIZE must be a positive integer"))?;
        }
        if let Ok(backend) = std::env::var("PLATEWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector_backend = backend.trim().to_string();
            }
        }
        if let Ok(target) = std::env::var("PLATEWATCH_DOWNSTREAM") {
            if !target.trim().is_empty() {
                self.downstream = Some(DownstreamTarget::parse(&target)?);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.video.max_queue_size == 0 {
            return Err(anyhow!("video_settings.max_queue_size must be at least 1"));
        }
        if self.video.target_fps == 0 {
            return Err(anyhow!("video_settings.target_fps must be at least 1"));
        }
        check_unit("detection.confidence_threshold", self.detection.confidence_threshold)?;
        check_unit("detection.min_save_confidence", self.min_save_confidence)?;
        if self.detection.location_threshold == 0 {
            return Err(anyhow!("detection.location_threshold_px must be at least 1"));
        }

        let mut seen = HashSet::new();
        for stream in &mut self.streams {
            stream.id = stream.id.trim().to_string();
            if stream.id.is_empty() {
                return Err(anyhow!("stream id must not be empty"));
            }
            if !seen.insert(stream.id.clone()) {
                return Err(anyhow!("duplicate stream id {}", stream.id));
            }
            stream.source = stream.source.trim().to_string();
            stream.detection_region = stream.detection_region.map(DetectionRegion::normalized);
        }
        Ok(())
    }

    /// Streams with the global downstream target filled in where a stream has none.
    pub fn resolved_streams(&self) -> Vec<StreamConfig> {
        self.streams
            .iter()
            .cloned()
            .map(|mut stream| {
                if stream.downstream.is_none() {
                    stream.downstream = self.downstream.clone();
                }
                stream
            })
            .collect()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings {
            buffer_capacity: self.video.max_queue_size,
            detection: self.detection.clone(),
            ..PipelineSettings::default()
        };
        settings.capture.target_fps = self.video.target_fps;
        settings.connection.target_fps = Some(self.video.target_fps);
        settings.connection.target_width = self.video.width;
        settings.connection.target_height = self.video.height;
        settings
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<PlateWatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_defaults_from_json() -> Result<()> {
        let stream: StreamConfig = serde_json::from_str(r#"{"id": "gate", "source": "rtsp://cam/1"}"#)?;
        assert!(stream.enabled);
        assert!(!stream.is_camera);
        assert!(stream.is_runnable());
        assert_eq!(stream.detection_region, None);
        Ok(())
    }

    #[test]
    fn restart_only_on_source_change() {
        let a = StreamConfig::new("gate", "rtsp://cam/1");
        let mut b = a.clone();
        b.detection_region = Some(DetectionRegion::new(0.2, 0.2, 0.8, 0.8));
        assert!(!a.needs_restart(&b));
        b.source = "rtsp://cam/2".into();
        assert!(a.needs_restart(&b));
        assert!(a.needs_restart(&StreamConfig::new("gate", "/dev/video0")));
    }

    #[test]
    fn validation_normalizes_regions_and_rejects_duplicates() -> Result<()> {
        let mut cfg = PlateWatchConfig::from_file(PlateWatchConfigFile::default())?;
        let mut stream = StreamConfig::new(" gate ", "stub://gate");
        stream.detection_region = Some(DetectionRegion {
            x1: 0.9,
            y1: 0.8,
            x2: 0.1,
            y2: 1.4,
            enabled: true,
        });
        cfg.streams = vec![stream];
        cfg.validate()?;
        assert_eq!(cfg.streams[0].id, "gate");
        let region = cfg.streams[0].detection_region.expect("region");
        assert_eq!((region.x1, region.y1, region.x2, region.y2), (0.1, 0.8, 0.9, 1.0));

        cfg.streams.push(StreamConfig::new("gate", "stub://other"));
        assert!(cfg.validate().is_err());
        Ok(())
    }

    #[test]
    fn thresholds_outside_unit_range_are_rejected() -> Result<()> {
        let mut cfg = PlateWatchConfig::from_file(PlateWatchConfigFile::default())?;
        cfg.detection.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
        Ok(())
    }

    #[test]
    fn global_downstream_fills_gaps() -> Result<()> {
        let mut cfg = PlateWatchConfig::from_file(PlateWatchConfigFile::default())?;
        cfg.downstream = Some(DownstreamTarget::new("10.0.0.2", 9000));
        let mut own = StreamConfig::new("b", "stub://b");
        own.downstream = Some(DownstreamTarget::new("10.0.0.3", 9001));
        cfg.streams = vec![StreamConfig::new("a", "stub://a"), own];
        let resolved = cfg.resolved_streams();
        assert_eq!(resolved[0].downstream, Some(DownstreamTarget::new("10.0.0.2", 9000)));
        assert_eq!(resolved[1].downstream, Some(DownstreamTarget::new("10.0.0.3", 9001)));
        Ok(())
    }
}
