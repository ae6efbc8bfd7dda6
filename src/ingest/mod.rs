//! Video sources.
//!
//! - `stub://` synthetic source (always available, used by tests and demos)
//! - RTSP through GStreamer (feature: rtsp-gstreamer)
//! - Files and RTSP through FFmpeg (feature: ingest-ffmpeg)
//!
//! Sources only decode. Validation, retries and reconnection live in
//! `connection::StreamConnection`.

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod gstreamer;
pub mod synthetic;

use anyhow::Result;

use crate::frame::Frame;

pub use synthetic::SyntheticSource;

/// Open-time hints passed to a source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceRequest {
    pub uri: String,
    /// Ask RTSP backends for interleaved TCP transport instead of UDP.
    pub prefer_tcp: bool,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub target_fps: Option<u32>,
}

impl SourceRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            prefer_tcp: true,
            target_width: None,
            target_height: None,
            target_fps: None,
        }
    }

    pub fn is_rtsp(&self) -> bool {
        let lower = self.uri.to_ascii_lowercase();
        lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
    }
}

/// A decoder for one video source.
pub trait VideoSource: Send {
    /// Open the source. Calling `open` on an open source reopens it.
    fn open(&mut self, request: &SourceRequest) -> Result<()>;

    /// Decode the next frame. `Ok(None)` means a finite source reached its end.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the handle. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Builds an unopened source for a URI.
pub trait SourceFactory: Send + Sync {
    fn create(&self, uri: &str) -> Result<Box<dyn VideoSource>>;
}

/// Picks a backend from the URI scheme and the enabled features.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn create(&self, uri: &str) -> Result<Box<dyn VideoSource>> {
        if uri.starts_with("stub://") {
            return Ok(Box::new(SyntheticSource::new()));
        }
        let request = SourceRequest::new(uri);
        if request.is_rtsp() {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                return Ok(Box::new(gstreamer::GstreamerSource::new()));
            }
        }
        #[cfg(feature = "ingest-ffmpeg")]
        {
            Ok(Box::new(ffmpeg::FfmpegSource::new()))
        }
        #[cfg(not(feature = "ingest-ffmpeg"))]
        {
            if request.is_rtsp() {
                anyhow::bail!(
                    "RTSP source '{}' requires the rtsp-gstreamer or ingest-ffmpeg feature",
                    uri
                )
            }
            anyhow::bail!("source '{}' requires the ingest-ffmpeg feature", uri)
        }
    }
}

/// Live local devices: `device://N`, `/dev/videoN` or a bare camera index.
pub fn is_camera_uri(uri: &str) -> bool {
    uri.starts_with("device://")
        || uri.starts_with("/dev/video")
        || (!uri.is_empty() && uri.chars().all(|c| c.is_ascii_digit()))
}

/// Path of the device node behind a camera URI.
pub fn camera_device_path(uri: &str) -> Option<String> {
    if let Some(rest) = uri.strip_prefix("device://") {
        return Some(format!("/dev/video{}", rest));
    }
    if uri.starts_with("/dev/video") {
        return Some(uri.to_string());
    }
    (!uri.is_empty() && uri.chars().all(|c| c.is_ascii_digit()))
        .then(|| format!("/dev/video{}", uri))
}
