//! RTSP decode through GStreamer.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{SourceRequest, VideoSource};
use crate::frame::Frame;

pub(crate) struct GstreamerSource {
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    uri: String,
    target_fps: Option<u32>,
    frame_count: u64,
    eos: bool,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub(crate) fn new() -> Self {
        Self {
            pipeline: None,
            appsink: None,
            uri: String::new(),
            target_fps: None,
            frame_count: 0,
            eos: false,
            last_error: None,
        }
    }

    fn pipeline_description(request: &SourceRequest) -> String {
        let protocols = if request.prefer_tcp { " protocols=tcp" } else { "" };
        let mut caps = String::from("video/x-raw,format=RGB");
        if let (Some(w), Some(h)) = (request.target_width, request.target_height) {
            caps.push_str(&format!(",width={},height={}", w, h));
        }
        let scale = if caps.contains("width=") { " ! videoscale" } else { "" };
        format!(
            "rtspsrc location={}{} latency=0 ! decodebin ! videoconvert{} ! {} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            request.uri, protocols, scale, caps
        )
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = match self.target_fps {
            Some(fps) if fps > 0 => (1000 / fps).saturating_mul(4),
            _ => 500,
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => self.eos = true,
                _ => {}
            }
        }
    }
}

impl VideoSource for GstreamerSource {
    fn open(&mut self, request: &SourceRequest) -> Result<()> {
        self.close();
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&Self::pipeline_description(request))
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        self.uri = request.uri.clone();
        self.target_fps = request.target_fps;
        self.frame_count = 0;
        self.eos = false;
        self.last_error = None;
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        log::info!("GstreamerSource: connected to {}", self.uri);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }
        if self.eos {
            return Ok(None);
        }
        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let appsink = self.appsink.as_ref().context("gstreamer source is not open")?;
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            if appsink.is_eos() {
                self.eos = true;
                return Ok(None);
            }
            return Err(anyhow!("RTSP stream stalled"));
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Ok(Some(Frame::from_rgb(pixels, width, height).with_sequence(self.frame_count)))
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerSource: failed to stop pipeline for {}: {}", self.uri, err);
            }
            log::debug!("GstreamerSource: closed {}", self.uri);
        }
        self.appsink = None;
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
