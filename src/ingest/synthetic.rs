//! Synthetic `stub://` source.
//!
//! Query options:
//! - `width`, `height`: frame size (default 640x480)
//! - `frames`: stop after N frames, like a file reaching its end
//! - `fail_open`: every `open` fails
//! - `fail_after`: reads fail after N frames until the source is reopened
//! - `blank`: produce uniformly black frames (rejected by validation)

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

use super::{SourceRequest, VideoSource};
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq)]
struct SyntheticOptions {
    width: u32,
    height: u32,
    frames: Option<u64>,
    fail_open: bool,
    fail_after: Option<u64>,
    blank: bool,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frames: None,
            fail_open: false,
            fail_after: None,
            blank: false,
        }
    }
}

impl SyntheticOptions {
    fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).with_context(|| format!("invalid stub uri '{}'", uri))?;
        if url.scheme() != "stub" {
            bail!("synthetic source expects a stub:// uri, got '{}'", uri);
        }
        let mut options = Self::default();
        for (key, value) in url.query_pairs() {
            let number = || {
                value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("stub option '{}' expects a number, got '{}'", key, value))
            };
            match &*key {
                "width" => options.width = number()? as u32,
                "height" => options.height = number()? as u32,
                "frames" => options.frames = Some(number()?),
                "fail_after" => options.fail_after = Some(number()?),
                "fail_open" => options.fail_open = parse_flag(&value),
                "blank" => options.blank = parse_flag(&value),
                other => log::debug!("SyntheticSource: ignoring unknown option '{}'", other),
            }
        }
        if options.width == 0 || options.height == 0 {
            bail!("stub source dimensions must be positive");
        }
        Ok(options)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "" | "1" | "true" | "yes")
}

/// Generates a moving gradient so frames pass the blank and frozen checks.
pub struct SyntheticSource {
    uri: String,
    options: SyntheticOptions,
    open: bool,
    frame_count: u64,
    phase: u8,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            uri: String::new(),
            options: SyntheticOptions::default(),
            open: false,
            frame_count: 0,
            phase: 0,
        }
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.options.width as usize, self.options.height as usize);
        if self.options.blank {
            return vec![0; w * h * 3];
        }
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let base = (x + y + self.frame_count as usize + self.phase as usize) % 256;
                pixels.extend_from_slice(&[base as u8, (base / 2) as u8, (255 - base) as u8]);
            }
        }
        pixels
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSource for SyntheticSource {
    fn open(&mut self, request: &SourceRequest) -> Result<()> {
        let mut options = SyntheticOptions::parse(&request.uri)?;
        if options.fail_open {
            self.open = false;
            bail!("stub source '{}' refused to open", request.uri);
        }
        if let (Some(w), Some(h)) = (request.target_width, request.target_height) {
            // Explicit query options win over generic hints.
            if !request.uri.contains("width=") {
                options.width = w.max(1);
            }
            if !request.uri.contains("height=") {
                options.height = h.max(1);
            }
        }
        self.uri = request.uri.clone();
        self.options = options;
        self.frame_count = 0;
        self.phase = rand::random();
        self.open = true;
        log::info!("SyntheticSource: connected to {}", self.uri);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            bail!("stub source is not open");
        }
        if let Some(limit) = self.options.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        if let Some(limit) = self.options.fail_after {
            if self.frame_count >= limit {
                bail!("stub source '{}' dropped", self.uri);
            }
        }
        let pixels = self.render();
        self.frame_count += 1;
        Ok(Some(
            Frame::from_rgb(pixels, self.options.width, self.options.height)
                .with_sequence(self.frame_count),
        ))
    }

    fn close(&mut self) {
        if self.open {
            log::debug!("SyntheticSource: closed {}", self.uri);
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(uri: &str) -> Result<SyntheticSource> {
        let mut source = SyntheticSource::new();
        source.open(&SourceRequest::new(uri))?;
        Ok(source)
    }

    #[test]
    fn finite_stub_reaches_end_of_stream() -> Result<()> {
        let mut source = opened("stub://clip?width=8&height=8&frames=2")?;
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_none());
        Ok(())
    }

    #[test]
    fn frames_vary_between_reads() -> Result<()> {
        let mut source = opened("stub://cam?width=16&height=8")?;
        let a = source.read()?.expect("frame");
        let b = source.read()?.expect("frame");
        assert_ne!(a.pixels(), b.pixels());
        assert!(a.channel_stats().expect("stats").std_dev[0] > 1.0);
        Ok(())
    }

    #[test]
    fn failure_options() -> Result<()> {
        let mut source = SyntheticSource::new();
        assert!(source.open(&SourceRequest::new("stub://dead?fail_open=1")).is_err());
        assert!(!source.is_open());

        let mut flaky = opened("stub://flaky?width=4&height=4&fail_after=1")?;
        assert!(flaky.read()?.is_some());
        assert!(flaky.read().is_err());

        assert!(opened("stub://bad?width=abc").is_err());
        assert!(opened("stub://zero?width=0").is_err());
        Ok(())
    }

    #[test]
    fn read_before_open_fails() {
        assert!(SyntheticSource::new().read().is_err());
    }
}
