//! File, RTSP and V4L2 decode through FFmpeg.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{camera_device_path, SourceRequest, VideoSource};
use crate::frame::Frame;

struct Decoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    flushed: bool,
}

pub(crate) struct FfmpegSource {
    inner: Option<Decoder>,
    uri: String,
    frame_count: u64,
}

impl FfmpegSource {
    pub(crate) fn new() -> Self {
        Self {
            inner: None,
            uri: String::new(),
            frame_count: 0,
        }
    }
}

impl VideoSource for FfmpegSource {
    fn open(&mut self, request: &SourceRequest) -> Result<()> {
        self.close();
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        if request.is_rtsp() && request.prefer_tcp {
            options.set("rtsp_transport", "tcp");
        }
        // Keep decoder-side buffering minimal for live sources.
        options.set("fflags", "nobuffer");
        if let Some(fps) = request.target_fps {
            options.set("framerate", &fps.to_string());
        }

        let path = camera_device_path(&request.uri).unwrap_or_else(|| request.uri.clone());
        let input = ffmpeg::format::input_with_dictionary(&path, options)
            .with_context(|| format!("failed to open '{}' with ffmpeg", request.uri))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", request.uri))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let out_width = request.target_width.unwrap_or(decoder.width());
        let out_height = request.target_height.unwrap_or(decoder.height());
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            out_width,
            out_height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        self.uri = request.uri.clone();
        self.frame_count = 0;
        self.inner = Some(Decoder {
            input,
            stream_index,
            decoder,
            scaler,
            flushed: false,
        });
        log::info!("FfmpegSource: connected to {}", self.uri);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let inner = self.inner.as_mut().context("ffmpeg source is not open")?;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb = ffmpeg::frame::Video::empty();

        loop {
            if inner.decoder.receive_frame(&mut decoded).is_ok() {
                inner
                    .scaler
                    .run(&decoded, &mut rgb)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb)?;
                self.frame_count += 1;
                return Ok(Some(
                    Frame::from_rgb(pixels, width, height).with_sequence(self.frame_count),
                ));
            }
            if inner.flushed {
                return Ok(None);
            }
            match inner.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != inner.stream_index {
                        continue;
                    }
                    inner
                        .decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    inner.decoder.send_eof().context("flush ffmpeg decoder")?;
                    inner.flushed = true;
                }
            }
        }
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::debug!("FfmpegSource: closed {}", self.uri);
        }
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
