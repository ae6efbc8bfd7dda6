//! Annotated copies of frames for the display sink.
//!
//! Boxes and the region border are drawn into a copy of the frame. Text is carried as
//! positioned `OverlayLabel`s; rendering glyphs is left to whatever presents the frame.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::time::SystemTime;

use crate::detect::Detection;
use crate::frame::Frame;
use crate::geometry::{BoundingBox, DetectionRegion};

pub const DETECTION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const REGION_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
const LABEL_HEIGHT: i32 = 20;
const LABEL_CHAR_WIDTH: u32 = 9;
const BOX_THICKNESS: i32 = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayLabel {
    pub text: String,
    /// Baseline-left anchor in image pixels.
    pub x: i32,
    pub y: i32,
    pub color: [u8; 3],
}

#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub stream_id: String,
    pub image: RgbImage,
    pub labels: Vec<OverlayLabel>,
    pub captured_at: SystemTime,
    pub sequence: u64,
}

/// Draw a box `BOX_THICKNESS` pixels wide, clipped to the image.
pub(crate) fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let Some(clipped) = bbox.clamp_to(image.width(), image.height()) else {
        return;
    };
    for inset in 0..BOX_THICKNESS {
        let w = clipped.width() as i32 - 2 * inset;
        let h = clipped.height() as i32 - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(clipped.x1 + inset, clipped.y1 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

pub struct Annotator {
    image: RgbImage,
    labels: Vec<OverlayLabel>,
    captured_at: SystemTime,
    sequence: u64,
}

impl Annotator {
    /// Start from a copy of `frame`. `None` if the frame's pixels do not match its size.
    pub fn new(frame: &Frame) -> Option<Self> {
        Some(Self {
            image: frame.to_image()?,
            labels: Vec::new(),
            captured_at: frame.captured_at(),
            sequence: frame.sequence(),
        })
    }

    pub fn region(&mut self, region: &DetectionRegion) {
        let rect = region.to_pixels(self.image.width(), self.image.height());
        draw_box(&mut self.image, &rect, REGION_COLOR);
    }

    /// Box plus a `License Plate 0.87` label on a filled background above it.
    pub fn detection(&mut self, detection: &Detection) {
        let bbox = detection.bbox;
        draw_box(&mut self.image, &bbox, DETECTION_COLOR);

        let text = format!("License Plate {:.2}", detection.confidence);
        let top = (bbox.y1 - LABEL_HEIGHT).max(0);
        let width = (text.len() as u32 * LABEL_CHAR_WIDTH).min(self.image.width());
        if width > 0 && top < self.image.height() as i32 {
            let background = Rect::at(bbox.x1.max(0), top).of_size(width, LABEL_HEIGHT as u32);
            draw_filled_rect_mut(&mut self.image, background, DETECTION_COLOR);
        }
        self.labels.push(OverlayLabel {
            text,
            x: bbox.x1,
            y: (bbox.y1 - 5).max(LABEL_HEIGHT - 5),
            color: [0, 0, 0],
        });
    }

    /// `Plate: AB12CD (Conf: 0.91)` below the detection box.
    pub fn plate_text(&mut self, bbox: &BoundingBox, text: &str, confidence: f32) {
        self.labels.push(OverlayLabel {
            text: format!("Plate: {} (Conf: {:.2})", text, confidence),
            x: bbox.x1,
            y: bbox.y2 + 25,
            color: DETECTION_COLOR.0,
        });
    }

    pub fn finish(self, stream_id: &str) -> AnnotatedFrame {
        AnnotatedFrame {
            stream_id: stream_id.to_string(),
            image: self.image,
            labels: self.labels,
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }
}

/// One-way, non-blocking hand-off of annotated frames. Drops frames when full.
#[derive(Clone, Default)]
pub struct DisplaySink {
    tx: Option<Sender<AnnotatedFrame>>,
}

impl DisplaySink {
    pub fn channel(capacity: usize) -> (Self, Receiver<AnnotatedFrame>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Returns `false` when the frame was dropped.
    pub fn push(&self, frame: AnnotatedFrame) -> bool {
        match &self.tx {
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }
}
