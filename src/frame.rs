//! Frames and the bounded per-stream frame buffer.
//!
//! - `Frame`: RGB24 pixel buffer plus capture time. Pixels are private and never
//!   mutated after construction; annotation works on a copy.
//! - `FrameBuffer`: bounded single-producer/single-consumer queue between the
//!   capture and processing loops. `push` never blocks and drops the incoming
//!   frame when full; `pop` waits up to a timeout.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::geometry::BoundingBox;

/// Default number of frames a stream may queue between capture and processing.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16;

/// How long the processing loop waits for a frame before re-checking cancellation.
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(1);

pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured picture.
///
/// A frame moves by value from the capture loop through the `FrameBuffer` to the
/// processing loop. Pixels are immutable once captured, so a clone shares them instead
/// of copying; the connection keeps such a clone as its last good frame.
#[derive(Clone)]
pub struct Frame {
    /// Row-major RGB24 pixels.
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    sequence: u64,
    captured_at: SystemTime,
    capture_instant: Instant,
}

impl Frame {
    /// Wrap raw RGB24 pixels. Size is not checked here; sources hand frames to
    /// `connection::validate_frame` before anything downstream sees them.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            sequence: 0,
            captured_at: SystemTime::now(),
            capture_instant: Instant::now(),
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::from_rgb(image.into_raw(), width, height)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte length a frame of these dimensions should have.
    pub fn expected_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * CHANNELS
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.capture_instant.elapsed()
    }

    /// Copy out the pixels inside `rect` (clipped to the frame).
    pub fn crop(&self, rect: &BoundingBox) -> Option<Frame> {
        if self.data.len() != self.expected_len() {
            return None;
        }
        let rect = rect.clamp_to(self.width, self.height)?;
        let row_bytes = self.width as usize * CHANNELS;
        let (x1, x2) = (rect.x1 as usize * CHANNELS, rect.x2 as usize * CHANNELS);
        let mut data = Vec::with_capacity((x2 - x1) * rect.height() as usize);
        for row in rect.y1 as usize..rect.y2 as usize {
            let start = row * row_bytes;
            data.extend_from_slice(&self.data[start + x1..start + x2]);
        }
        Some(Self {
            data: data.into(),
            width: rect.width(),
            height: rect.height(),
            sequence: self.sequence,
            captured_at: self.captured_at,
            capture_instant: self.capture_instant,
        })
    }

    /// Copy into an `RgbImage` for drawing or encoding.
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.to_vec())
    }

    /// Per-channel mean and standard deviation. `None` for empty or truncated frames.
    pub fn channel_stats(&self) -> Option<ChannelStats> {
        if self.data.is_empty() || self.data.len() != self.expected_len() {
            return None;
        }
        let mut sum = [0f64; CHANNELS];
        let mut sum_sq = [0f64; CHANNELS];
        for px in self.data.chunks_exact(CHANNELS) {
            for c in 0..CHANNELS {
                let v = px[c] as f64;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
        }
        let n = (self.data.len() / CHANNELS) as f64;
        let mut stats = ChannelStats::default();
        for c in 0..CHANNELS {
            let mean = sum[c] / n;
            stats.mean[c] = mean;
            stats.std_dev[c] = (sum_sq[c] / n - mean * mean).max(0.0).sqrt();
        }
        Some(stats)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelStats {
    pub mean: [f64; CHANNELS],
    pub std_dev: [f64; CHANNELS],
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Bounded frame queue shared by one capture loop and one processing loop.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct FrameBuffer {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without blocking. A full buffer keeps its contents and drops `frame`.
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Wait up to `timeout` for the oldest queued frame.
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Discard everything queued. Returns how many frames were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames rejected by `push` because the buffer was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(sequence: u64) -> Frame {
        Frame::from_rgb(vec![sequence as u8; 4 * 4 * 3], 4, 4).with_sequence(sequence)
    }

    #[test]
    fn clones_share_pixels() {
        let frame = tagged(3);
        let copy = frame.clone();
        assert_eq!(frame.pixels().as_ptr(), copy.pixels().as_ptr());
        assert_eq!(copy.sequence(), 3);
    }

    #[test]
    fn full_buffer_drops_incoming_frame() {
        let buffer = FrameBuffer::new(2);
        assert!(buffer.push(tagged(1)));
        assert!(buffer.push(tagged(2)));
        assert!(!buffer.push(tagged(3)));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped_frames(), 1);
        let a = buffer.try_pop().unwrap();
        let b = buffer.try_pop().unwrap();
        assert_eq!((a.sequence(), b.sequence()), (1, 2));
        assert!(buffer.try_pop().is_none());
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let buffer = FrameBuffer::new(5);
        for i in 0..50 {
            buffer.push(tagged(i));
            assert!(buffer.len() <= buffer.capacity());
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.dropped_frames(), 45);
    }

    #[test]
    fn pop_times_out_on_empty_buffer() {
        let buffer = FrameBuffer::new(1);
        let started = Instant::now();
        assert!(buffer.pop(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn drain_empties_buffer() {
        let buffer = FrameBuffer::new(4);
        for i in 0..3 {
            buffer.push(tagged(i));
        }
        assert_eq!(buffer.drain(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn crop_copies_requested_rows() {
        let mut data = Vec::new();
        for y in 0..4u8 {
            for x in 0..4u8 {
                data.extend_from_slice(&[x, y, 0]);
            }
        }
        let frame = Frame::from_rgb(data, 4, 4);
        let crop = frame.crop(&BoundingBox::new(1, 2, 3, 4)).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.pixels(), &[1, 2, 0, 2, 2, 0, 1, 3, 0, 2, 3, 0]);
        assert!(frame.crop(&BoundingBox::new(5, 5, 9, 9)).is_none());
    }

    #[test]
    fn channel_stats_of_uniform_frame() {
        let frame = Frame::from_rgb([10u8, 20, 30].repeat(16), 4, 4);
        let stats = frame.channel_stats().unwrap();
        assert_eq!(stats.mean, [10.0, 20.0, 30.0]);
        assert!(stats.std_dev.iter().all(|s| *s < 1e-9));
        assert!(Frame::from_rgb(vec![], 4, 4).channel_stats().is_none());
    }
}
