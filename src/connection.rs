//! Connection state machine for one unreliable video source.
//!
//! `StreamConnection` owns at most one open `VideoSource`. It adds what raw decoders lack:
//! bounded connect retries, validation of every decoded frame, bounded per-read retries
//! with exponential backoff, and a one-shot bridge with the last good frame when a read
//! keeps failing.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::frame::Frame;
use crate::ingest::{SourceFactory, SourceRequest, VideoSource};

/// Retry budget and open hints for a `StreamConnection`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionPolicy {
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub read_attempts: u32,
    /// First read retry delay; doubled for every further retry.
    pub read_backoff: Duration,
    pub prefer_tcp: bool,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub target_fps: Option<u32>,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(1),
            read_attempts: 5,
            read_backoff: Duration::from_millis(100),
            prefer_tcp: true,
            target_width: None,
            target_height: None,
            target_fps: None,
        }
    }
}

impl ConnectionPolicy {
    fn request(&self, uri: &str) -> SourceRequest {
        SourceRequest {
            uri: uri.to_string(),
            prefer_tcp: self.prefer_tcp,
            target_width: self.target_width,
            target_height: self.target_height,
            target_fps: self.target_fps,
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.read_backoff
            .saturating_mul(1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX))
    }
}

/// Why a decoded frame was refused.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum FrameRejection {
    #[error("empty frame")]
    Empty,
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("frame holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("corrupt decode")]
    CorruptDecode,
    #[error("blank frame")]
    Blank,
    #[error("frozen frame")]
    Frozen,
}

const BLANK_LOW: f64 = 10.0;
const BLANK_HIGH: f64 = 245.0;
const FROZEN_STD_DEV: f64 = 1.0;

/// Reject empty, malformed, uniformly black/white and zero-variance frames.
pub fn validate_frame(frame: &Frame) -> Result<(), FrameRejection> {
    if frame.is_empty() {
        return Err(FrameRejection::Empty);
    }
    if frame.width == 0 || frame.height == 0 {
        return Err(FrameRejection::InvalidDimensions {
            width: frame.width,
            height: frame.height,
        });
    }
    if frame.pixels().len() != frame.expected_len() {
        return Err(FrameRejection::SizeMismatch {
            expected: frame.expected_len(),
            actual: frame.pixels().len(),
        });
    }
    let stats = frame.channel_stats().ok_or(FrameRejection::CorruptDecode)?;
    if stats
        .mean
        .iter()
        .any(|m| !m.is_finite() || *m < 0.0 || *m > 255.0)
    {
        return Err(FrameRejection::CorruptDecode);
    }
    if stats.mean.iter().all(|m| *m < BLANK_LOW) || stats.mean.iter().all(|m| *m > BLANK_HIGH) {
        return Err(FrameRejection::Blank);
    }
    if stats.std_dev.iter().all(|s| *s < FROZEN_STD_DEV) {
        return Err(FrameRejection::Frozen);
    }
    Ok(())
}

/// Result of one `read_frame` call.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// A finite source has no more frames. Not an error.
    EndOfStream,
    /// The read budget is exhausted; the caller decides whether to reconnect.
    Failed(String),
}

pub struct StreamConnection {
    stream_id: String,
    factory: Arc<dyn SourceFactory>,
    policy: ConnectionPolicy,
    cancel: CancelToken,
    source: Option<Box<dyn VideoSource>>,
    uri: Option<String>,
    /// First frame read and validated during `connect`, returned by the next read.
    pending: Option<Frame>,
    last_good: Option<Frame>,
    bridged: bool,
}

impl StreamConnection {
    pub fn new(
        stream_id: impl Into<String>,
        factory: Arc<dyn SourceFactory>,
        policy: ConnectionPolicy,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            factory,
            policy,
            cancel: CancelToken::new(),
            source: None,
            uri: None,
            pending: None,
            last_good: None,
            bridged: false,
        }
    }

    /// Retry delays end early once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// URI of the last `connect` call.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Open `uri`, retrying up to the policy's budget.
    ///
    /// Every attempt builds a fresh source, opens it and must decode one valid frame.
    /// Returns `false` once the budget is spent, leaving the connection closed.
    pub fn connect(&mut self, uri: &str) -> bool {
        self.disconnect();
        self.uri = Some(uri.to_string());
        let attempts = self.policy.connect_attempts.max(1);

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            log::info!(
                "StreamConnection[{}]: connecting to {} (attempt {}/{})",
                self.stream_id,
                uri,
                attempt,
                attempts
            );
            match self.open_and_prime(uri) {
                Ok(()) => {
                    log::info!("StreamConnection[{}]: connected", self.stream_id);
                    return true;
                }
                Err(err) => {
                    log::warn!(
                        "StreamConnection[{}]: attempt {}/{} failed: {:#}",
                        self.stream_id,
                        attempt,
                        attempts,
                        err
                    );
                    self.close_source();
                }
            }
            if attempt < attempts && self.cancel.sleep(self.policy.connect_retry_delay) {
                break;
            }
        }

        log::error!(
            "StreamConnection[{}]: giving up on {} after {} attempts",
            self.stream_id,
            uri,
            attempts
        );
        self.disconnect();
        false
    }

    /// Reconnect to the last URI.
    pub fn reconnect(&mut self) -> bool {
        match self.uri.clone() {
            Some(uri) => self.connect(&uri),
            None => false,
        }
    }

    fn open_and_prime(&mut self, uri: &str) -> anyhow::Result<()> {
        let mut source = self.factory.create(uri)?;
        source.open(&self.policy.request(uri))?;
        // Store the source before reading so a failure still closes it.
        let source = self.source.insert(source);
        let frame = source
            .read()?
            .ok_or_else(|| anyhow::anyhow!("source ended before the first frame"))?;
        validate_frame(&frame)?;
        self.last_good = Some(frame.clone());
        self.bridged = false;
        self.pending = Some(frame);
        Ok(())
    }

    /// Read one validated frame.
    ///
    /// Transient failures are retried with exponential backoff. When the budget runs out
    /// the last good frame is returned once before `Failed` is reported.
    pub fn read_frame(&mut self) -> ReadOutcome {
        if let Some(frame) = self.pending.take() {
            return ReadOutcome::Frame(frame);
        }
        let Some(source) = self.source.as_mut() else {
            return ReadOutcome::Failed("not connected".to_string());
        };

        let attempts = self.policy.read_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 && self.cancel.sleep(self.policy.backoff(attempt)) {
                return ReadOutcome::Failed("cancelled".to_string());
            }
            match source.read() {
                Ok(Some(frame)) => match validate_frame(&frame) {
                    Ok(()) => {
                        self.last_good = Some(frame.clone());
                        self.bridged = false;
                        return ReadOutcome::Frame(frame);
                    }
                    Err(rejection) => last_error = format!("invalid frame: {}", rejection),
                },
                Ok(None) => return ReadOutcome::EndOfStream,
                Err(err) => last_error = format!("{:#}", err),
            }
            log::debug!(
                "StreamConnection[{}]: read attempt {}/{} failed: {}",
                self.stream_id,
                attempt + 1,
                attempts,
                last_error
            );
        }

        if !self.bridged {
            if let Some(frame) = self.last_good.clone() {
                self.bridged = true;
                log::warn!(
                    "StreamConnection[{}]: {}; reusing last good frame",
                    self.stream_id,
                    last_error
                );
                return ReadOutcome::Frame(frame);
            }
        }
        ReadOutcome::Failed(last_error)
    }

    fn close_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        self.pending = None;
    }

    /// Release the source. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.source.is_some() {
            log::info!("StreamConnection[{}]: disconnected", self.stream_id);
        }
        self.close_source();
        self.last_good = None;
        self.bridged = false;
    }

    pub fn is_opened(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_open())
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted sources for connection, capture and supervisor tests.

    use super::*;
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) enum Step {
        Frame(Frame),
        End,
        Fail,
    }

    pub(crate) fn good_frame(seed: u8) -> Frame {
        let mut data = Vec::with_capacity(8 * 8 * 3);
        for i in 0..64u8 {
            data.extend_from_slice(&[seed.wrapping_add(i), 100, 200u8.wrapping_sub(i)]);
        }
        Frame::from_rgb(data, 8, 8)
    }

    pub(crate) struct ScriptedSource {
        steps: VecDeque<Step>,
        open_fails: bool,
        open: bool,
    }

    impl VideoSource for ScriptedSource {
        fn open(&mut self, _request: &SourceRequest) -> Result<()> {
            if self.open_fails {
                return Err(anyhow!("refused"));
            }
            self.open = true;
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            match self.steps.pop_front() {
                Some(Step::Frame(frame)) => Ok(Some(frame)),
                Some(Step::End) => Ok(None),
                Some(Step::Fail) | None => Err(anyhow!("read failed")),
            }
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// Hands out one scripted source per `create` call; a missing script refuses to open.
    #[derive(Default)]
    pub(crate) struct ScriptedFactory {
        scripts: Mutex<VecDeque<Option<Vec<Step>>>>,
        pub(crate) created: AtomicUsize,
    }

    impl ScriptedFactory {
        pub(crate) fn new(scripts: Vec<Option<Vec<Step>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                created: AtomicUsize::new(0),
            })
        }
    }

    impl SourceFactory for ScriptedFactory {
        fn create(&self, _uri: &str) -> Result<Box<dyn VideoSource>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .map_err(|_| anyhow!("script lock poisoned"))?
                .pop_front()
                .flatten();
            Ok(Box::new(ScriptedSource {
                open_fails: script.is_none(),
                steps: script.unwrap_or_default().into_iter().collect(),
                open: false,
            }))
        }
    }

    pub(crate) fn fast_policy() -> ConnectionPolicy {
        ConnectionPolicy {
            connect_retry_delay: Duration::from_millis(1),
            read_backoff: Duration::from_millis(1),
            ..ConnectionPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    fn empty_frame() -> Frame {
        Frame::from_rgb(Vec::new(), 0, 0)
    }

    #[test]
    fn validation_rejects_degenerate_frames() {
        assert_eq!(validate_frame(&empty_frame()), Err(FrameRejection::Empty));
        assert_eq!(
            validate_frame(&Frame::from_rgb(vec![1; 12], 2, 3)),
            Err(FrameRejection::SizeMismatch {
                expected: 18,
                actual: 12
            })
        );
        assert_eq!(
            validate_frame(&Frame::from_rgb(vec![3; 48], 4, 4)),
            Err(FrameRejection::Blank)
        );
        assert_eq!(
            validate_frame(&Frame::from_rgb(vec![250; 48], 4, 4)),
            Err(FrameRejection::Blank)
        );
        assert_eq!(
            validate_frame(&Frame::from_rgb([90, 120, 60].repeat(16), 4, 4)),
            Err(FrameRejection::Frozen)
        );
        assert_eq!(validate_frame(&good_frame(7)), Ok(()));
    }

    #[test]
    fn connect_fails_after_three_empty_frames() {
        let factory = ScriptedFactory::new(vec![
            Some(vec![Step::Frame(empty_frame())]),
            Some(vec![Step::Frame(empty_frame())]),
            Some(vec![Step::Frame(empty_frame())]),
        ]);
        let mut conn = StreamConnection::new("cam", factory.clone(), fast_policy());
        assert!(!conn.connect("stub://cam"));
        assert!(!conn.is_opened());
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn connect_retries_until_source_opens() {
        let factory = ScriptedFactory::new(vec![
            None,
            Some(vec![Step::Frame(good_frame(1)), Step::Frame(good_frame(2))]),
        ]);
        let mut conn = StreamConnection::new("cam", factory, fast_policy());
        assert!(conn.connect("stub://cam"));
        assert!(conn.is_opened());

        // The priming frame comes first.
        match conn.read_frame() {
            ReadOutcome::Frame(frame) => assert_eq!(frame.pixels()[0], 1),
            other => panic!("unexpected {:?}", other),
        }
        match conn.read_frame() {
            ReadOutcome::Frame(frame) => assert_eq!(frame.pixels()[0], 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn read_bridges_once_then_fails() {
        let factory = ScriptedFactory::new(vec![Some(vec![Step::Frame(good_frame(9))])]);
        let mut conn = StreamConnection::new("cam", factory, fast_policy());
        assert!(conn.connect("stub://cam"));
        assert!(matches!(conn.read_frame(), ReadOutcome::Frame(_)));

        // Script exhausted: every read fails.
        match conn.read_frame() {
            ReadOutcome::Frame(frame) => assert_eq!(frame.pixels()[0], 9),
            other => panic!("expected bridge frame, got {:?}", other),
        }
        assert!(matches!(conn.read_frame(), ReadOutcome::Failed(_)));
    }

    #[test]
    fn read_recovers_after_transient_failures() {
        let factory = ScriptedFactory::new(vec![Some(vec![
            Step::Frame(good_frame(1)),
            Step::Fail,
            Step::Frame(empty_frame()),
            Step::Frame(good_frame(4)),
        ])]);
        let mut conn = StreamConnection::new("cam", factory, fast_policy());
        assert!(conn.connect("stub://cam"));
        conn.read_frame();
        match conn.read_frame() {
            ReadOutcome::Frame(frame) => assert_eq!(frame.pixels()[0], 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn end_of_stream_is_reported() {
        let factory =
            ScriptedFactory::new(vec![Some(vec![Step::Frame(good_frame(1)), Step::End])]);
        let mut conn = StreamConnection::new("clip", factory, fast_policy());
        assert!(conn.connect("clip.mp4"));
        conn.read_frame();
        assert!(matches!(conn.read_frame(), ReadOutcome::EndOfStream));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let factory = ScriptedFactory::new(vec![Some(vec![Step::Frame(good_frame(1))])]);
        let mut conn = StreamConnection::new("cam", factory, fast_policy());
        assert!(conn.connect("stub://cam"));
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_opened());
        assert!(matches!(conn.read_frame(), ReadOutcome::Failed(_)));
    }

    #[test]
    fn cancelled_connect_stops_early() {
        let factory = ScriptedFactory::new(vec![None, None, None]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut conn = StreamConnection::new("cam", factory.clone(), ConnectionPolicy::default())
            .with_cancel(cancel);
        assert!(!conn.connect("stub://cam"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles() {
        let policy = ConnectionPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
    }
}
