//! Capture loop: drives a `StreamConnection` at a bounded rate and feeds the frame buffer.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::connection::{ReadOutcome, StreamConnection};
use crate::frame::FrameBuffer;
use crate::status::{StatusReporter, StreamStatus};

pub const DEFAULT_TARGET_FPS: u32 = 30;

#[derive(Clone, Debug, PartialEq)]
pub struct CapturePolicy {
    pub target_fps: u32,
    /// Live cameras run unthrottled and consume frames as they arrive.
    pub rate_limit: bool,
    pub max_consecutive_errors: u32,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            rate_limit: true,
            max_consecutive_errors: 5,
            reconnect_delay: Duration::from_secs(2),
            reconnect_attempts: 3,
        }
    }
}

impl CapturePolicy {
    fn frame_interval(&self) -> Option<Duration> {
        (self.rate_limit && self.target_fps > 0)
            .then(|| Duration::from_secs_f64(1.0 / self.target_fps as f64))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CaptureExit {
    Cancelled,
    /// A finite source played to its end.
    EndOfStream,
    /// Reconnection budget exhausted; carries the last read error.
    ReconnectFailed(String),
}

/// What a finished capture thread hands back to its supervisor.
pub struct CaptureReport {
    /// Returned so the supervisor can reconnect or disconnect it.
    pub connection: StreamConnection,
    pub exit: CaptureExit,
    pub frames_captured: u64,
    pub frames_dropped: u64,
}

pub struct CaptureLoop {
    connection: StreamConnection,
    buffer: FrameBuffer,
    policy: CapturePolicy,
    cancel: CancelToken,
    status: StatusReporter,
    frames_captured: u64,
    frames_dropped: u64,
}

impl CaptureLoop {
    /// `connection` is expected to be connected already.
    pub fn new(
        mut connection: StreamConnection,
        buffer: FrameBuffer,
        policy: CapturePolicy,
        cancel: CancelToken,
        status: StatusReporter,
    ) -> Self {
        connection.set_cancel_token(cancel.clone());
        Self {
            connection,
            buffer,
            policy,
            cancel,
            status,
            frames_captured: 0,
            frames_dropped: 0,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<CaptureReport>> {
        std::thread::Builder::new()
            .name(format!("capture-{}", self.status.stream_id()))
            .spawn(move || self.run())
            .context("spawn capture thread")
    }

    pub fn run(mut self) -> CaptureReport {
        let interval = self.policy.frame_interval();
        let mut consecutive_errors = 0u32;
        log::debug!(
            "CaptureLoop[{}]: started (interval {:?})",
            self.status.stream_id(),
            interval
        );

        let exit = loop {
            if self.cancel.is_cancelled() {
                break CaptureExit::Cancelled;
            }
            let started = Instant::now();
            match self.connection.read_frame() {
                ReadOutcome::Frame(frame) => {
                    consecutive_errors = 0;
                    self.frames_captured += 1;
                    if !self.buffer.push(frame) {
                        self.frames_dropped += 1;
                        log::trace!("CaptureLoop[{}]: buffer full", self.status.stream_id());
                    }
                    if let Some(interval) = interval {
                        let remaining = interval.saturating_sub(started.elapsed());
                        if self.cancel.sleep(remaining) {
                            break CaptureExit::Cancelled;
                        }
                    }
                }
                ReadOutcome::EndOfStream => {
                    log::info!(
                        "CaptureLoop[{}]: end of stream after {} frames",
                        self.status.stream_id(),
                        self.frames_captured
                    );
                    break CaptureExit::EndOfStream;
                }
                ReadOutcome::Failed(reason) => {
                    if self.cancel.is_cancelled() {
                        break CaptureExit::Cancelled;
                    }
                    consecutive_errors += 1;
                    log::warn!(
                        "CaptureLoop[{}]: read failed ({}/{}): {}",
                        self.status.stream_id(),
                        consecutive_errors,
                        self.policy.max_consecutive_errors,
                        reason
                    );
                    if consecutive_errors >= self.policy.max_consecutive_errors.max(1) {
                        match self.reconnect(reason) {
                            Ok(()) => consecutive_errors = 0,
                            Err(exit) => break exit,
                        }
                    }
                }
            }
        };

        log::debug!(
            "CaptureLoop[{}]: exiting ({:?}, {} captured, {} dropped)",
            self.status.stream_id(),
            exit,
            self.frames_captured,
            self.frames_dropped
        );
        CaptureReport {
            connection: self.connection,
            exit,
            frames_captured: self.frames_captured,
            frames_dropped: self.frames_dropped,
        }
    }

    fn reconnect(&mut self, reason: String) -> Result<(), CaptureExit> {
        self.connection.disconnect();
        let max = self.policy.reconnect_attempts.max(1);
        for attempt in 1..=max {
            self.status.report(StreamStatus::Retrying { attempt, max });
            if self.cancel.sleep(self.policy.reconnect_delay) {
                return Err(CaptureExit::Cancelled);
            }
            if self.connection.reconnect() {
                self.status.report(StreamStatus::Running);
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(CaptureExit::Cancelled);
            }
        }
        Err(CaptureExit::ReconnectFailed(reason))
    }
}
