//! One supervisor per configured stream.
//!
//! `start` returns immediately; a monitor thread connects, runs the capture and processing
//! loops over a fresh frame buffer, and polls their liveness. A dead capture loop gets a
//! bounded number of full reconnect-and-restart attempts. A dead processing loop is a bug
//! and ends the stream in `Error`.

use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::annotate::DisplaySink;
use crate::cancel::{join_within, CancelToken};
use crate::capture::{CaptureExit, CaptureLoop, CapturePolicy, CaptureReport};
use crate::config::StreamConfig;
use crate::connection::{ConnectionPolicy, StreamConnection};
use crate::detect::{DetectorFactory, RecognizerFactory};
use crate::frame::{FrameBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_POP_TIMEOUT};
use crate::ingest::SourceFactory;
use crate::plates::PlateArchive;
use crate::processing::{
    DetectionSettings, FrameProcessor, LiveSettings, ProcessingLoop, ProcessingReport,
    SharedSettings,
};
use crate::status::{EventSink, StatusReporter, StreamStatus};
use crate::transport::DownstreamDispatcher;

/// Timing and policy shared by every stream of a fleet.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub buffer_capacity: usize,
    pub connection: ConnectionPolicy,
    pub capture: CapturePolicy,
    pub detection: DetectionSettings,
    pub monitor_interval: Duration,
    pub join_timeout: Duration,
    pub pop_timeout: Duration,
    /// Full reconnect-and-restart attempts after the capture loop gives up.
    pub capture_restarts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            connection: ConnectionPolicy::default(),
            capture: CapturePolicy::default(),
            detection: DetectionSettings::default(),
            monitor_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(1),
            pop_timeout: DEFAULT_POP_TIMEOUT,
            capture_restarts: 1,
        }
    }
}

/// Collaborators shared by all streams.
#[derive(Clone)]
pub struct StreamServices {
    pub sources: Arc<dyn SourceFactory>,
    pub detector: DetectorFactory,
    pub recognizer: RecognizerFactory,
    pub archive: Arc<PlateArchive>,
    pub downstream: Option<Arc<DownstreamDispatcher>>,
    pub display: DisplaySink,
    pub events: EventSink,
}

pub struct StreamSupervisor {
    config: StreamConfig,
    settings: PipelineSettings,
    services: StreamServices,
    live: SharedSettings,
    status: StatusReporter,
    cancel: CancelToken,
    buffer: FrameBuffer,
    monitor: Option<JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn new(config: StreamConfig, settings: PipelineSettings, services: StreamServices) -> Self {
        let status = StatusReporter::new(&config.id, services.events.clone());
        let live = Arc::new(std::sync::RwLock::new(LiveSettings {
            region: config.detection_region,
            downstream: config.downstream.clone(),
        }));
        Self {
            buffer: FrameBuffer::new(settings.buffer_capacity),
            config,
            settings,
            services,
            live,
            status,
            cancel: CancelToken::new(),
            monitor: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawn the monitor thread. No-op while it is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(old) = self.monitor.take() {
            join_within(old, self.settings.join_timeout, "StreamSupervisor monitor");
        }
        self.cancel = CancelToken::new();
        self.buffer = FrameBuffer::new(self.settings.buffer_capacity);
        self.status.report(StreamStatus::Connecting);

        let monitor = Monitor {
            config: self.config.clone(),
            settings: self.settings.clone(),
            services: self.services.clone(),
            live: self.live.clone(),
            status: self.status.clone(),
            cancel: self.cancel.clone(),
            buffer: self.buffer.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("supervise-{}", self.config.id))
            .spawn(move || monitor.run())
            .context("spawn stream monitor")?;
        self.monitor = Some(handle);
        Ok(())
    }

    /// Apply a region and downstream change without touching capture.
    pub fn update_live(&mut self, config: &StreamConfig) {
        {
            let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
            live.region = config.detection_region;
            live.downstream = config.downstream.clone();
        }
        self.config.detection_region = config.detection_region;
        self.config.downstream = config.downstream.clone();
        self.config.is_camera = config.is_camera;
        log::info!("StreamSupervisor[{}]: live settings updated", self.config.id);
    }

    /// Cancel, drain the buffer and wait (bounded) for the loops. Idempotent.
    pub fn stop(&mut self) {
        self.begin_stop();
        self.finish_stop();
    }

    /// First half of `stop`: signal cancellation without waiting.
    pub fn begin_stop(&self) {
        self.cancel.cancel();
        let drained = self.buffer.drain();
        if drained > 0 {
            log::debug!(
                "StreamSupervisor[{}]: discarded {} queued frames",
                self.config.id,
                drained
            );
        }
    }

    /// Second half of `stop`: wait for the monitor and mark the stream stopped.
    pub fn finish_stop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            // The monitor joins two loops itself.
            let timeout = self.settings.join_timeout * 3;
            join_within(monitor, timeout, &format!("StreamSupervisor[{}]", self.config.id));
        }
        self.status.report(StreamStatus::Stopped);
    }

    pub fn status(&self) -> StreamStatus {
        self.status.current()
    }

    pub fn is_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if self.monitor.is_some() {
            self.stop();
        }
    }
}

/// Live cameras deliver at their own pace; only files and synthetic sources are throttled.
fn capture_policy(base: &CapturePolicy, config: &StreamConfig) -> CapturePolicy {
    let mut policy = base.clone();
    if config.live_camera() {
        policy.rate_limit = false;
    }
    policy
}

/// State moved into the monitor thread.
struct Monitor {
    config: StreamConfig,
    settings: PipelineSettings,
    services: StreamServices,
    live: SharedSettings,
    status: StatusReporter,
    cancel: CancelToken,
    buffer: FrameBuffer,
}

impl Monitor {
    fn tag(&self) -> String {
        format!("StreamSupervisor[{}]", self.config.id)
    }

    fn connect(&self) -> Option<StreamConnection> {
        let mut connection = StreamConnection::new(
            self.config.id.clone(),
            self.services.sources.clone(),
            self.settings.connection.clone(),
        )
        .with_cancel(self.cancel.clone());
        self.status.report(StreamStatus::Connecting);
        if connection.connect(&self.config.source) {
            self.status.report(StreamStatus::Running);
            Some(connection)
        } else {
            None
        }
    }

    fn spawn_capture(&self, connection: StreamConnection) -> Result<JoinHandle<CaptureReport>> {
        CaptureLoop::new(
            connection,
            self.buffer.clone(),
            capture_policy(&self.settings.capture, &self.config),
            self.cancel.clone(),
            self.status.clone(),
        )
        .spawn()
    }

    fn spawn_processing(&self) -> Result<JoinHandle<ProcessingReport>> {
        let detector = (self.services.detector)().context("create detector")?;
        let recognizer = (self.services.recognizer)().context("create text recognizer")?;
        let processor = FrameProcessor::new(
            detector,
            recognizer,
            self.settings.detection.clone(),
            self.live.clone(),
            self.services.archive.clone(),
            self.services.downstream.clone(),
            self.status.clone(),
        );
        ProcessingLoop::new(
            processor,
            self.buffer.clone(),
            self.services.display.clone(),
            self.cancel.clone(),
        )
        .with_pop_timeout(self.settings.pop_timeout)
        .spawn()
    }

    fn run(self) {
        let tag = self.tag();
        let Some(connection) = self.connect() else {
            if !self.cancel.is_cancelled() {
                self.status.report(StreamStatus::Error(format!(
                    "could not connect to {}",
                    self.config.source
                )));
            }
            return;
        };

        let mut processing = match self.spawn_processing() {
            Ok(handle) => Some(handle),
            Err(err) => {
                self.status.report(StreamStatus::Error(format!("{:#}", err)));
                return;
            }
        };
        let mut capture = match self.spawn_capture(connection) {
            Ok(handle) => Some(handle),
            Err(err) => {
                self.status.report(StreamStatus::Error(format!("{:#}", err)));
                self.shutdown(None, processing.take());
                return;
            }
        };
        let mut restarts_left = self.settings.capture_restarts;

        while !self.cancel.sleep(self.settings.monitor_interval) {
            if processing.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(handle) = processing.take() {
                    let _ = join_within(handle, self.settings.join_timeout, &tag);
                }
                self.status.report(StreamStatus::Error(
                    "processing loop stopped unexpectedly".to_string(),
                ));
                break;
            }

            if !capture.as_ref().is_some_and(|h| h.is_finished()) {
                continue;
            }
            let exit = capture
                .take()
                .and_then(|h| join_within(h, self.settings.join_timeout, &tag))
                .map(|mut report| {
                    report.connection.disconnect();
                    report.exit
                })
                .unwrap_or_else(|| CaptureExit::ReconnectFailed("capture loop panicked".into()));

            match exit {
                CaptureExit::Cancelled => break,
                CaptureExit::EndOfStream => {
                    self.wait_for_drain();
                    self.cancel.cancel();
                    self.shutdown(None, processing.take());
                    self.status.report(StreamStatus::Finished);
                    return;
                }
                CaptureExit::ReconnectFailed(reason) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if restarts_left == 0 {
                        self.status.report(StreamStatus::Error(reason));
                        break;
                    }
                    restarts_left -= 1;
                    log::warn!("{}: capture loop gave up ({}), restarting", tag, reason);
                    match self.connect().map(|c| self.spawn_capture(c)) {
                        Some(Ok(handle)) => capture = Some(handle),
                        Some(Err(err)) => {
                            self.status.report(StreamStatus::Error(format!("{:#}", err)));
                            break;
                        }
                        None => {
                            if !self.cancel.is_cancelled() {
                                self.status.report(StreamStatus::Error(reason));
                            }
                            break;
                        }
                    }
                }
            }
        }

        self.cancel.cancel();
        self.shutdown(capture, processing);
    }

    /// Let the processing loop finish what a finite source left in the buffer.
    fn wait_for_drain(&self) {
        let deadline = Instant::now() + self.settings.pop_timeout * 10;
        while !self.buffer.is_empty() && Instant::now() < deadline {
            if self.cancel.sleep(Duration::from_millis(10)) {
                return;
            }
        }
    }

    fn shutdown(
        &self,
        capture: Option<JoinHandle<CaptureReport>>,
        processing: Option<JoinHandle<ProcessingReport>>,
    ) {
        let tag = self.tag();
        self.cancel.cancel();
        self.buffer.drain();
        if let Some(handle) = capture {
            if let Some(mut report) = join_within(handle, self.settings.join_timeout, &tag) {
                report.connection.disconnect();
                log::info!(
                    "{}: capture stopped ({} frames, {} dropped)",
                    tag,
                    report.frames_captured,
                    report.frames_dropped
                );
            }
        }
        if let Some(handle) = processing {
            if let Some(report) = join_within(handle, self.settings.join_timeout, &tag) {
                log::info!(
                    "{}: processing stopped ({} frames, {} plates saved)",
                    tag,
                    report.frames_processed,
                    report.plates_saved
                );
            }
        }
    }
}
