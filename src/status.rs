//! Per-stream status and the event channel the fleet reports through.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum StreamStatus {
    #[default]
    Idle,
    Connecting,
    Retrying {
        attempt: u32,
        max: u32,
    },
    Running,
    Error(String),
    Stopped,
    /// A finite source played to its end.
    Finished,
}

/// Coarse colour for a status light.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indicator {
    Grey,
    Yellow,
    Green,
    Red,
}

impl StreamStatus {
    pub fn label(&self) -> String {
        match self {
            StreamStatus::Idle => "Idle".to_string(),
            StreamStatus::Connecting => "Connecting...".to_string(),
            StreamStatus::Retrying { attempt, max } => {
                format!("Reconnecting ({}/{})...", attempt, max)
            }
            StreamStatus::Running => "Running".to_string(),
            StreamStatus::Error(msg) => format!("Error: {}", msg),
            StreamStatus::Stopped => "Stopped".to_string(),
            StreamStatus::Finished => "Finished".to_string(),
        }
    }

    pub fn indicator(&self) -> Indicator {
        match self {
            StreamStatus::Idle | StreamStatus::Stopped | StreamStatus::Finished => Indicator::Grey,
            StreamStatus::Connecting | StreamStatus::Retrying { .. } => Indicator::Yellow,
            StreamStatus::Running => Indicator::Green,
            StreamStatus::Error(_) => Indicator::Red,
        }
    }

    /// Stopped, finished and errored streams do nothing until restarted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamStatus::Stopped | StreamStatus::Finished | StreamStatus::Error(_)
        )
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    Status(StreamStatus),
    /// Recoverable problem: detector/OCR/persistence failures, dropped deliveries.
    Warning(String),
    PlateSaved { plate: String, confidence: f32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub stream_id: String,
    pub kind: EventKind,
}

/// Non-blocking event fan-in. Events are dropped when the receiver falls behind.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<StreamEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, Receiver<StreamEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StreamEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("EventSink: dropped event for {}", event.stream_id);
            }
        }
    }
}

/// Status cell for one stream, shared by its loops and its supervisor.
#[derive(Clone)]
pub struct StatusReporter {
    stream_id: Arc<str>,
    current: Arc<RwLock<StreamStatus>>,
    events: EventSink,
}

impl StatusReporter {
    pub fn new(stream_id: &str, events: EventSink) -> Self {
        Self {
            stream_id: Arc::from(stream_id),
            current: Arc::new(RwLock::new(StreamStatus::Idle)),
            events,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Record a transition. Repeats of the current status are ignored.
    pub fn report(&self, status: StreamStatus) {
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        match &status {
            StreamStatus::Error(_) => log::error!("Stream[{}]: {}", self.stream_id, status),
            _ => log::info!("Stream[{}]: {}", self.stream_id, status),
        }
        self.emit(EventKind::Status(status));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("Stream[{}]: {}", self.stream_id, message);
        self.emit(EventKind::Warning(message));
    }

    pub fn plate_saved(&self, plate: &str, confidence: f32) {
        self.emit(EventKind::PlateSaved {
            plate: plate.to_string(),
            confidence,
        });
    }

    pub fn current(&self) -> StreamStatus {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(StreamEvent {
            stream_id: self.stream_id.to_string(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_and_indicators() {
        assert_eq!(StreamStatus::Connecting.label(), "Connecting...");
        assert_eq!(StreamStatus::Error("boom".into()).label(), "Error: boom");
        assert_eq!(
            StreamStatus::Retrying { attempt: 2, max: 3 }.label(),
            "Reconnecting (2/3)..."
        );
        assert_eq!(StreamStatus::Running.indicator(), Indicator::Green);
        assert_eq!(StreamStatus::Error(String::new()).indicator(), Indicator::Red);
        assert!(StreamStatus::Finished.is_terminal());
        assert!(!StreamStatus::Running.is_terminal());
    }

    #[test]
    fn reporter_deduplicates_transitions() {
        let (sink, rx) = EventSink::channel(8);
        let reporter = StatusReporter::new("cam-1", sink);
        reporter.report(StreamStatus::Connecting);
        reporter.report(StreamStatus::Connecting);
        reporter.report(StreamStatus::Running);
        reporter.warn("detector failed");

        let kinds: Vec<EventKind> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Status(StreamStatus::Connecting),
                EventKind::Status(StreamStatus::Running),
                EventKind::Warning("detector failed".to_string()),
            ]
        );
        assert_eq!(reporter.current(), StreamStatus::Running);
    }

    #[test]
    fn full_sink_never_blocks() {
        let (sink, rx) = EventSink::channel(1);
        let reporter = StatusReporter::new("cam-1", sink);
        for i in 0..10 {
            reporter.warn(format!("warning {}", i));
        }
        assert_eq!(rx.len(), 1);
        EventSink::disabled().emit(StreamEvent {
            stream_id: "x".into(),
            kind: EventKind::Warning("ignored".into()),
        });
    }
}
