//! Stream and frame state.
//!
//! A stream is the long-lived context for a sequence of frames: parameters,
//! mutable per-stream variables, a lease with a grace time, and the paused
//! frames parked on remote hops. A frame is one unit of data moving through
//! the graph, carrying its port-named scratchpad (the swag).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use aiko_sexpr::SValue;

pub const FIRST_FRAME_ID: i64 = 0;
pub const DEFAULT_GRACE_TIME: Duration = Duration::from_secs(60);

// ── StreamEvent / StreamState ─────────────────────────────────────────────────

/// Outcome tag returned by element lifecycle and frame methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Okay,
    /// Stop the stream after this frame.
    Stop,
    Error { diagnostic: String },
}

impl StreamEvent {
    pub fn error(diagnostic: impl Into<String>) -> Self {
        Self::Error {
            diagnostic: diagnostic.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Running,
    Stopping,
    Stopped,
    Error,
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Wall-clock timings captured while a frame traverses the graph.
#[derive(Debug, Clone)]
pub struct FrameMetrics {
    started: Instant,
    /// Per-element durations in traversal order.
    pub elements: Vec<(String, Duration)>,
}

impl FrameMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            elements: Vec::new(),
        }
    }

    pub fn record(&mut self, element: &str, duration: Duration) {
        self.elements.push((element.to_string(), duration));
    }

    /// Total pipeline time so far.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for FrameMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of data flowing through the pipeline.
#[derive(Debug)]
pub struct Frame {
    pub frame_id: i64,
    /// Port-name → value scratchpad, accumulated across the traversal.
    pub swag: HashMap<String, SValue>,
    pub metrics: FrameMetrics,
}

impl Frame {
    pub fn new(frame_id: i64, swag: HashMap<String, SValue>) -> Self {
        Self {
            frame_id,
            swag,
            metrics: FrameMetrics::new(),
        }
    }
}

/// A frame parked while a remote element processes it elsewhere.
#[derive(Debug)]
pub struct PausedFrame {
    /// The remote element the frame is waiting on.
    pub element: String,
    pub frame: Frame,
    pub reply_to: Option<String>,
    pub response_topic: Option<String>,
}

// ── Stream ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Stream {
    pub stream_id: String,
    pub parameters: HashMap<String, SValue>,
    pub variables: HashMap<String, SValue>,
    pub state: StreamState,
    pub grace_time: Duration,
    deadline: Instant,
    pub created_at: DateTime<Utc>,
    /// Highest frame id seen; frames are processed in arrival order.
    pub frame_id: i64,
    /// Paused frames keyed by frame id.
    pub paused: HashMap<i64, PausedFrame>,
    /// Per-element, per-port FIFO buffers for sliding-window joins.
    pub pending_inputs: HashMap<String, HashMap<String, VecDeque<SValue>>>,
}

impl Stream {
    pub fn new(
        stream_id: String,
        parameters: HashMap<String, SValue>,
        grace_time: Duration,
    ) -> Self {
        Self {
            stream_id,
            parameters,
            variables: HashMap::new(),
            state: StreamState::Created,
            grace_time,
            deadline: Instant::now() + grace_time,
            created_at: Utc::now(),
            frame_id: FIRST_FRAME_ID,
            paused: HashMap::new(),
            pending_inputs: HashMap::new(),
        }
    }

    /// Any frame activity renews the lease.
    pub fn extend_lease(&mut self) {
        self.deadline = Instant::now() + self.grace_time;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_extension_pushes_the_deadline() {
        let mut stream = Stream::new("7".into(), HashMap::new(), Duration::from_secs(10));
        assert!(!stream.expired(Instant::now()));
        assert!(stream.expired(Instant::now() + Duration::from_secs(11)));

        stream.extend_lease();
        assert!(!stream.expired(Instant::now() + Duration::from_secs(9)));
    }

    #[test]
    fn metrics_accumulate_in_order() {
        let mut metrics = FrameMetrics::new();
        metrics.record("head", Duration::from_micros(12));
        metrics.record("tail", Duration::from_micros(9));
        assert_eq!(metrics.elements.len(), 2);
        assert_eq!(metrics.elements[0].0, "head");
    }

    #[test]
    fn stream_event_helpers() {
        let event = StreamEvent::error("bad frame");
        assert_eq!(
            event,
            StreamEvent::Error {
                diagnostic: "bad frame".into()
            }
        );
        assert_ne!(StreamEvent::Okay, StreamEvent::Stop);
    }
}
