//! Pipeline engine.
//!
//! A pipeline is an actor hosting a directed acyclic graph of processing
//! elements. Frames enter through `process_frame` commands, traverse the
//! graph in topological order accumulating their swag, and leave as a reply
//! on the pipeline's `out` topic (or a caller-chosen `reply_to:` topic).
//! Elements deploy locally through a factory registry or remotely as proxies
//! resolved via Registrar discovery.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod definition;
pub mod element;
pub mod elements;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod registry;
pub mod stream;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use definition::{Deploy, ElementDefinition, PipelineDefinition, PortDefinition};
pub use element::{ElementContext, PipelineElement};
pub use error::PipelineError;
pub use graph::PipelineGraph;
pub use pipeline::{PipelineActor, PROTOCOL_PIPELINE};
pub use registry::ElementRegistry;
pub use stream::{Frame, FrameMetrics, Stream, StreamEvent, StreamState};
