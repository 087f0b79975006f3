//! The element trait and its per-call context.

use std::collections::HashMap;

use aiko_sexpr::SValue;

use crate::stream::{FrameMetrics, StreamEvent};

// ── ElementContext ────────────────────────────────────────────────────────────

/// What an element sees during one lifecycle or frame call.
///
/// Parameter resolution order is per-stream (`element.name` scoped, then
/// bare), element defaults, pipeline defaults. Publishes recorded here are
/// flushed by the pipeline after the call returns.
pub struct ElementContext<'a> {
    pub element_name: &'a str,
    pub stream_id: &'a str,
    pub frame_id: i64,
    /// The hosting pipeline's `out` topic.
    pub out_topic: &'a str,
    /// Mutable per-stream variables, owned by the pipeline thread.
    pub variables: &'a mut HashMap<String, SValue>,
    /// Read-only view of the whole swag (the Inspect element needs more
    /// than its own declared inputs).
    pub swag: &'a HashMap<String, SValue>,
    /// Timings captured so far for the current frame.
    pub metrics: &'a FrameMetrics,
    stream_parameters: &'a HashMap<String, SValue>,
    element_parameters: &'a HashMap<String, SValue>,
    pipeline_parameters: &'a HashMap<String, SValue>,
    publishes: Vec<(String, String)>,
    created_frames: Vec<HashMap<String, SValue>>,
}

impl<'a> ElementContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        element_name: &'a str,
        stream_id: &'a str,
        frame_id: i64,
        out_topic: &'a str,
        variables: &'a mut HashMap<String, SValue>,
        swag: &'a HashMap<String, SValue>,
        metrics: &'a FrameMetrics,
        stream_parameters: &'a HashMap<String, SValue>,
        element_parameters: &'a HashMap<String, SValue>,
        pipeline_parameters: &'a HashMap<String, SValue>,
    ) -> Self {
        Self {
            element_name,
            stream_id,
            frame_id,
            out_topic,
            variables,
            swag,
            metrics,
            stream_parameters,
            element_parameters,
            pipeline_parameters,
            publishes: Vec::new(),
            created_frames: Vec::new(),
        }
    }

    /// Resolve a parameter: per-stream override (element-scoped first),
    /// element default, pipeline default.
    pub fn get_parameter(&self, name: &str) -> Option<SValue> {
        let scoped = format!("{}.{}", self.element_name, name);
        self.stream_parameters
            .get(&scoped)
            .or_else(|| self.stream_parameters.get(name))
            .or_else(|| self.element_parameters.get(name))
            .or_else(|| self.pipeline_parameters.get(name))
            .cloned()
    }

    /// Queue a publish, performed by the pipeline after the call returns.
    pub fn publish(&mut self, topic: &str, payload: &str) {
        self.publishes.push((topic.to_string(), payload.to_string()));
    }

    pub fn take_publishes(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.publishes)
    }

    /// Inject a new frame into the owning stream. The pipeline posts it to
    /// its own mailbox with the next frame id, which is how source elements
    /// generate frames from `start_stream` onwards.
    pub fn create_frame(&mut self, data: HashMap<String, SValue>) {
        self.created_frames.push(data);
    }

    pub fn take_created_frames(&mut self) -> Vec<HashMap<String, SValue>> {
        std::mem::take(&mut self.created_frames)
    }
}

// ── PipelineElement ───────────────────────────────────────────────────────────

/// A named processing node with lifecycle hooks.
///
/// `process_frame` receives its declared inputs gathered from the swag and
/// returns new outputs to merge back under its declared output port names.
pub trait PipelineElement: Send {
    fn start_stream(&mut self, _ctx: &mut ElementContext<'_>) -> StreamEvent {
        StreamEvent::Okay
    }

    fn process_frame(
        &mut self,
        ctx: &mut ElementContext<'_>,
        inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>);

    fn stop_stream(&mut self, _ctx: &mut ElementContext<'_>) -> StreamEvent {
        StreamEvent::Okay
    }
}

impl std::fmt::Debug for dyn PipelineElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn PipelineElement")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_resolution_order() {
        let mut variables = HashMap::new();
        let swag = HashMap::new();
        let metrics = FrameMetrics::new();
        let stream_parameters: HashMap<String, SValue> = [
            ("PE_1.rate".to_string(), SValue::Int(1)),
            ("limit".to_string(), SValue::Int(2)),
        ]
        .into();
        let element_parameters: HashMap<String, SValue> =
            [("rate".to_string(), SValue::Int(10)), ("mode".to_string(), SValue::symbol("fast"))]
                .into();
        let pipeline_parameters: HashMap<String, SValue> =
            [("limit".to_string(), SValue::Int(20)), ("global".to_string(), SValue::Bool(true))]
                .into();

        let ctx = ElementContext::new(
            "PE_1",
            "0",
            0,
            "aiko/h/1/1/out",
            &mut variables,
            &swag,
            &metrics,
            &stream_parameters,
            &element_parameters,
            &pipeline_parameters,
        );

        // Element-scoped stream override wins over the element default.
        assert_eq!(ctx.get_parameter("rate"), Some(SValue::Int(1)));
        // Bare stream override wins over the pipeline default.
        assert_eq!(ctx.get_parameter("limit"), Some(SValue::Int(2)));
        // Element and pipeline defaults fill the rest.
        assert_eq!(ctx.get_parameter("mode"), Some(SValue::symbol("fast")));
        assert_eq!(ctx.get_parameter("global"), Some(SValue::Bool(true)));
        assert_eq!(ctx.get_parameter("missing"), None);
    }
}
