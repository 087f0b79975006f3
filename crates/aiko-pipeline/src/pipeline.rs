//! The Pipeline actor.
//!
//! Loads a definition, instantiates its elements (local instances or remote
//! proxies), and executes per-frame dataflow: gather each element's inputs
//! from the swag, run it, merge its outputs back, and finally reply with
//! the tail element's outputs. Frames hitting a remote element are parked
//! and resume when the `process_frame_response` comes back.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use aiko_engine::{
    Actor, ActorContext, ActorError, ActorInfo, Command, Discovery, RegistrarEvent, RemoteProxy,
};
use aiko_sexpr::{generate, SValue};
use aiko_types::ServiceTags;

use crate::definition::{Deploy, ElementDefinition, PipelineDefinition};
use crate::element::{ElementContext, PipelineElement};
use crate::error::{PipelineError, Result};
use crate::graph::PipelineGraph;
use crate::registry::ElementRegistry;
use crate::stream::{
    Frame, FrameMetrics, PausedFrame, Stream, StreamEvent, StreamState, DEFAULT_GRACE_TIME,
    FIRST_FRAME_ID,
};

pub const PROTOCOL_PIPELINE: &str = "aiko/pipeline:0";

const TIMER_LEASE_SWEEP: u32 = 1;
const LEASE_SWEEP_PERIOD: Duration = Duration::from_secs(1);

// ── Element slots ─────────────────────────────────────────────────────────────

enum ElementSlot {
    Local(Box<dyn PipelineElement>),
    Remote {
        discovery: Discovery,
        proxy: Option<RemoteProxy>,
    },
}

struct ElementNode {
    definition: ElementDefinition,
    /// Element parameter defaults as runtime values.
    parameters: HashMap<String, SValue>,
    /// Declared input port names, in definition order.
    input_ports: Vec<String>,
    /// Declared output port names, in definition order.
    output_ports: Vec<String>,
    /// Input ports fed through an edge rename (looked up as `name.port`).
    renamed_ports: HashSet<String>,
    /// Outgoing renames: `(consumer, from, to)`.
    fan_out: Vec<(String, String, String)>,
    slot: ElementSlot,
}

// ── PipelineActor ─────────────────────────────────────────────────────────────

pub struct PipelineActor {
    definition: PipelineDefinition,
    pipeline_parameters: HashMap<String, SValue>,
    graph: PipelineGraph,
    elements: HashMap<String, ElementNode>,
    streams: HashMap<String, Stream>,
    sliding_window: bool,
    default_grace_time: Duration,
}

impl std::fmt::Debug for PipelineActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineActor")
            .field("definition", &self.definition)
            .field("elements", &self.elements.keys().collect::<Vec<_>>())
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("sliding_window", &self.sliding_window)
            .field("default_grace_time", &self.default_grace_time)
            .finish()
    }
}

impl PipelineActor {
    /// Build the pipeline: graph, invariants, element instantiation. Any
    /// error here is fatal to pipeline startup.
    pub fn build(definition: PipelineDefinition, registry: &ElementRegistry) -> Result<Self> {
        let graph = PipelineGraph::build(&definition.graph)?;

        for name in graph.node_names() {
            if definition.element(name).is_none() {
                return Err(PipelineError::Invariant(format!(
                    "graph references undefined element: {name}"
                )));
            }
        }
        for element in &definition.elements {
            if !graph.node_names().contains(&element.name) {
                warn!(
                    element = %element.name,
                    "element not used within the graph definition, skipping"
                );
            }
        }

        let mut elements = HashMap::new();
        for name in graph.node_names() {
            let element_definition = definition.element(name).expect("checked above").clone();
            let slot = match &element_definition.deploy {
                Deploy::Local(local) => {
                    let class_name =
                        element_definition.class_name().expect("local deploy");
                    let element =
                        registry.create(&local.module, class_name, &element_definition)?;
                    ElementSlot::Local(element)
                }
                Deploy::Remote(remote) => ElementSlot::Remote {
                    discovery: Discovery::new(remote.service_filter.clone()),
                    proxy: None,
                },
            };

            let renamed_ports = graph
                .fan_in(name)
                .map(|renames| renames.values().map(|(_, to)| to.clone()).collect())
                .unwrap_or_default();
            let fan_out = graph
                .fan_out(name)
                .map(|renames| {
                    renames
                        .iter()
                        .map(|(consumer, (from, to))| {
                            (consumer.clone(), from.clone(), to.clone())
                        })
                        .collect()
                })
                .unwrap_or_default();

            elements.insert(
                name.clone(),
                ElementNode {
                    parameters: element_definition.parameter_values(),
                    input_ports: element_definition
                        .input
                        .iter()
                        .map(|port| port.name.clone())
                        .collect(),
                    output_ports: element_definition
                        .output
                        .iter()
                        .map(|port| port.name.clone())
                        .collect(),
                    renamed_ports,
                    fan_out,
                    definition: element_definition,
                    slot,
                },
            );
        }

        let pipeline_parameters = definition.parameter_values();
        let sliding_window = pipeline_parameters
            .get("sliding_window")
            .and_then(SValue::as_bool)
            .unwrap_or(false);

        let pipeline = Self {
            definition,
            pipeline_parameters,
            graph,
            elements,
            streams: HashMap::new(),
            sliding_window,
            default_grace_time: DEFAULT_GRACE_TIME,
        };
        pipeline.validate_ports();
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn stream(&self, stream_id: &str) -> Option<&Stream> {
        self.streams.get(stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Port name/type continuity across edges is checked loosely: every
    /// mismatch warns, none is fatal.
    fn validate_ports(&self) {
        for name in self.graph.order().iter().skip(1) {
            let node = &self.elements[name];
            let ancestors = self.transitive_predecessors(name);
            for port in &node.definition.input {
                if node.renamed_ports.contains(&port.name) {
                    continue;
                }
                let producer = ancestors.iter().find_map(|ancestor| {
                    self.elements
                        .get(ancestor)?
                        .definition
                        .output
                        .iter()
                        .find(|output| output.name == port.name)
                });
                match producer {
                    None => warn!(
                        element = %name,
                        input = %port.name,
                        "input not produced by any previous element"
                    ),
                    Some(output) if output.type_name != port.type_name => warn!(
                        element = %name,
                        input = %port.name,
                        expected = %port.type_name,
                        produced = %output.type_name,
                        "port type mismatch"
                    ),
                    Some(_) => {}
                }
            }
        }
    }

    fn transitive_predecessors(&self, name: &str) -> Vec<String> {
        let mut seen = Vec::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            for predecessor in self.graph.predecessors(&current) {
                if !seen.contains(&predecessor.to_string()) {
                    seen.push(predecessor.to_string());
                    frontier.push(predecessor.to_string());
                }
            }
        }
        seen
    }

    // ── Stream lifecycle ─────────────────────────────────────────────────

    fn create_stream_impl(
        &mut self,
        stream_id: &str,
        parameters: HashMap<String, SValue>,
        grace_time: Duration,
        ctx: &mut ActorContext,
    ) -> Result<()> {
        if self.streams.contains_key(stream_id) {
            return Err(PipelineError::Lifecycle {
                element: self.graph.head().to_string(),
                stream_id: stream_id.to_string(),
                diagnostic: "duplicate_stream".into(),
            });
        }
        debug!(%stream_id, pipeline = %self.definition.name, "create stream");

        let mut stream = Stream::new(stream_id.to_string(), parameters, grace_time);
        let out_topic = ctx.topic_path.out_topic();
        let order: Vec<String> = self.graph.order().to_vec();

        let mut started: Vec<String> = Vec::new();
        let mut failure: Option<(String, String)> = None;
        for name in &order {
            let event = self.run_lifecycle(name, &mut stream, &out_topic, true, ctx);
            match event {
                StreamEvent::Okay => started.push(name.clone()),
                StreamEvent::Stop => {
                    failure = Some((name.clone(), "stop during start_stream".into()));
                    break;
                }
                StreamEvent::Error { diagnostic } => {
                    failure = Some((name.clone(), diagnostic));
                    break;
                }
            }
        }

        if let Some((element, diagnostic)) = failure {
            // Unwind the elements already started, newest first.
            for name in started.iter().rev() {
                let _ = self.run_lifecycle(name, &mut stream, &out_topic, false, ctx);
            }
            stream.state = StreamState::Error;
            return Err(PipelineError::Lifecycle {
                element,
                stream_id: stream_id.to_string(),
                diagnostic,
            });
        }

        stream.state = StreamState::Running;
        self.streams.insert(stream_id.to_string(), stream);
        Ok(())
    }

    /// Run `start_stream` (or `stop_stream`) on one element for a stream
    /// that is not (or no longer) in the stream table.
    fn run_lifecycle(
        &mut self,
        name: &str,
        stream: &mut Stream,
        out_topic: &str,
        starting: bool,
        ctx: &mut ActorContext,
    ) -> StreamEvent {
        let swag = HashMap::new();
        let metrics = FrameMetrics::new();
        let node = self.elements.get_mut(name).expect("known element");
        match &mut node.slot {
            ElementSlot::Local(element) => {
                let mut ectx = ElementContext::new(
                    name,
                    &stream.stream_id,
                    FIRST_FRAME_ID,
                    out_topic,
                    &mut stream.variables,
                    &swag,
                    &metrics,
                    &stream.parameters,
                    &node.parameters,
                    &self.pipeline_parameters,
                );
                let event = if starting {
                    element.start_stream(&mut ectx)
                } else {
                    element.stop_stream(&mut ectx)
                };
                let publishes = ectx.take_publishes();
                let created = ectx.take_created_frames();
                for (topic, payload) in publishes {
                    ctx.publish(&topic, &payload);
                }
                post_created_frames(stream, created, ctx);
                event
            }
            ElementSlot::Remote { proxy, .. } => {
                let method = if starting { "create_stream" } else { "destroy_stream" };
                match proxy {
                    Some(proxy) => {
                        let mut args = vec![stream_id_value(&stream.stream_id)];
                        if starting {
                            args.push(parameters_value(&stream.parameters));
                            args.push(SValue::Int(stream.grace_time.as_secs() as i64));
                        }
                        proxy.call(ctx, method, args);
                    }
                    None => warn!(
                        element = %name,
                        %method,
                        "remote element invoked before discovery"
                    ),
                }
                StreamEvent::Okay
            }
        }
    }

    fn destroy_stream_impl(&mut self, stream_id: &str, ctx: &mut ActorContext) -> bool {
        let Some(mut stream) = self.streams.remove(stream_id) else {
            warn!(%stream_id, "destroy stream: not found");
            return false;
        };
        debug!(%stream_id, pipeline = %self.definition.name, "destroy stream");
        stream.state = StreamState::Stopping;

        let out_topic = ctx.topic_path.out_topic();
        let order: Vec<String> = self.graph.order().to_vec();
        for name in order.iter().rev() {
            let event = self.run_lifecycle(name, &mut stream, &out_topic, false, ctx);
            if let StreamEvent::Error { diagnostic } = event {
                // Collect the diagnostic and keep unwinding.
                error!(
                    element = %name,
                    %stream_id,
                    %diagnostic,
                    "stop_stream failed"
                );
            }
        }
        stream.state = StreamState::Stopped;
        true
    }

    // ── Frame traversal ──────────────────────────────────────────────────

    fn process_frame_command(
        &mut self,
        command: &Command,
        new_frame: bool,
        ctx: &mut ActorContext,
    ) {
        let Some(meta) = command.arg(0).filter(|value| value.as_map().is_some()) else {
            warn!(method = %command.method, "frame command without stream context");
            return;
        };
        let stream_id = meta
            .get("stream_id")
            .map(stream_id_text)
            .unwrap_or_else(|| "0".to_string());
        let frame_id = meta
            .get("frame_id")
            .and_then(SValue::as_int)
            .unwrap_or(FIRST_FRAME_ID);
        let reply_to = meta
            .get("reply_to")
            .and_then(SValue::as_text)
            .map(str::to_string);
        let response_topic = meta
            .get("response")
            .and_then(SValue::as_text)
            .map(str::to_string);
        let data = command
            .arg(1)
            .map(map_values)
            .unwrap_or_default();

        if new_frame {
            if !self.streams.contains_key(&stream_id) {
                // Headless operation: auto-create with the default grace.
                if let Err(e) = self.create_stream_impl(
                    &stream_id,
                    HashMap::new(),
                    self.default_grace_time,
                    ctx,
                ) {
                    error!(%stream_id, %e, "auto-create stream failed");
                    return;
                }
            }
            let stream = self.streams.get_mut(&stream_id).expect("just ensured");
            stream.extend_lease();
            stream.frame_id = frame_id;
            let frame = Frame::new(frame_id, data);
            self.run_traversal(&stream_id, frame, 0, None, reply_to, response_topic, ctx);
        } else {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                warn!(%stream_id, frame_id, "frame response for unknown stream");
                return;
            };
            stream.extend_lease();
            let Some(paused) = stream.paused.remove(&frame_id) else {
                warn!(%stream_id, frame_id, "frame response without a paused frame");
                return;
            };
            let mut frame = paused.frame;

            // The remote's outputs join the swag (with edge renames applied)
            // and stand as the latest outputs should the remote be the tail.
            let mut outputs = data;
            if let Some(node) = self.elements.get(&paused.element) {
                for (consumer, from, to) in &node.fan_out {
                    if let Some(value) = outputs.remove(from) {
                        outputs.insert(format!("{consumer}.{to}"), value);
                    }
                }
            }
            frame.swag.extend(outputs.clone());

            let resume_at = self
                .graph
                .position(&paused.element)
                .map(|position| position + 1)
                .unwrap_or(self.graph.order().len());
            self.run_traversal(
                &stream_id,
                frame,
                resume_at,
                Some((paused.element, outputs)),
                paused.reply_to,
                paused.response_topic,
                ctx,
            );
        }
    }

    fn run_traversal(
        &mut self,
        stream_id: &str,
        mut frame: Frame,
        start: usize,
        resumed_from: Option<(String, HashMap<String, SValue>)>,
        reply_to: Option<String>,
        response_topic: Option<String>,
        ctx: &mut ActorContext,
    ) {
        let order: Vec<String> = self.graph.order().to_vec();
        let out_topic = ctx.topic_path.out_topic();
        let in_topic = ctx.topic_path.in_topic();
        let frame_id = frame.frame_id;

        let (mut last_ran, mut last_outputs) = match resumed_from {
            Some((element, outputs)) => (Some(element), outputs),
            None => (None, HashMap::new()),
        };
        let mut mark_stopping = false;

        for name in order.iter().skip(start) {
            // Gather the element's inputs from the swag.
            let inputs = match self.gather_inputs(name, stream_id, &frame) {
                Gather::Ready(inputs) => inputs,
                Gather::Deferred => continue,
                Gather::Missing(port) => {
                    error!(
                        element = %name,
                        %stream_id,
                        frame_id,
                        input = %port,
                        "frame error: input not provided"
                    );
                    return;
                }
            };

            let outcome = self.run_element(name, stream_id, &frame, &inputs, &out_topic, ctx);
            match outcome {
                StepOutcome::Ran {
                    event,
                    outputs,
                    duration,
                } => {
                    frame.metrics.record(name, duration);
                    match event {
                        StreamEvent::Okay => {
                            last_outputs = outputs.clone();
                            frame.swag.extend(outputs);
                            last_ran = Some(name.clone());
                        }
                        StreamEvent::Stop => {
                            mark_stopping = true;
                            break;
                        }
                        StreamEvent::Error { diagnostic } => {
                            error!(
                                element = %name,
                                %stream_id,
                                frame_id,
                                %diagnostic,
                                "frame error"
                            );
                            return; // next frame continues
                        }
                    }
                }
                StepOutcome::Paused { proxy_in_topic } => {
                    // Forward to the remote and park the frame.
                    let meta = SValue::Map(vec![
                        (SValue::symbol("stream_id"), stream_id_value(stream_id)),
                        (SValue::symbol("frame_id"), SValue::Int(frame_id)),
                        (SValue::symbol("response"), SValue::symbol(&in_topic)),
                    ]);
                    let payload = generate(&SValue::List(vec![
                        SValue::symbol("process_frame"),
                        meta,
                        SValue::Map(
                            inputs
                                .iter()
                                .map(|(k, v)| (SValue::symbol(k), v.clone()))
                                .collect(),
                        ),
                    ]));
                    ctx.publish(&proxy_in_topic, &payload);

                    let stream = self.streams.get_mut(stream_id).expect("live stream");
                    stream.paused.insert(
                        frame_id,
                        PausedFrame {
                            element: name.clone(),
                            frame,
                            reply_to,
                            response_topic,
                        },
                    );
                    return;
                }
                StepOutcome::Absent => {
                    error!(
                        element = %name,
                        %stream_id,
                        frame_id,
                        "frame error: remote element not discovered"
                    );
                    return;
                }
            }
        }

        if mark_stopping {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.state = StreamState::Stopping;
            }
            return;
        }

        self.finish_frame(
            stream_id,
            frame_id,
            last_ran.as_deref(),
            &last_outputs,
            reply_to,
            response_topic,
            &out_topic,
            ctx,
        );
    }

    fn gather_inputs(&mut self, name: &str, stream_id: &str, frame: &Frame) -> Gather {
        let node = self.elements.get(name).expect("known element");
        let mut available: Vec<(String, Option<SValue>)> = Vec::new();
        for port in &node.input_ports {
            let key = if node.renamed_ports.contains(port) {
                format!("{name}.{port}")
            } else {
                port.clone()
            };
            available.push((port.clone(), frame.swag.get(&key).cloned()));
        }

        if !self.sliding_window {
            let mut inputs = HashMap::new();
            for (port, value) in available {
                match value {
                    Some(value) => {
                        inputs.insert(port, value);
                    }
                    None => return Gather::Missing(port),
                }
            }
            return Gather::Ready(inputs);
        }

        // Sliding-window mode: FIFO per input edge; a join fires when every
        // input has a queued value, consuming one per edge.
        let stream = self.streams.get_mut(stream_id).expect("live stream");
        let buffers = stream
            .pending_inputs
            .entry(name.to_string())
            .or_default();
        for (port, value) in &available {
            if let Some(value) = value {
                buffers
                    .entry(port.clone())
                    .or_default()
                    .push_back(value.clone());
            }
        }
        let ready = available
            .iter()
            .all(|(port, _)| buffers.get(port).is_some_and(|queue| !queue.is_empty()));
        if !ready {
            return Gather::Deferred;
        }
        let mut inputs = HashMap::new();
        for (port, _) in &available {
            let value = buffers
                .get_mut(port)
                .and_then(|queue| queue.pop_front())
                .expect("checked non-empty");
            inputs.insert(port.clone(), value);
        }
        Gather::Ready(inputs)
    }

    fn run_element(
        &mut self,
        name: &str,
        stream_id: &str,
        frame: &Frame,
        inputs: &HashMap<String, SValue>,
        out_topic: &str,
        ctx: &mut ActorContext,
    ) -> StepOutcome {
        let stream = self.streams.get_mut(stream_id).expect("live stream");
        let node = self.elements.get_mut(name).expect("known element");
        match &mut node.slot {
            ElementSlot::Local(element) => {
                let mut ectx = ElementContext::new(
                    name,
                    &stream.stream_id,
                    frame.frame_id,
                    out_topic,
                    &mut stream.variables,
                    &frame.swag,
                    &frame.metrics,
                    &stream.parameters,
                    &node.parameters,
                    &self.pipeline_parameters,
                );
                let started = Instant::now();
                let (event, mut outputs) = element.process_frame(&mut ectx, inputs);
                let duration = started.elapsed();
                let publishes = ectx.take_publishes();
                let created = ectx.take_created_frames();
                for (topic, payload) in publishes {
                    ctx.publish(&topic, &payload);
                }
                post_created_frames(stream, created, ctx);

                // Edge renames: the producer's `from` lands as `consumer.to`.
                for (consumer, from, to) in &node.fan_out {
                    if let Some(value) = outputs.remove(from) {
                        outputs.insert(format!("{consumer}.{to}"), value);
                    }
                }
                StepOutcome::Ran {
                    event,
                    outputs,
                    duration,
                }
            }
            ElementSlot::Remote { proxy, .. } => match proxy {
                Some(proxy) => StepOutcome::Paused {
                    proxy_in_topic: proxy.in_topic(),
                },
                None => StepOutcome::Absent,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_frame(
        &mut self,
        stream_id: &str,
        frame_id: i64,
        last_ran: Option<&str>,
        last_outputs: &HashMap<String, SValue>,
        reply_to: Option<String>,
        response_topic: Option<String>,
        out_topic: &str,
        ctx: &mut ActorContext,
    ) {
        debug!(%stream_id, frame_id, "frame complete");

        // Present the outputs in the tail element's declared port order.
        let pairs: Vec<(SValue, SValue)> = match last_ran.and_then(|name| self.elements.get(name))
        {
            Some(node) if !node.output_ports.is_empty() => node
                .output_ports
                .iter()
                .filter_map(|port| {
                    last_outputs
                        .get(port)
                        .map(|value| (SValue::symbol(port), value.clone()))
                })
                .collect(),
            _ => {
                let mut entries: Vec<(&String, &SValue)> = last_outputs.iter().collect();
                entries.sort_by_key(|(name, _)| name.to_string());
                entries
                    .into_iter()
                    .map(|(name, value)| (SValue::symbol(name), value.clone()))
                    .collect()
            }
        };
        let outputs_map = SValue::Map(pairs);

        if let Some(response) = response_topic {
            // This frame was forwarded from another pipeline: answer on its
            // resume channel.
            let payload = generate(&SValue::List(vec![
                SValue::symbol("process_frame_response"),
                SValue::Map(vec![
                    (SValue::symbol("stream_id"), stream_id_value(stream_id)),
                    (SValue::symbol("frame_id"), SValue::Int(frame_id)),
                ]),
                outputs_map,
            ]));
            ctx.publish(&response, &payload);
        } else {
            let payload = generate(&SValue::List(vec![
                SValue::symbol("process_frame"),
                outputs_map,
            ]));
            let target = reply_to.as_deref().unwrap_or(out_topic);
            ctx.publish(target, &payload);
        }
    }

    // ── Discovery plumbing ───────────────────────────────────────────────

    fn feed_discoveries_payload(&mut self, payload: &str) {
        match Command::parse(payload) {
            Ok(command) => self.feed_discoveries(&command),
            Err(_) => {}
        }
    }

    fn feed_discoveries(&mut self, command: &Command) {
        for (name, node) in self.elements.iter_mut() {
            let ElementSlot::Remote { discovery, proxy } = &mut node.slot else {
                continue;
            };
            for event in discovery.handle_command(command) {
                match event {
                    aiko_engine::DiscoveryEvent::Added(record) => {
                        if proxy.is_none() {
                            info!(
                                element = %name,
                                remote = %record.topic_path,
                                "remote element resolved"
                            );
                            *proxy = Some(RemoteProxy::new(&record.topic_path));
                        } else {
                            warn!(
                                element = %name,
                                extra = %record.topic_path,
                                "more than one remote match, keeping the first"
                            );
                        }
                    }
                    aiko_engine::DiscoveryEvent::Removed(topic_path) => {
                        if proxy
                            .as_ref()
                            .is_some_and(|p| p.topic_path() == topic_path)
                        {
                            warn!(element = %name, remote = %topic_path, "remote element vanished");
                            *proxy = discovery
                                .first()
                                .map(|record| RemoteProxy::new(&record.topic_path));
                        }
                    }
                    aiko_engine::DiscoveryEvent::Synced => {}
                }
            }
        }
    }

    fn terminate(&mut self, ctx: &mut ActorContext) {
        let stream_ids: Vec<String> = self.streams.keys().cloned().collect();
        for stream_id in stream_ids {
            self.destroy_stream_impl(&stream_id, ctx);
        }
        ctx.remove_timer(TIMER_LEASE_SWEEP);
        info!(pipeline = %self.definition.name, "pipeline terminating");
        ctx.terminate(0);
    }
}

// ── Actor implementation ──────────────────────────────────────────────────────

impl Actor for PipelineActor {
    fn info(&self) -> ActorInfo {
        ActorInfo {
            name: self.definition.name.clone(),
            protocol: PROTOCOL_PIPELINE.into(),
            tags: ServiceTags::new(&["pipeline=true"]),
        }
    }

    fn on_start(&mut self, ctx: &mut ActorContext) {
        info!(
            pipeline = %self.definition.name,
            elements = self.elements.len(),
            topic = %ctx.topic_path.in_topic(),
            "pipeline ready"
        );
        ctx.add_timer(LEASE_SWEEP_PERIOD, true, TIMER_LEASE_SWEEP);
    }

    fn on_command(
        &mut self,
        command: &Command,
        ctx: &mut ActorContext,
    ) -> std::result::Result<Option<SValue>, ActorError> {
        match command.method.as_str() {
            "create_stream" => {
                let Some(stream_id) = command.arg(0).map(stream_id_text) else {
                    return Err(ActorError::Failed("create_stream without id".into()));
                };
                let parameters = command.arg(1).map(map_values).unwrap_or_default();
                let grace_time = command
                    .arg(2)
                    .and_then(SValue::as_int)
                    .map(|secs| Duration::from_secs(secs.max(0) as u64))
                    .unwrap_or(self.default_grace_time);
                if let Err(e) = self.create_stream_impl(&stream_id, parameters, grace_time, ctx)
                {
                    error!(%stream_id, %e, "create stream failed");
                }
                Ok(None)
            }
            "process_frame" => {
                self.process_frame_command(command, true, ctx);
                Ok(None)
            }
            "process_frame_response" => {
                self.process_frame_command(command, false, ctx);
                Ok(None)
            }
            "destroy_stream" => {
                let Some(stream_id) = command.arg(0).map(stream_id_text) else {
                    return Err(ActorError::Failed("destroy_stream without id".into()));
                };
                self.destroy_stream_impl(&stream_id, ctx);
                Ok(None)
            }
            "set_parameter" => {
                let (Some(stream_id), Some(name), Some(value)) = (
                    command.arg(0).map(stream_id_text),
                    command.arg(1).and_then(SValue::as_text),
                    command.arg(2),
                ) else {
                    return Err(ActorError::Failed(
                        "set_parameter needs stream_id, name, value".into(),
                    ));
                };
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.parameters.insert(name.to_string(), value.clone());
                }
                Ok(None)
            }
            // Discovery responses requested with the registrar share
            // protocol arrive on our own `in` topic.
            "add" | "remove" | "sync" | "item_count" => {
                self.feed_discoveries(command);
                Ok(None)
            }
            "terminate" | "stop" => {
                self.terminate(ctx);
                Ok(None)
            }
            other => Err(ActorError::UnknownMethod(other.to_string())),
        }
    }

    fn on_message(&mut self, topic: &str, payload: &str, _retain: bool, _ctx: &mut ActorContext) {
        // Live add/remove events from the Registrar's out stream.
        if topic.ends_with("/out") {
            self.feed_discoveries_payload(payload);
        }
    }

    fn on_timer(&mut self, token: u32, ctx: &mut ActorContext) {
        if token != TIMER_LEASE_SWEEP {
            return;
        }
        let now = Instant::now();
        let expired: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.expired(now))
            .map(|(stream_id, _)| stream_id.clone())
            .collect();
        for stream_id in expired {
            info!(%stream_id, "stream lease expired");
            self.destroy_stream_impl(&stream_id, ctx);
        }
    }

    fn on_registrar(&mut self, event: &RegistrarEvent, ctx: &mut ActorContext) {
        let RegistrarEvent::Found { topic_path } = event else {
            return;
        };
        let has_remote = self
            .elements
            .values()
            .any(|node| matches!(node.slot, ElementSlot::Remote { .. }));
        if !has_remote {
            return;
        }
        ctx.subscribe(&format!("{topic_path}/out"));

        let registrar_in = format!("{topic_path}/in");
        let response_topic = ctx.topic_path.in_topic();
        let requests: Vec<String> = self
            .elements
            .values()
            .filter_map(|node| match &node.slot {
                ElementSlot::Remote { discovery, .. } => {
                    Some(discovery.share_payload(&response_topic))
                }
                ElementSlot::Local(_) => None,
            })
            .collect();
        for payload in requests {
            ctx.publish(&registrar_in, &payload);
        }
    }

    fn on_stop(&mut self, ctx: &mut ActorContext) {
        let stream_ids: Vec<String> = self.streams.keys().cloned().collect();
        for stream_id in stream_ids {
            self.destroy_stream_impl(&stream_id, ctx);
        }
    }
}

// ── Step outcomes ─────────────────────────────────────────────────────────────

enum Gather {
    Ready(HashMap<String, SValue>),
    /// Sliding-window mode: inputs incomplete, try again on a later frame.
    Deferred,
    Missing(String),
}

enum StepOutcome {
    Ran {
        event: StreamEvent,
        outputs: HashMap<String, SValue>,
        duration: Duration,
    },
    Paused {
        proxy_in_topic: String,
    },
    Absent,
}

// ── Value helpers ─────────────────────────────────────────────────────────────

fn stream_id_text(value: &SValue) -> String {
    match value {
        SValue::Int(n) => n.to_string(),
        other => other
            .as_text()
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

fn stream_id_value(stream_id: &str) -> SValue {
    match stream_id.parse::<i64>() {
        Ok(n) => SValue::Int(n),
        Err(_) => SValue::symbol(stream_id),
    }
}

/// A map argument as owned `(name, value)` entries; any other shape is
/// treated as empty.
fn map_values(value: &SValue) -> HashMap<String, SValue> {
    value
        .as_map()
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|(key, value)| {
                    let key = match key {
                        SValue::Int(n) => n.to_string(),
                        other => other.as_text()?.to_string(),
                    };
                    Some((key, value.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parameters_value(parameters: &HashMap<String, SValue>) -> SValue {
    let mut entries: Vec<(&String, &SValue)> = parameters.iter().collect();
    entries.sort_by_key(|(name, _)| name.to_string());
    SValue::Map(
        entries
            .into_iter()
            .map(|(name, value)| (SValue::symbol(name), value.clone()))
            .collect(),
    )
}

/// Post element-created frames back into the pipeline's own mailbox, each
/// with the next frame id on the stream.
fn post_created_frames(
    stream: &mut Stream,
    created: Vec<HashMap<String, SValue>>,
    ctx: &mut ActorContext,
) {
    for (offset, data) in created.into_iter().enumerate() {
        let frame_id = stream.frame_id + 1 + offset as i64;
        let meta = SValue::Map(vec![
            (SValue::symbol("stream_id"), stream_id_value(&stream.stream_id)),
            (SValue::symbol("frame_id"), SValue::Int(frame_id)),
        ]);
        ctx.post(Command::new(
            "process_frame",
            vec![meta, parameters_value(&data)],
        ));
    }
}
