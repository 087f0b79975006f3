//! Pipeline dataflow scenarios, driven without a broker: the actor is
//! dispatched directly and its outbound publishes are captured from the
//! recorded actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aiko_engine::{Action, Actor, ActorContext, Command, RegistrarEvent};
use aiko_pipeline::{
    ElementContext, ElementDefinition, ElementRegistry, PipelineActor, PipelineDefinition,
    PipelineElement, PipelineError, StreamEvent,
};
use aiko_sexpr::SValue;
use aiko_types::TopicPath;

// ── Test elements ─────────────────────────────────────────────────────────────

/// Single input, single output: `out = in + amount`.
struct Add {
    input: String,
    output: String,
    amount: i64,
}

impl PipelineElement for Add {
    fn process_frame(
        &mut self,
        _ctx: &mut ElementContext<'_>,
        inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        let Some(value) = inputs.get(&self.input).and_then(SValue::as_int) else {
            return (StreamEvent::error(format!("missing input {}", self.input)), HashMap::new());
        };
        (
            StreamEvent::Okay,
            [(self.output.clone(), SValue::Int(value + self.amount))].into(),
        )
    }
}

/// Single input, single output: `out = in * factor`.
struct Multiply {
    input: String,
    output: String,
    factor: i64,
}

impl PipelineElement for Multiply {
    fn process_frame(
        &mut self,
        _ctx: &mut ElementContext<'_>,
        inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        let value = inputs.get(&self.input).and_then(SValue::as_int).unwrap_or(0);
        (
            StreamEvent::Okay,
            [(self.output.clone(), SValue::Int(value * self.factor))].into(),
        )
    }
}

/// All declared inputs summed into the single output.
struct Sum {
    inputs: Vec<String>,
    output: String,
}

impl PipelineElement for Sum {
    fn process_frame(
        &mut self,
        _ctx: &mut ElementContext<'_>,
        inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        let total: i64 = self
            .inputs
            .iter()
            .filter_map(|name| inputs.get(name).and_then(SValue::as_int))
            .sum();
        (
            StreamEvent::Okay,
            [(self.output.clone(), SValue::Int(total))].into(),
        )
    }
}

/// Passes `in + amount` through, except it fails the frame when the input
/// equals `fail_on`.
struct FailOn {
    input: String,
    output: String,
    fail_on: i64,
}

impl PipelineElement for FailOn {
    fn process_frame(
        &mut self,
        _ctx: &mut ElementContext<'_>,
        inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        let value = inputs.get(&self.input).and_then(SValue::as_int).unwrap_or(0);
        if value == self.fail_on {
            return (StreamEvent::error("poisoned value"), HashMap::new());
        }
        (
            StreamEvent::Okay,
            [(self.output.clone(), SValue::Int(value + 1))].into(),
        )
    }
}

/// Withholds its output on the first frame of each stream, then maps
/// `out = in + 100`.
struct SkipFirst {
    input: String,
    output: String,
    seen: i64,
}

impl PipelineElement for SkipFirst {
    fn process_frame(
        &mut self,
        _ctx: &mut ElementContext<'_>,
        inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        self.seen += 1;
        if self.seen == 1 {
            return (StreamEvent::Okay, HashMap::new());
        }
        let value = inputs.get(&self.input).and_then(SValue::as_int).unwrap_or(0);
        (
            StreamEvent::Okay,
            [(self.output.clone(), SValue::Int(value + 100))].into(),
        )
    }
}

/// Source element: generates one frame carrying `output = 5` when its
/// stream starts, and is pass-through afterwards.
struct Seeder {
    output: String,
}

impl PipelineElement for Seeder {
    fn start_stream(&mut self, ctx: &mut ElementContext<'_>) -> StreamEvent {
        ctx.create_frame([(self.output.clone(), SValue::Int(5))].into());
        StreamEvent::Okay
    }

    fn process_frame(
        &mut self,
        _ctx: &mut ElementContext<'_>,
        _inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        (StreamEvent::Okay, HashMap::new())
    }
}

/// Records every lifecycle and frame call into a shared journal.
struct Recorder {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
}

impl PipelineElement for Recorder {
    fn start_stream(&mut self, ctx: &mut ElementContext<'_>) -> StreamEvent {
        self.journal
            .lock()
            .unwrap()
            .push(format!("start:{}:{}", self.name, ctx.stream_id));
        StreamEvent::Okay
    }

    fn process_frame(
        &mut self,
        ctx: &mut ElementContext<'_>,
        _inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        self.journal.lock().unwrap().push(format!(
            "frame:{}:{}:{}",
            self.name, ctx.stream_id, ctx.frame_id
        ));
        (StreamEvent::Okay, HashMap::new())
    }

    fn stop_stream(&mut self, ctx: &mut ElementContext<'_>) -> StreamEvent {
        self.journal
            .lock()
            .unwrap()
            .push(format!("stop:{}:{}", self.name, ctx.stream_id));
        StreamEvent::Okay
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn int_parameter(definition: &ElementDefinition, name: &str, default: i64) -> i64 {
    definition
        .parameters
        .get(name)
        .and_then(|value| value.as_i64())
        .unwrap_or(default)
}

fn single_ports(definition: &ElementDefinition) -> (String, String) {
    (
        definition.input[0].name.clone(),
        definition.output[0].name.clone(),
    )
}

fn test_registry(journal: Arc<Mutex<Vec<String>>>) -> ElementRegistry {
    let mut registry = ElementRegistry::with_builtins();
    registry.register("test_elements", "Add", |definition: &ElementDefinition| {
        let (input, output) = single_ports(definition);
        let amount = int_parameter(definition, "amount", 1);
        Ok(Box::new(Add { input, output, amount }) as Box<dyn PipelineElement>)
    });
    registry.register(
        "test_elements",
        "Multiply",
        |definition: &ElementDefinition| {
            let (input, output) = single_ports(definition);
            let factor = int_parameter(definition, "factor", 2);
            Ok(Box::new(Multiply { input, output, factor }) as Box<dyn PipelineElement>)
        },
    );
    registry.register("test_elements", "Sum", |definition: &ElementDefinition| {
        let inputs = definition
            .input
            .iter()
            .map(|port| port.name.clone())
            .collect();
        let output = definition.output[0].name.clone();
        Ok(Box::new(Sum { inputs, output }) as Box<dyn PipelineElement>)
    });
    registry.register(
        "test_elements",
        "FailOn",
        |definition: &ElementDefinition| {
            let (input, output) = single_ports(definition);
            let fail_on = int_parameter(definition, "fail_on", 0);
            Ok(Box::new(FailOn { input, output, fail_on }) as Box<dyn PipelineElement>)
        },
    );
    registry.register(
        "test_elements",
        "SkipFirst",
        |definition: &ElementDefinition| {
            let (input, output) = single_ports(definition);
            Ok(Box::new(SkipFirst { input, output, seen: 0 }) as Box<dyn PipelineElement>)
        },
    );
    registry.register(
        "test_elements",
        "Seeder",
        |definition: &ElementDefinition| {
            let output = definition.output[0].name.clone();
            Ok(Box::new(Seeder { output }) as Box<dyn PipelineElement>)
        },
    );
    registry.register(
        "test_elements",
        "Recorder",
        move |definition: &ElementDefinition| {
            Ok(Box::new(Recorder {
                name: definition.name.clone(),
                journal: journal.clone(),
            }) as Box<dyn PipelineElement>)
        },
    );
    registry
}

fn build(definition_json: &str) -> PipelineActor {
    build_with_journal(definition_json, Arc::new(Mutex::new(Vec::new())))
}

fn build_with_journal(definition_json: &str, journal: Arc<Mutex<Vec<String>>>) -> PipelineActor {
    let definition = PipelineDefinition::parse(definition_json).unwrap();
    PipelineActor::build(definition, &test_registry(journal)).unwrap()
}

fn context() -> ActorContext {
    ActorContext::new(1, TopicPath::parse("aiko/h/1/1").unwrap(), None)
}

fn publishes(ctx: &mut ActorContext) -> Vec<(String, String)> {
    ctx.take_actions()
        .into_iter()
        .filter_map(|action| match action {
            Action::Publish { topic, payload, .. } => Some((topic, payload)),
            _ => None,
        })
        .collect()
}

fn send(pipeline: &mut PipelineActor, ctx: &mut ActorContext, payload: &str) {
    let command = Command::parse(payload).unwrap();
    pipeline.on_command(&command, ctx).unwrap();
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

const LINEAR: &str = r#"{
    "version": 0, "name": "p_linear", "runtime": "rust",
    "graph": ["(PE_0 PE_1)"],
    "elements": [
        {"name": "PE_0",
         "input": [{"name": "a", "type": "int"}],
         "output": [{"name": "b", "type": "int"}],
         "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
        {"name": "PE_1",
         "input": [{"name": "b", "type": "int"}],
         "output": [{"name": "f", "type": "int"}],
         "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}}
    ]
}"#;

#[test]
fn linear_pipeline_adds_twice() {
    let mut pipeline = build(LINEAR);
    let mut ctx = context();

    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0) (a: 0))",
    );

    let published = publishes(&mut ctx);
    assert_eq!(
        published,
        vec![(
            "aiko/h/1/1/out".to_string(),
            "(process_frame (f: 2))".to_string()
        )]
    );
    // Headless operation auto-created the stream.
    assert!(pipeline.stream("0").is_some());
}

#[test]
fn diamond_fan_in_waits_for_both_branches() {
    let definition = r#"{
        "version": 0, "name": "p_diamond", "runtime": "rust",
        "graph": ["(PE_1 (PE_2 PE_4) (PE_3 PE_4))"],
        "elements": [
            {"name": "PE_1",
             "input": [{"name": "b", "type": "int"}],
             "output": [{"name": "c", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "PE_2",
             "input": [{"name": "c", "type": "int"}],
             "output": [{"name": "d", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Multiply"}}},
            {"name": "PE_3",
             "input": [{"name": "c", "type": "int"}],
             "output": [{"name": "e", "type": "int"}],
             "parameters": {"amount": 10},
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "PE_4",
             "input": [{"name": "d", "type": "int"}, {"name": "e", "type": "int"}],
             "output": [{"name": "f", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Sum"}}}
        ]
    }"#;
    let mut pipeline = build(definition);
    let mut ctx = context();

    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0) (b: 0))",
    );

    // c = 1, d = 2, e = 11, f = 13
    let published = publishes(&mut ctx);
    assert_eq!(published.last().unwrap().1, "(process_frame (f: 13))");
}

#[test]
fn stream_lifecycle_stops_in_reverse_order() {
    let definition = r#"{
        "version": 0, "name": "p_life", "runtime": "rust",
        "graph": ["(REC_A REC_B)"],
        "elements": [
            {"name": "REC_A",
             "deploy": {"local": {"module": "test_elements", "class_name": "Recorder"}}},
            {"name": "REC_B",
             "deploy": {"local": {"module": "test_elements", "class_name": "Recorder"}}}
        ]
    }"#;
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = build_with_journal(definition, journal.clone());
    let mut ctx = context();

    send(&mut pipeline, &mut ctx, "(create_stream 7 () 10)");
    for frame_id in 0..3 {
        send(
            &mut pipeline,
            &mut ctx,
            &format!("(process_frame (stream_id: 7 frame_id: {frame_id}) ())"),
        );
    }
    send(&mut pipeline, &mut ctx, "(destroy_stream 7)");
    assert!(pipeline.stream("7").is_none());

    let journal = journal.lock().unwrap();
    assert_eq!(
        *journal,
        vec![
            "start:REC_A:7",
            "start:REC_B:7",
            "frame:REC_A:7:0",
            "frame:REC_B:7:0",
            "frame:REC_A:7:1",
            "frame:REC_B:7:1",
            "frame:REC_A:7:2",
            "frame:REC_B:7:2",
            "stop:REC_B:7",
            "stop:REC_A:7"
        ]
    );
}

#[test]
fn duplicate_stream_is_rejected() {
    let mut pipeline = build(LINEAR);
    let mut ctx = context();

    send(&mut pipeline, &mut ctx, "(create_stream 7 () 10)");
    send(&mut pipeline, &mut ctx, "(create_stream 7 () 10)");
    assert_eq!(pipeline.stream_count(), 1);
}

#[test]
fn frame_error_is_isolated_to_the_frame() {
    let definition = r#"{
        "version": 0, "name": "p_fail", "runtime": "rust",
        "graph": ["(PE_0 BOOM)"],
        "elements": [
            {"name": "PE_0",
             "input": [{"name": "a", "type": "int"}],
             "output": [{"name": "b", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "BOOM",
             "input": [{"name": "b", "type": "int"}],
             "output": [{"name": "f", "type": "int"}],
             "parameters": {"fail_on": 1},
             "deploy": {"local": {"module": "test_elements", "class_name": "FailOn"}}}
        ]
    }"#;
    let mut pipeline = build(definition);
    let mut ctx = context();

    // Frame 0: a=0 → b=1 → poisoned, no reply.
    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0) (a: 0))",
    );
    assert!(publishes(&mut ctx).is_empty());

    // Frame 1 on the same stream still flows.
    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 1) (a: 10))",
    );
    let published = publishes(&mut ctx);
    assert_eq!(published.last().unwrap().1, "(process_frame (f: 12))");
}

#[test]
fn reply_to_keyword_overrides_the_out_topic() {
    let mut pipeline = build(LINEAR);
    let mut ctx = context();

    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0 reply_to: aiko/h/3/1/in) (a: 0))",
    );

    let published = publishes(&mut ctx);
    assert_eq!(
        published,
        vec![(
            "aiko/h/3/1/in".to_string(),
            "(process_frame (f: 2))".to_string()
        )]
    );
}

#[test]
fn remote_element_pauses_and_resumes_the_frame() {
    let definition = r#"{
        "version": 0, "name": "p_remote", "runtime": "rust",
        "graph": ["(PE_0 PE_1)"],
        "elements": [
            {"name": "PE_0",
             "input": [{"name": "a", "type": "int"}],
             "output": [{"name": "b", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "PE_1",
             "input": [{"name": "b", "type": "int"}],
             "output": [{"name": "f", "type": "int"}],
             "deploy": {"remote": {"service_filter": {"name": "p_local"}}}}
        ]
    }"#;
    let mut pipeline = build(definition);
    let mut ctx = context();

    // Registrar appears: expect a share request for the remote filter.
    pipeline.on_registrar(
        &RegistrarEvent::Found {
            topic_path: "aiko/h/5/1".into(),
        },
        &mut ctx,
    );
    let actions = ctx.take_actions();
    assert!(actions
        .iter()
        .any(|action| matches!(action, Action::Subscribe { pattern } if pattern == "aiko/h/5/1/out")));
    let share = actions
        .iter()
        .find_map(|action| match action {
            Action::Publish { topic, payload, .. } if topic == "aiko/h/5/1/in" => Some(payload),
            _ => None,
        })
        .expect("share request");
    assert_eq!(share, "(share aiko/h/1/1/in p_local * * * ())");

    // Discovery response resolves the proxy.
    send(
        &mut pipeline,
        &mut ctx,
        "(add (aiko/h/9/1 p_local tester aiko/pipeline:0 mqtt ()))",
    );
    ctx.take_actions();

    // The frame runs PE_0 locally, then forwards to the remote and pauses.
    // Auto-creating the stream also forwarded a create_stream to the remote.
    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0) (a: 0))",
    );
    let published = publishes(&mut ctx);
    assert_eq!(
        published,
        vec![
            (
                "aiko/h/9/1/in".to_string(),
                "(create_stream 0 () 60)".to_string()
            ),
            (
                "aiko/h/9/1/in".to_string(),
                "(process_frame (stream_id: 0 frame_id: 0 response: aiko/h/1/1/in) (b: 1))"
                    .to_string()
            )
        ]
    );
    assert_eq!(pipeline.stream("0").unwrap().paused.len(), 1);

    // The remote's response resumes the frame; PE_1 was the tail, so its
    // outputs become the reply.
    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame_response (stream_id: 0 frame_id: 0) (f: 41))",
    );
    let published = publishes(&mut ctx);
    assert_eq!(
        published,
        vec![(
            "aiko/h/1/1/out".to_string(),
            "(process_frame (f: 41))".to_string()
        )]
    );
    assert!(pipeline.stream("0").unwrap().paused.is_empty());
}

#[test]
fn sliding_window_join_consumes_fifo_per_edge() {
    let definition = r#"{
        "version": 0, "name": "p_window", "runtime": "rust",
        "graph": ["(A (B D) (C D))"],
        "parameters": {"sliding_window": true},
        "elements": [
            {"name": "A",
             "input": [{"name": "a", "type": "int"}],
             "output": [{"name": "c", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "B",
             "input": [{"name": "c", "type": "int"}],
             "output": [{"name": "d", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "C",
             "input": [{"name": "c", "type": "int"}],
             "output": [{"name": "e", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "SkipFirst"}}},
            {"name": "D",
             "input": [{"name": "d", "type": "int"}, {"name": "e", "type": "int"}],
             "output": [{"name": "f", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Sum"}}}
        ]
    }"#;
    let mut pipeline = build(definition);
    let mut ctx = context();

    // Frame 0: C withholds its output, so the join defers.
    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0) (a: 10))",
    );
    let published = publishes(&mut ctx);
    assert_eq!(published.last().unwrap().1, "(process_frame ())");

    // Frame 1: the join fires with frame 0's buffered d (FIFO) and the new
    // e: f = 12 + 121 = 133.
    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 1) (a: 20))",
    );
    let published = publishes(&mut ctx);
    assert_eq!(published.last().unwrap().1, "(process_frame (f: 133))");
}

#[test]
fn metrics_element_reports_per_element_timings() {
    let definition = r#"{
        "version": 0, "name": "p_metrics", "runtime": "rust",
        "graph": ["(PE_0 METRICS)"],
        "elements": [
            {"name": "PE_0",
             "input": [{"name": "a", "type": "int"}],
             "output": [{"name": "b", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}},
            {"name": "METRICS",
             "parameters": {"rate": 1},
             "deploy": {"local": {"module": "aiko.elements", "class_name": "Metrics"}}}
        ]
    }"#;
    let mut pipeline = build(definition);
    let mut ctx = context();

    send(
        &mut pipeline,
        &mut ctx,
        "(process_frame (stream_id: 0 frame_id: 0) (a: 0))",
    );
    let published = publishes(&mut ctx);
    let metrics = published
        .iter()
        .find(|(_, payload)| payload.starts_with("(metrics "))
        .expect("metrics publish");
    assert!(metrics
        .1
        .starts_with("(metrics (stream_id: 0) (elements (PE_0: "));
}

#[test]
fn source_elements_generate_frames_on_stream_start() {
    let definition = r#"{
        "version": 0, "name": "p_seed", "runtime": "rust",
        "graph": ["(GEN SINK)"],
        "elements": [
            {"name": "GEN",
             "output": [{"name": "a", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Seeder"}}},
            {"name": "SINK",
             "input": [{"name": "a", "type": "int"}],
             "output": [{"name": "f", "type": "int"}],
             "deploy": {"local": {"module": "test_elements", "class_name": "Add"}}}
        ]
    }"#;
    let mut pipeline = build(definition);
    let mut ctx = context();

    // Starting the stream makes the source inject a frame, posted back into
    // the pipeline's own mailbox.
    send(&mut pipeline, &mut ctx, "(create_stream 3 () 10)");
    let posted = ctx
        .take_actions()
        .into_iter()
        .find_map(|action| match action {
            Action::Post { command } => Some(command),
            _ => None,
        })
        .expect("generated frame posted");
    assert_eq!(posted.method, "process_frame");

    // The runtime would drain the mailbox; deliver the frame by hand.
    pipeline.on_command(&posted, &mut ctx).unwrap();
    let published = publishes(&mut ctx);
    assert_eq!(published.last().unwrap().1, "(process_frame (f: 6))");
}

// ── Load-time failures ────────────────────────────────────────────────────────

#[test]
fn unknown_local_module_fails_startup() {
    let definition = r#"{
        "version": 0, "name": "p_missing", "runtime": "rust",
        "graph": ["(PE_0)"],
        "elements": [
            {"name": "PE_0", "deploy": {"local": {"module": "nope"}}}
        ]
    }"#;
    let parsed = PipelineDefinition::parse(definition).unwrap();
    let registry = test_registry(Arc::new(Mutex::new(Vec::new())));
    let error = PipelineActor::build(parsed, &registry).unwrap_err();
    assert!(matches!(error, PipelineError::Load { .. }));
    assert!(error.to_string().contains("nope.PE_0 could not be found"));
}

#[test]
fn graph_reference_to_undefined_element_fails_startup() {
    let definition = r#"{
        "version": 0, "name": "p_undefined", "runtime": "rust",
        "graph": ["(PE_0 GHOST)"],
        "elements": [
            {"name": "PE_0", "deploy": {"local": {"module": "test_elements", "class_name": "Recorder"}}}
        ]
    }"#;
    let parsed = PipelineDefinition::parse(definition).unwrap();
    let registry = test_registry(Arc::new(Mutex::new(Vec::new())));
    let error = PipelineActor::build(parsed, &registry).unwrap_err();
    assert!(matches!(error, PipelineError::Invariant(_)));
    assert!(error.to_string().contains("GHOST"));
}
