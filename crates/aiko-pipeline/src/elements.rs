//! Bundled pipeline elements.
//!
//! `Metrics` publishes per-element frame timings at a configured rate.
//! `Inspect` is pass-through with side effects: it serializes selected swag
//! entries to a target (`log`, `print`, or `file:<path>`) without touching
//! the frame.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;

use tracing::{info, warn};

use aiko_sexpr::{generate, SValue};

use crate::element::{ElementContext, PipelineElement};
use crate::registry::ElementRegistry;
use crate::stream::StreamEvent;

pub const BUILTIN_MODULE: &str = "aiko.elements";

pub fn register_builtins(registry: &mut ElementRegistry) {
    registry.register(
        BUILTIN_MODULE,
        "Metrics",
        |_definition: &crate::definition::ElementDefinition| {
            Ok(Box::new(Metrics::default()) as Box<dyn PipelineElement>)
        },
    );
    registry.register(
        BUILTIN_MODULE,
        "Inspect",
        |_definition: &crate::definition::ElementDefinition| {
            Ok(Box::new(Inspect::default()) as Box<dyn PipelineElement>)
        },
    );
}

fn stream_id_value(stream_id: &str) -> SValue {
    match stream_id.parse::<i64>() {
        Ok(n) => SValue::Int(n),
        Err(_) => SValue::symbol(stream_id),
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

const METRICS_DEFAULT_RATE: i64 = 10;

/// Publishes `(metrics (stream_id: …) (elements (name: us …)))` on the
/// pipeline's `out` topic every `rate` frames.
#[derive(Default)]
pub struct Metrics {
    frames_seen: HashMap<String, i64>,
}

impl PipelineElement for Metrics {
    fn process_frame(
        &mut self,
        ctx: &mut ElementContext<'_>,
        _inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        let rate = ctx
            .get_parameter("rate")
            .and_then(|value| value.as_int())
            .unwrap_or(METRICS_DEFAULT_RATE)
            .max(1);

        let seen = self.frames_seen.entry(ctx.stream_id.to_string()).or_insert(0);
        *seen += 1;
        if *seen % rate == 0 {
            let timings: Vec<(SValue, SValue)> = ctx
                .metrics
                .elements
                .iter()
                .map(|(name, duration)| {
                    (SValue::symbol(name), SValue::Int(duration.as_micros() as i64))
                })
                .collect();
            let payload = generate(&SValue::List(vec![
                SValue::symbol("metrics"),
                SValue::Map(vec![(
                    SValue::symbol("stream_id"),
                    stream_id_value(ctx.stream_id),
                )]),
                SValue::List(vec![SValue::symbol("elements"), SValue::Map(timings)]),
            ]));
            let topic = ctx.out_topic.to_string();
            ctx.publish(&topic, &payload);
        }
        (StreamEvent::Okay, HashMap::new())
    }

    fn stop_stream(&mut self, ctx: &mut ElementContext<'_>) -> StreamEvent {
        self.frames_seen.remove(ctx.stream_id);
        StreamEvent::Okay
    }
}

// ── Inspect ───────────────────────────────────────────────────────────────────

enum InspectTarget {
    Log,
    Print,
    File(File),
}

/// Pass-through probe. Parameters: `select` is the port names to capture
/// (or `*` for the whole swag); `target` is `log`, `print`, or `file:<path>`.
#[derive(Default)]
pub struct Inspect {
    target: Option<InspectTarget>,
}

impl Inspect {
    fn resolve_target(&mut self, ctx: &ElementContext<'_>) -> StreamEvent {
        let target = ctx
            .get_parameter("target")
            .and_then(|value| value.as_text().map(str::to_string))
            .unwrap_or_else(|| "log".to_string());

        self.target = if let Some(path) = target.strip_prefix("file:") {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(InspectTarget::File(file)),
                Err(e) => {
                    return StreamEvent::error(format!("inspect target {path}: {e}"));
                }
            }
        } else if target == "print" {
            Some(InspectTarget::Print)
        } else {
            Some(InspectTarget::Log)
        };
        StreamEvent::Okay
    }

    fn selected(&self, ctx: &ElementContext<'_>) -> Vec<(SValue, SValue)> {
        let select = ctx.get_parameter("select");
        let names: Option<Vec<String>> = match &select {
            Some(SValue::List(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_text().map(str::to_string))
                    .collect(),
            ),
            Some(value) if value.as_text() == Some("*") => None,
            None => None,
            Some(other) => other.as_text().map(|name| vec![name.to_string()]),
        };

        match names {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    ctx.swag
                        .get(name)
                        .map(|value| (SValue::symbol(name), value.clone()))
                })
                .collect(),
            None => {
                let mut entries: Vec<(&String, &SValue)> = ctx.swag.iter().collect();
                entries.sort_by_key(|(name, _)| name.to_string());
                entries
                    .into_iter()
                    .map(|(name, value)| (SValue::symbol(name), value.clone()))
                    .collect()
            }
        }
    }
}

impl PipelineElement for Inspect {
    fn start_stream(&mut self, ctx: &mut ElementContext<'_>) -> StreamEvent {
        self.resolve_target(ctx)
    }

    fn process_frame(
        &mut self,
        ctx: &mut ElementContext<'_>,
        _inputs: &HashMap<String, SValue>,
    ) -> (StreamEvent, HashMap<String, SValue>) {
        if self.target.is_none() {
            // Stream was auto-created without start_stream having run here.
            let event = self.resolve_target(ctx);
            if event != StreamEvent::Okay {
                return (event, HashMap::new());
            }
        }

        let line = generate(&SValue::List(vec![
            SValue::symbol("inspect"),
            SValue::Map(vec![
                (SValue::symbol("stream_id"), stream_id_value(ctx.stream_id)),
                (SValue::symbol("frame_id"), SValue::Int(ctx.frame_id)),
            ]),
            SValue::Map(self.selected(ctx)),
        ]));

        match self.target.as_mut() {
            Some(InspectTarget::Log) => info!(target: "aiko_pipeline::inspect", "{line}"),
            Some(InspectTarget::Print) => println!("{line}"),
            Some(InspectTarget::File(file)) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(%e, "inspect write failed");
                }
            }
            None => {}
        }
        (StreamEvent::Okay, HashMap::new())
    }

    fn stop_stream(&mut self, ctx: &mut ElementContext<'_>) -> StreamEvent {
        if let Some(InspectTarget::File(file)) = self.target.as_mut() {
            let line = generate(&SValue::List(vec![
                SValue::symbol("stop_stream"),
                SValue::Map(vec![(
                    SValue::symbol("stream_id"),
                    stream_id_value(ctx.stream_id),
                )]),
            ]));
            if let Err(e) = writeln!(file, "{line}") {
                warn!(%e, "inspect write failed");
            }
        }
        StreamEvent::Okay
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
