//! Logging setup and distributed log shipping.
//!
//! `AIKO_LOG_LEVEL` (falling back to `RUST_LOG`) drives the filter. With
//! `AIKO_LOG_MQTT=all|true` a [`BusLogLayer`] forwards each record to a
//! `log` topic on the bus as `(log level target "message")`; `true`
//! suppresses the console output, `false` keeps logs local.
//!
//! Records emitted by the transport itself are never shipped: a broken
//! broker connection must not recurse into more bus traffic.

use std::sync::{Arc, OnceLock};

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use aiko_sexpr::{generate, SValue};
use aiko_types::Config;

use crate::process::Process;

// ── BusLog ────────────────────────────────────────────────────────────────────

/// Handle connecting the log layer to a running process. Until
/// [`attach`](Self::attach) is called, shipped records are dropped.
#[derive(Clone, Default)]
pub struct BusLog {
    target: Arc<OnceLock<(Process, String)>>,
}

impl BusLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the layer at a process handle and its `log` topic.
    pub fn attach(&self, process: Process, log_topic: String) {
        let _ = self.target.set((process, log_topic));
    }
}

// ── BusLogLayer ───────────────────────────────────────────────────────────────

pub struct BusLogLayer {
    bus: BusLog,
}

/// Crates whose records must stay off the bus to avoid feedback loops.
const SUPPRESSED_TARGETS: [&str; 2] = ["rumqttc", "aiko_net"];

impl<S> Layer<S> for BusLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let Some((process, log_topic)) = self.bus.target.get() else {
            return;
        };
        let metadata = event.metadata();
        if SUPPRESSED_TARGETS
            .iter()
            .any(|prefix| metadata.target().starts_with(prefix))
        {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let payload = generate(&SValue::List(vec![
            SValue::symbol("log"),
            SValue::symbol(metadata.level().as_str()),
            SValue::symbol(metadata.target()),
            SValue::Str(visitor.message),
        ]));
        process.try_publish(log_topic, &payload);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message
                .push_str(&format!("{}={value:?}", field.name()));
        }
    }
}

// ── Initialization ────────────────────────────────────────────────────────────

/// Install the global subscriber. Returns the [`BusLog`] to attach once the
/// process runtime exists.
pub fn init(config: &Config) -> BusLog {
    let filter = match &config.log_level {
        Some(level) => EnvFilter::new(level.to_lowercase()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let bus = BusLog::new();
    let console = config
        .log_destination
        .to_console()
        .then(tracing_subscriber::fmt::layer);
    let shipper = config.log_destination.to_bus().then(|| BusLogLayer {
        bus: bus.clone(),
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(shipper)
        .init();
    bus
}
