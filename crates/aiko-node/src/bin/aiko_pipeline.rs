//! Pipeline process.
//!
//! ```bash
//! aiko_pipeline create definition.json
//! aiko_pipeline create definition.json --stream-id 1 --frame-data "(a: 0)"
//! aiko_pipeline delete aiko/localhost/12345/1
//! ```
//!
//! Exit codes: 0 graceful termination, 1 definition parse/load failure,
//! 2 transport failure.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use aiko_engine::{logging, Command, ProcessRuntime};
use aiko_net::{LastWill, MqttTransport, TransportEvent, TransportOptions};
use aiko_pipeline::{ElementRegistry, PipelineActor, PipelineDefinition};
use aiko_sexpr::SValue;
use aiko_types::Config;

#[derive(Parser)]
#[command(
    name = "aiko_pipeline",
    version,
    about = "Create and destroy Aiko Services pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Start a pipeline actor from a definition document.
    Create {
        /// Pipeline definition pathname (JSON, or the S-expression form).
        definition: PathBuf,

        /// Override the pipeline actor name.
        #[arg(long, short)]
        name: Option<String>,

        /// Create a stream with this identifier at startup.
        #[arg(long, short)]
        stream_id: Option<i64>,

        /// Stream grace time in seconds.
        #[arg(long, short, default_value_t = 60)]
        grace_time: u64,

        /// Process one frame at startup, e.g. "(a: 0)".
        #[arg(long, short)]
        frame_data: Option<String>,
    },

    /// Send `(terminate)` to a running pipeline.
    Delete {
        /// Topic path of the pipeline actor.
        topic_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let bus_log = logging::init(&config);

    match Cli::parse().command {
        Cmd::Create {
            definition,
            name,
            stream_id,
            grace_time,
            frame_data,
        } => run_create(config, bus_log, definition, name, stream_id, grace_time, frame_data).await,
        Cmd::Delete { topic_path } => run_delete(config, topic_path).await,
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

async fn run_create(
    config: Config,
    bus_log: logging::BusLog,
    definition_path: PathBuf,
    name: Option<String>,
    stream_id: Option<i64>,
    grace_time: u64,
    frame_data: Option<String>,
) -> Result<()> {
    let mut definition = match PipelineDefinition::load(&definition_path) {
        Ok(definition) => definition,
        Err(e) => {
            error!(path = %definition_path.display(), %e, "definition load failed");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(name) = name {
        definition.name = name;
    }

    let registry = ElementRegistry::with_builtins();
    let pipeline = match PipelineActor::build(definition, &registry) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(%e, "pipeline startup failed");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut runtime = ProcessRuntime::new(config);
    let (service_id, topic_path) = runtime.add_actor(Box::new(pipeline));
    bus_log.attach(runtime.handle(), topic_path.log_topic());
    println!("MQTT topic: {}", topic_path.in_topic());

    let handle = runtime.handle();
    if let Some(stream_id) = stream_id {
        handle
            .post(
                service_id,
                Command::new(
                    "create_stream",
                    vec![
                        SValue::Int(stream_id),
                        SValue::List(vec![]),
                        SValue::Int(grace_time as i64),
                    ],
                ),
            )
            .await;
    }
    if let Some(frame_data) = frame_data {
        let data = match aiko_sexpr::parse(&frame_data) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("frame data: {e}");
                std::process::exit(1);
            }
        };
        let meta = SValue::map_of(vec![
            ("stream_id", SValue::Int(stream_id.unwrap_or(0))),
            ("frame_id", SValue::Int(0)),
        ]);
        handle
            .post(service_id, Command::new("process_frame", vec![meta, data]))
            .await;
    }

    let ctrl_c_handle = runtime.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_handle.terminate(0).await;
        }
    });

    let exit = runtime.run().await;
    std::process::exit(exit.code());
}

// ── Delete ────────────────────────────────────────────────────────────────────

/// One-shot client: connect, publish `(terminate)` to the pipeline's `in`
/// topic, disconnect.
async fn run_delete(config: Config, topic_path: String) -> Result<()> {
    let options = TransportOptions {
        client_id: format!("{}-cli-{}", config.namespace, std::process::id()),
        host: config.mqtt_host.clone(),
        port: config.mqtt_port,
        tls: config.mqtt_tls,
        last_will: None::<LastWill>,
    };
    let (transport, mut events) = MqttTransport::connect(options);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => {
                eprintln!("timed out connecting to the broker");
                std::process::exit(2);
            }
        };
        match event {
            Some(TransportEvent::Connected) => break,
            Some(TransportEvent::Failed { reason }) => {
                eprintln!("transport failed: {reason}");
                std::process::exit(2);
            }
            None => {
                eprintln!("transport failed: event channel closed");
                std::process::exit(2);
            }
            Some(_) => {}
        }
    }

    let in_topic = format!("{topic_path}/in");
    transport.publish(&in_topic, "(terminate)", false).await?;
    println!("terminate sent to {in_topic}");

    // Give the in-flight publish a moment before disconnecting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.shutdown().await?;
    Ok(())
}
