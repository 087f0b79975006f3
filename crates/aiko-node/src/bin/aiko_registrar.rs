//! Registrar process.
//!
//! ```bash
//! AIKO_LOG_LEVEL=debug aiko_registrar
//! ```
//!
//! Elects itself primary through the retained boot topic (or stands by as
//! secondary when a primary already exists) and maintains the table of live
//! services. Exit code 0 on graceful termination, 2 on transport failure.

use anyhow::Result;
use clap::Parser;

use aiko_engine::{logging, ProcessRuntime, RegistrarActor};
use aiko_types::Config;

#[derive(Parser)]
#[command(
    name = "aiko_registrar",
    version,
    about = "Aiko Services Registrar: service discovery for the bus"
)]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let bus_log = logging::init(&config);
    let _cli = Cli::parse();

    let mut runtime = ProcessRuntime::new(config.clone());
    let (_service_id, topic_path) = runtime.add_actor(Box::new(RegistrarActor::new(config)));
    bus_log.attach(runtime.handle(), topic_path.log_topic());

    let handle = runtime.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.terminate(0).await;
        }
    });

    let exit = runtime.run().await;
    std::process::exit(exit.code());
}
