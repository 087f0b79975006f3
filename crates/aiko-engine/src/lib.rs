//! Process runtime.
//!
//! One process hosts any number of services on a single cooperative event
//! loop: every actor callback (command dispatch, timer fire, raw message,
//! registrar change) runs inline on the loop task, never concurrently with
//! another. The MQTT transport lives in its own task and only talks to the
//! loop through channels, which is the sole suspension boundary.
//!
//! The layering is composition, not inheritance: a [`ProcessRuntime`] *has*
//! actors, an [`Actor`] *is addressed as* a service, and the distinguished
//! [`RegistrarActor`] is just another actor with an election state machine.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod actor;
pub mod discovery;
pub mod event;
pub mod logging;
pub mod process;
pub mod proxy;
pub mod registrar;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use actor::{Action, Actor, ActorContext, ActorError, ActorInfo, Command, RegistrarEvent};
pub use discovery::{Discovery, DiscoveryEvent};
pub use event::{TimerId, Timers};
pub use process::{Process, ProcessExit, ProcessRuntime};
pub use proxy::RemoteProxy;
pub use registrar::{RegistrarActor, PROTOCOL_REGISTRAR};
