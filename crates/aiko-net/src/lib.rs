//! MQTT transport layer.
//!
//! Adapts an external MQTT broker to the process runtime's mailbox model.
//! [`MqttTransport`] is the handle; a background `tokio` task owns the
//! `rumqttc` event loop and communicates through two channels:
//!
//! - `cmd_tx`: publish / subscribe / shutdown commands **into** the task
//! - `event_rx`: [`TransportEvent`]s (inbound messages, connectivity) **out**
//!
//! On reconnect the task re-subscribes every outstanding pattern before any
//! new inbound message is forwarded. Repeated connection failures back off
//! exponentially (1 s base, 30 s cap, ±20 % jitter) and eventually surface
//! [`TransportEvent::Failed`].

// ── Module declarations ───────────────────────────────────────────────────────

mod backoff;
mod client;
mod error;
mod events;
mod topic;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use backoff::Backoff;
pub use error::TransportError;
pub use events::TransportEvent;
pub use topic::topic_matches;

// ── Imports ───────────────────────────────────────────────────────────────────

use tokio::sync::mpsc;

use crate::client::{MqttTask, TransportCommand};

/// Internal channel buffer. 256 slots absorbs inbound bursts without
/// dropping events under normal single-broker conditions.
const CHANNEL_CAPACITY: usize = 256;

// ── Options ───────────────────────────────────────────────────────────────────

/// Connection settings plus the optional last-will message the broker
/// publishes on our behalf if the process vanishes.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub last_will: Option<LastWill>,
}

#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

// ── MqttTransport ─────────────────────────────────────────────────────────────

/// Handle to the broker connection. Cheap to clone; all operations post
/// commands into the background task.
#[derive(Clone)]
pub struct MqttTransport {
    cmd_tx: mpsc::Sender<TransportCommand>,
}

impl MqttTransport {
    /// Spawn the connection task. Returns immediately; connectivity is
    /// reported through the event channel.
    pub fn connect(options: TransportOptions) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(CHANNEL_CAPACITY);

        let task = MqttTask::new(&options, cmd_rx, event_tx);
        tokio::spawn(task.run());

        (Self { cmd_tx }, event_rx)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.send(TransportCommand::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        })
        .await
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.send(TransportCommand::Subscribe {
            pattern: pattern.to_string(),
        })
        .await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.send(TransportCommand::Unsubscribe {
            pattern: pattern.to_string(),
        })
        .await
    }

    /// Signal the connection task to disconnect and exit.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.send(TransportCommand::Shutdown).await
    }

    async fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| TransportError::TaskStopped)
    }
}
