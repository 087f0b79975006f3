//! The broker connection task.
//!
//! Owns the `rumqttc` client and event loop. Runs until shutdown or until
//! reconnection gives up. All I/O initiated by the rest of the process
//! arrives as [`TransportCommand`]s; everything inbound leaves as
//! [`TransportEvent`]s.

use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, LastWill as MqttLastWill, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::TransportEvent;
use crate::{Backoff, TransportOptions};

/// Consecutive connection failures tolerated before the transport is
/// declared dead and the process exits with a transport failure.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

// ── TransportCommand ──────────────────────────────────────────────────────────

/// Commands sent from the [`crate::MqttTransport`] handle into the task.
#[derive(Debug)]
pub enum TransportCommand {
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Subscribe {
        pattern: String,
    },
    Unsubscribe {
        pattern: String,
    },
    Shutdown,
}

// ── MqttTask ──────────────────────────────────────────────────────────────────

pub struct MqttTask {
    client: AsyncClient,
    event_loop: rumqttc::EventLoop,
    cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    /// Outstanding patterns, restored in order after every reconnect.
    subscriptions: Vec<String>,
    backoff: Backoff,
    consecutive_failures: u32,
    connected: bool,
}

impl MqttTask {
    pub fn new(
        options: &TransportOptions,
        cmd_rx: mpsc::Receiver<TransportCommand>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.host.clone(),
            options.port,
        );
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        if options.tls {
            mqtt_options.set_transport(Transport::Tls(TlsConfiguration::Native));
        }
        if let Some(will) = &options.last_will {
            mqtt_options.set_last_will(MqttLastWill::new(
                will.topic.clone(),
                will.payload.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
        Self {
            client,
            event_loop,
            cmd_rx,
            event_tx,
            subscriptions: Vec::new(),
            backoff: Backoff::new(),
            consecutive_failures: 0,
            connected: false,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                // ── Broker events ─────────────────────────────────────────────
                result = self.event_loop.poll() => {
                    if !self.handle_poll(result).await {
                        return;
                    }
                }

                // ── Commands from the handle ──────────────────────────────────
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Publish { topic, payload, retain }) => {
                            if let Err(e) = self
                                .client
                                .publish(&topic, QoS::AtLeastOnce, retain, payload)
                                .await
                            {
                                warn!(%e, %topic, "publish failed");
                            }
                        }
                        Some(TransportCommand::Subscribe { pattern }) => {
                            if !self.subscriptions.contains(&pattern) {
                                self.subscriptions.push(pattern.clone());
                            }
                            if let Err(e) =
                                self.client.subscribe(&pattern, QoS::AtLeastOnce).await
                            {
                                warn!(%e, %pattern, "subscribe failed");
                            }
                        }
                        Some(TransportCommand::Unsubscribe { pattern }) => {
                            self.subscriptions.retain(|p| p != &pattern);
                            if let Err(e) = self.client.unsubscribe(&pattern).await {
                                warn!(%e, %pattern, "unsubscribe failed");
                            }
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            info!("transport task shutting down");
                            let _ = self.client.disconnect().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handle one poll outcome. Returns `false` when the task must exit.
    async fn handle_poll(
        &mut self,
        result: Result<Event, rumqttc::ConnectionError>,
    ) -> bool {
        match result {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("broker connected");
                self.connected = true;
                self.consecutive_failures = 0;
                self.backoff.on_success();
                // Restore subscriptions before any new message is delivered.
                for pattern in &self.subscriptions {
                    if let Err(e) = self.client.subscribe(pattern, QoS::AtLeastOnce).await {
                        warn!(%e, %pattern, "re-subscribe failed");
                    }
                }
                self.emit(TransportEvent::Connected).await;
                true
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                self.emit(TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload,
                    retain: publish.retain,
                })
                .await;
                true
            }
            Ok(_) => true,
            Err(e) => {
                if self.connected {
                    self.connected = false;
                    self.emit(TransportEvent::Disconnected).await;
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                    warn!(%e, "giving up on broker reconnection");
                    self.emit(TransportEvent::Failed {
                        reason: e.to_string(),
                    })
                    .await;
                    return false;
                }
                let delay = self.backoff.next_delay();
                warn!(%e, ?delay, attempt = self.backoff.attempt(), "broker connection lost");
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    async fn emit(&mut self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}
