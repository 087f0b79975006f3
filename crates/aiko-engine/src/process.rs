//! The process event loop.
//!
//! [`ProcessRuntime`] owns every actor in the process and a single
//! `tokio::select!` loop over three sources: transport events, the command
//! mailbox, and the timer list. Handlers run inline, one at a time; a panic
//! inside a handler is caught and logged without stopping the loop.
//!
//! [`Process`] is the cloneable handle used by other threads and tasks
//! (worker results, the bus log layer, CLI helpers) to post into the loop.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use aiko_net::{topic_matches, LastWill, MqttTransport, TransportEvent, TransportOptions};
use aiko_sexpr::SValue;
use aiko_types::{Config, ServiceRecord, TopicPath};

use crate::actor::{Action, Actor, ActorContext, ActorError, Command, RegistrarEvent};
use crate::event::{TimerAction, Timers};

const COMMAND_CAPACITY: usize = 256;

/// Retained liveness marker for a registered service.
const STATE_RUNNING: &str = "(running)";
/// Last-will payload: the broker publishes this when the process vanishes.
const STATE_ABSENT: &str = "(absent)";

// ── ProcessExit ───────────────────────────────────────────────────────────────

/// How the event loop ended. A requested stop carries the exit code the
/// caller asked for; `Terminated(0)` is the graceful path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Terminated(i32),
    TransportFailure,
}

impl ProcessExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Terminated(code) => code,
            Self::TransportFailure => 2,
        }
    }
}

// ── ProcessCommand / Process handle ───────────────────────────────────────────

#[derive(Debug)]
pub enum ProcessCommand {
    Post { service_id: u32, command: Command },
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Terminate { exit_code: i32 },
}

/// Cloneable handle posting work into the event loop from any thread.
#[derive(Clone)]
pub struct Process {
    cmd_tx: mpsc::Sender<ProcessCommand>,
}

impl Process {
    pub async fn post(&self, service_id: u32, command: Command) {
        let _ = self
            .cmd_tx
            .send(ProcessCommand::Post {
                service_id,
                command,
            })
            .await;
    }

    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) {
        let _ = self
            .cmd_tx
            .send(ProcessCommand::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
                retain,
            })
            .await;
    }

    /// Non-blocking publish for synchronous callers (the bus log layer).
    /// Drops the payload when the mailbox is full rather than blocking.
    pub fn try_publish(&self, topic: &str, payload: &str) -> bool {
        self.cmd_tx
            .try_send(ProcessCommand::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
                retain: false,
            })
            .is_ok()
    }

    pub async fn terminate(&self, exit_code: i32) {
        let _ = self
            .cmd_tx
            .send(ProcessCommand::Terminate { exit_code })
            .await;
    }

    /// Worker-thread escape hatch: run `work` off the loop, then post its
    /// result back as `(method result…)` into the actor's mailbox.
    pub fn run_blocking<F>(&self, service_id: u32, method: &str, work: F)
    where
        F: FnOnce() -> Vec<SValue> + Send + 'static,
    {
        let cmd_tx = self.cmd_tx.clone();
        let method = method.to_string();
        tokio::task::spawn_blocking(move || {
            let args = work();
            let _ = cmd_tx.blocking_send(ProcessCommand::Post {
                service_id,
                command: Command::new(&method, args),
            });
        });
    }
}

// ── ProcessRuntime ────────────────────────────────────────────────────────────

struct ActorEntry {
    service_id: u32,
    topic_path: TopicPath,
    record: ServiceRecord,
    actor: Box<dyn Actor>,
}

pub struct ProcessRuntime {
    config: Config,
    transport: MqttTransport,
    transport_events: mpsc::Receiver<TransportEvent>,
    cmd_tx: mpsc::Sender<ProcessCommand>,
    cmd_rx: mpsc::Receiver<ProcessCommand>,
    actors: Vec<ActorEntry>,
    /// Extra `(pattern, actor index)` subscriptions made by actors.
    extra_subscriptions: Vec<(String, usize)>,
    timers: Timers,
    /// Topic path of the current primary Registrar.
    registrar: Option<String>,
    /// Self-posted commands, drained in FIFO order between events.
    pending: VecDeque<(usize, Command)>,
    hostname: String,
    process_id: String,
    exit: Option<ProcessExit>,
}

impl ProcessRuntime {
    /// Connect the transport (in the background) and prepare an empty
    /// process. Actors are added before [`run`](Self::run).
    pub fn new(config: Config) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "localhost".into());
        let process_id = std::process::id().to_string();
        let process_state_topic = format!(
            "{}/{}/{}/0/state",
            config.namespace, hostname, process_id
        );

        let options = TransportOptions {
            client_id: format!("{}-{}-{}", config.namespace, hostname, process_id),
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            tls: config.mqtt_tls,
            last_will: Some(LastWill {
                topic: process_state_topic,
                payload: STATE_ABSENT.to_string(),
                retain: true,
            }),
        };
        let (transport, transport_events) = MqttTransport::connect(options);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);

        Self {
            config,
            transport,
            transport_events,
            cmd_tx,
            cmd_rx,
            actors: Vec::new(),
            extra_subscriptions: Vec::new(),
            timers: Timers::new(),
            registrar: None,
            pending: VecDeque::new(),
            hostname,
            process_id,
            exit: None,
        }
    }

    pub fn handle(&self) -> Process {
        Process {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register an actor, assigning the next service id and topic path.
    pub fn add_actor(&mut self, actor: Box<dyn Actor>) -> (u32, TopicPath) {
        let service_id = self.actors.len() as u32 + 1;
        let topic_path = TopicPath::new(
            &self.config.namespace,
            &self.hostname,
            &self.process_id,
            service_id,
        );
        let info = actor.info();
        let owner = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let record = ServiceRecord {
            topic_path: topic_path.to_string(),
            name: info.name,
            owner,
            protocol: info.protocol,
            transport: "mqtt".into(),
            tags: info.tags,
        };
        info!(topic_path = %topic_path, name = %record.name, "service added");
        self.actors.push(ActorEntry {
            service_id,
            topic_path: topic_path.clone(),
            record,
            actor,
        });
        (service_id, topic_path)
    }

    /// Run the event loop to completion. Blocks until terminated or the
    /// transport gives up.
    pub async fn run(mut self) -> ProcessExit {
        let _ = self.transport.subscribe(&self.config.registrar_topic()).await;
        for index in 0..self.actors.len() {
            let in_topic = self.actors[index].topic_path.in_topic();
            let state_topic = self.actors[index].topic_path.state_topic();
            let _ = self.transport.subscribe(&in_topic).await;
            let _ = self.transport.publish(&state_topic, STATE_RUNNING, true).await;
        }
        for index in 0..self.actors.len() {
            self.dispatch(index, |actor, ctx| actor.on_start(ctx)).await;
        }

        let exit = loop {
            self.drain_pending().await;
            if let Some(exit) = self.exit.take() {
                break exit;
            }

            // Sleep to the earliest timer; "no timers" is just a long sleep.
            let deadline = self
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                event = self.transport_events.recv() => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            error!("transport event channel closed");
                            self.exit = Some(ProcessExit::TransportFailure);
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    if let Some(cmd) = cmd {
                        self.handle_command(cmd).await;
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    self.fire_timers().await;
                }
            }
        };

        if exit != ProcessExit::TransportFailure {
            self.shutdown().await;
        }
        exit
    }

    // ── Event handling ───────────────────────────────────────────────────

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                // Restore the retained liveness markers after a reconnect.
                for index in 0..self.actors.len() {
                    let state_topic = self.actors[index].topic_path.state_topic();
                    let _ = self.transport.publish(&state_topic, STATE_RUNNING, true).await;
                }
            }
            TransportEvent::Disconnected => {
                debug!("broker connection lost");
            }
            TransportEvent::Message { topic, payload, retain } => {
                self.route_message(&topic, &payload, retain).await;
            }
            TransportEvent::Failed { reason } => {
                error!(%reason, "transport failed");
                self.exit = Some(ProcessExit::TransportFailure);
            }
        }
    }

    async fn route_message(&mut self, topic: &str, payload: &str, retain: bool) {
        if topic == self.config.registrar_topic() {
            self.handle_registrar_boot(payload).await;
            return;
        }

        // Actor command mailboxes.
        if let Some(index) = self
            .actors
            .iter()
            .position(|entry| entry.topic_path.in_topic() == topic)
        {
            match Command::parse(payload) {
                Ok(command) => self.dispatch_command(index, command).await,
                Err(e) => warn!(%topic, %e, "unparseable command payload"),
            }
            return;
        }

        // Extra subscriptions (wildcards included).
        let matches: Vec<usize> = self
            .extra_subscriptions
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .map(|(_, index)| *index)
            .collect();
        for index in matches {
            let topic = topic.to_string();
            let payload = payload.to_string();
            self.dispatch(index, move |actor, ctx| {
                actor.on_message(&topic, &payload, retain, ctx)
            })
            .await;
        }
    }

    async fn handle_registrar_boot(&mut self, payload: &str) {
        let event = match parse_boot_payload(payload) {
            Some(event) => event,
            None => return,
        };
        match &event {
            RegistrarEvent::Found { topic_path } => {
                info!(registrar = %topic_path, "registrar found");
                self.registrar = Some(topic_path.clone());
                self.announce_services().await;
            }
            RegistrarEvent::Absent => {
                info!("registrar absent");
                self.registrar = None;
            }
        }
        for index in 0..self.actors.len() {
            let event = event.clone();
            self.dispatch(index, move |actor, ctx| actor.on_registrar(&event, ctx))
                .await;
        }
    }

    async fn announce_services(&mut self) {
        let Some(registrar) = self.registrar.clone() else {
            return;
        };
        let registrar_in = format!("{registrar}/in");
        for entry in &self.actors {
            let payload =
                Command::new("add", vec![entry.record.to_svalue()]).to_payload();
            let _ = self.transport.publish(&registrar_in, &payload, false).await;
        }
    }

    async fn handle_command(&mut self, command: ProcessCommand) {
        match command {
            ProcessCommand::Post {
                service_id,
                command,
            } => {
                if let Some(index) = self
                    .actors
                    .iter()
                    .position(|entry| entry.service_id == service_id)
                {
                    self.dispatch_command(index, command).await;
                } else {
                    warn!(service_id, "post to unknown service");
                }
            }
            ProcessCommand::Publish {
                topic,
                payload,
                retain,
            } => {
                let _ = self.transport.publish(&topic, &payload, retain).await;
            }
            ProcessCommand::Terminate { exit_code } => {
                self.exit = Some(ProcessExit::Terminated(exit_code));
            }
        }
    }

    async fn fire_timers(&mut self) {
        for action in self.timers.pop_due(Instant::now()) {
            match action {
                TimerAction::Notify { service_id, token } => {
                    if let Some(index) = self
                        .actors
                        .iter()
                        .position(|entry| entry.service_id == service_id)
                    {
                        self.dispatch(index, move |actor, ctx| actor.on_timer(token, ctx))
                            .await;
                    }
                }
                TimerAction::Publish {
                    topic,
                    payload,
                    retain,
                } => {
                    let _ = self.transport.publish(&topic, &payload, retain).await;
                }
            }
        }
    }

    async fn drain_pending(&mut self) {
        while let Some((index, command)) = self.pending.pop_front() {
            self.dispatch_command(index, command).await;
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    /// Run one callback on an actor, then execute its recorded actions.
    async fn dispatch<F>(&mut self, index: usize, callback: F)
    where
        F: FnOnce(&mut dyn Actor, &mut ActorContext),
    {
        let actions = {
            let registrar = self.registrar.clone();
            let entry = &mut self.actors[index];
            let mut ctx =
                ActorContext::new(entry.service_id, entry.topic_path.clone(), registrar);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                callback(entry.actor.as_mut(), &mut ctx)
            }));
            if outcome.is_err() {
                error!(service = %entry.record.name, "handler panicked; loop continues");
            }
            ctx.take_actions()
        };
        self.perform_actions(index, actions).await;
    }

    async fn dispatch_command(&mut self, index: usize, command: Command) {
        let actions = {
            let registrar = self.registrar.clone();
            let entry = &mut self.actors[index];
            let mut ctx =
                ActorContext::new(entry.service_id, entry.topic_path.clone(), registrar);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                entry.actor.on_command(&command, &mut ctx)
            }));
            match outcome {
                Ok(Ok(Some(result))) => {
                    let reply = crate::actor::reply_payload(&command.method, &result);
                    ctx.publish(&entry.topic_path.out_topic(), &reply);
                }
                Ok(Ok(None)) => {}
                Ok(Err(ActorError::UnknownMethod(method))) => {
                    warn!(service = %entry.record.name, %method, "unknown method dropped");
                }
                Ok(Err(ActorError::Failed(diagnostic))) => {
                    error!(
                        service = %entry.record.name,
                        method = %command.method,
                        %diagnostic,
                        "command handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        service = %entry.record.name,
                        method = %command.method,
                        "command handler panicked; loop continues"
                    );
                }
            }
            ctx.take_actions()
        };
        self.perform_actions(index, actions).await;
    }

    async fn perform_actions(&mut self, index: usize, actions: Vec<Action>) {
        let service_id = self.actors[index].service_id;
        for action in actions {
            match action {
                Action::Publish {
                    topic,
                    payload,
                    retain,
                } => {
                    let _ = self.transport.publish(&topic, &payload, retain).await;
                }
                Action::PublishLater {
                    delay,
                    topic,
                    payload,
                    retain,
                } => {
                    self.timers.add(
                        delay,
                        false,
                        TimerAction::Publish {
                            topic,
                            payload,
                            retain,
                        },
                    );
                }
                Action::Subscribe { pattern } => {
                    if !self
                        .extra_subscriptions
                        .iter()
                        .any(|(p, i)| *p == pattern && *i == index)
                    {
                        self.extra_subscriptions.push((pattern.clone(), index));
                    }
                    let _ = self.transport.subscribe(&pattern).await;
                }
                Action::Unsubscribe { pattern } => {
                    self.extra_subscriptions
                        .retain(|(p, i)| !(*p == pattern && *i == index));
                    if !self.extra_subscriptions.iter().any(|(p, _)| *p == pattern) {
                        let _ = self.transport.unsubscribe(&pattern).await;
                    }
                }
                Action::AddTimer {
                    period,
                    repeat,
                    token,
                } => {
                    self.timers
                        .add(period, repeat, TimerAction::Notify { service_id, token });
                }
                Action::RemoveTimer { token } => {
                    self.timers.remove_token(service_id, token);
                }
                Action::Post { command } => {
                    self.pending.push_back((index, command));
                }
                Action::Terminate { exit_code } => {
                    self.exit = Some(ProcessExit::Terminated(exit_code));
                }
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        for index in 0..self.actors.len() {
            self.dispatch(index, |actor, ctx| actor.on_stop(ctx)).await;
        }
        self.drain_pending().await;

        if let Some(registrar) = self.registrar.clone() {
            let registrar_in = format!("{registrar}/in");
            for entry in &self.actors {
                let payload = Command::new(
                    "remove",
                    vec![SValue::symbol(&entry.record.topic_path)],
                )
                .to_payload();
                let _ = self.transport.publish(&registrar_in, &payload, false).await;
            }
        }
        // Clear the retained liveness markers.
        for entry in &self.actors {
            let _ = self
                .transport
                .publish(&entry.topic_path.state_topic(), "", true)
                .await;
        }
        info!("process stopped");
        let _ = self.transport.shutdown().await;
    }
}

// ── Registrar boot payload ────────────────────────────────────────────────────

/// Parse the retained registrar boot payload. An empty payload is the reset
/// state and reads as "absent".
pub fn parse_boot_payload(payload: &str) -> Option<RegistrarEvent> {
    if payload.trim().is_empty() {
        return Some(RegistrarEvent::Absent);
    }
    let command = Command::parse(payload).ok()?;
    if command.method != "primary" {
        return None;
    }
    match command.arg(0).and_then(SValue::as_text) {
        Some("found") => {
            let topic_path = command.arg(1).and_then(SValue::as_text)?.to_string();
            Some(RegistrarEvent::Found { topic_path })
        }
        Some("absent") => Some(RegistrarEvent::Absent),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_payload_found() {
        let event = parse_boot_payload("(primary found aiko/h/1/1 2 1700000000)").unwrap();
        assert_eq!(
            event,
            RegistrarEvent::Found {
                topic_path: "aiko/h/1/1".into()
            }
        );
    }

    #[test]
    fn boot_payload_absent_and_reset() {
        assert_eq!(
            parse_boot_payload("(primary absent)"),
            Some(RegistrarEvent::Absent)
        );
        assert_eq!(parse_boot_payload(""), Some(RegistrarEvent::Absent));
        assert_eq!(parse_boot_payload("  "), Some(RegistrarEvent::Absent));
    }

    #[test]
    fn boot_payload_garbage_ignored() {
        assert_eq!(parse_boot_payload("(other thing)"), None);
        assert_eq!(parse_boot_payload("(primary)"), None);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ProcessExit::Terminated(0).code(), 0);
        assert_eq!(ProcessExit::Terminated(1).code(), 1);
        assert_eq!(ProcessExit::TransportFailure.code(), 2);
    }
}
