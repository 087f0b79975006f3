//! Actors: command parsing, the dispatch trait, and handler side effects.
//!
//! A command on the wire is `(method arg … (kw: val …))`. Handlers never
//! perform I/O themselves: they record [`Action`]s on the [`ActorContext`]
//! and the runtime executes them after the handler returns, so a failing
//! handler leaves the loop intact.

use std::time::Duration;

use aiko_sexpr::{generate, parse, ParseError, SValue};
use aiko_types::{ServiceTags, TopicPath};

// ── Command ───────────────────────────────────────────────────────────────────

/// A parsed actor command: method name plus positional arguments. Keyword
/// arguments travel as a trailing map argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: String,
    pub args: Vec<SValue>,
}

impl Command {
    pub fn new(method: &str, args: Vec<SValue>) -> Self {
        Self {
            method: method.to_string(),
            args,
        }
    }

    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let value = parse(payload)?;
        let items = value.as_list().ok_or_else(|| ParseError {
            offset: 0,
            reason: "command payload must be a list".into(),
        })?;
        let method = items
            .first()
            .and_then(SValue::as_text)
            .ok_or_else(|| ParseError {
                offset: 0,
                reason: "command payload missing method name".into(),
            })?;
        Ok(Self {
            method: method.to_string(),
            args: items[1..].to_vec(),
        })
    }

    pub fn to_payload(&self) -> String {
        let mut items = vec![SValue::symbol(&self.method)];
        items.extend(self.args.iter().cloned());
        generate(&SValue::List(items))
    }

    /// The trailing map argument, when present: the `(kw: val …)` tail.
    pub fn kwargs(&self) -> Option<&SValue> {
        match self.args.last() {
            Some(map @ SValue::Map(_)) => Some(map),
            _ => None,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&SValue> {
        self.args.get(index)
    }
}

// ── ActorError ────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    /// No handler for the method: logged and dropped, no reply.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    Failed(String),
}

// ── Actor ─────────────────────────────────────────────────────────────────────

/// Identity an actor contributes to its service record.
#[derive(Debug, Clone)]
pub struct ActorInfo {
    pub name: String,
    pub protocol: String,
    pub tags: ServiceTags,
}

/// Registrar connectivity changes, delivered to every actor in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarEvent {
    Found { topic_path: String },
    Absent,
}

/// A service with a mailbox of typed commands. All callbacks run on the
/// process event loop.
pub trait Actor: Send {
    fn info(&self) -> ActorInfo;

    /// Invoked once the actor is registered and the loop is running.
    fn on_start(&mut self, _ctx: &mut ActorContext) {}

    /// Dispatch one command from `<topic>/in`. A returned value is published
    /// on `<topic>/out` as `(method result)`.
    fn on_command(
        &mut self,
        command: &Command,
        ctx: &mut ActorContext,
    ) -> Result<Option<SValue>, ActorError>;

    /// A raw message on an extra subscription made through
    /// [`ActorContext::subscribe`].
    fn on_message(&mut self, _topic: &str, _payload: &str, _retain: bool, _ctx: &mut ActorContext) {
    }

    fn on_timer(&mut self, _token: u32, _ctx: &mut ActorContext) {}

    fn on_registrar(&mut self, _event: &RegistrarEvent, _ctx: &mut ActorContext) {}

    /// Invoked during process termination, before the service is removed
    /// from the Registrar.
    fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

// ── Actions ───────────────────────────────────────────────────────────────────

/// Side effects recorded by a handler for the runtime to execute.
#[derive(Debug, Clone)]
pub enum Action {
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    PublishLater {
        delay: Duration,
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
    AddTimer {
        period: Duration,
        repeat: bool,
        token: u32,
    },
    RemoveTimer {
        token: u32,
    },
    /// Post a command into this actor's own mailbox.
    Post {
        command: Command,
    },
    /// Stop the whole process.
    Terminate {
        exit_code: i32,
    },
}

// ── ActorContext ──────────────────────────────────────────────────────────────

/// Per-dispatch view of the runtime handed to every handler.
pub struct ActorContext {
    pub service_id: u32,
    pub topic_path: TopicPath,
    /// Topic path of the current primary Registrar, when one is known.
    pub registrar: Option<String>,
    actions: Vec<Action>,
}

impl ActorContext {
    pub fn new(service_id: u32, topic_path: TopicPath, registrar: Option<String>) -> Self {
        Self {
            service_id,
            topic_path,
            registrar,
            actions: Vec::new(),
        }
    }

    pub fn publish(&mut self, topic: &str, payload: &str) {
        self.actions.push(Action::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain: false,
        });
    }

    pub fn publish_retained(&mut self, topic: &str, payload: &str) {
        self.actions.push(Action::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain: true,
        });
    }

    pub fn publish_later(&mut self, delay: Duration, topic: &str, payload: &str) {
        self.actions.push(Action::PublishLater {
            delay,
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain: false,
        });
    }

    pub fn subscribe(&mut self, pattern: &str) {
        self.actions.push(Action::Subscribe {
            pattern: pattern.to_string(),
        });
    }

    pub fn unsubscribe(&mut self, pattern: &str) {
        self.actions.push(Action::Unsubscribe {
            pattern: pattern.to_string(),
        });
    }

    pub fn add_timer(&mut self, period: Duration, repeat: bool, token: u32) {
        self.actions.push(Action::AddTimer {
            period,
            repeat,
            token,
        });
    }

    pub fn remove_timer(&mut self, token: u32) {
        self.actions.push(Action::RemoveTimer { token });
    }

    pub fn post(&mut self, command: Command) {
        self.actions.push(Action::Post { command });
    }

    pub fn terminate(&mut self, exit_code: i32) {
        self.actions.push(Action::Terminate { exit_code });
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

/// The reply shape published on `<topic>/out`: `(method result)`.
pub fn reply_payload(method: &str, result: &SValue) -> String {
    generate(&SValue::List(vec![
        SValue::symbol(method),
        result.clone(),
    ]))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
