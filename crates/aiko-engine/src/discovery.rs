//! Client-side service discovery.
//!
//! A [`Discovery`] cache pairs a filter with the records currently known to
//! match it. The owner requests a snapshot with the `(share …)` protocol and
//! keeps the cache live by feeding it the Registrar's `out` stream; the
//! cache reports changes as [`DiscoveryEvent`]s for the owner to act on.

use aiko_sexpr::SValue;
use aiko_types::{ServiceFilter, ServiceRecord};

use crate::actor::Command;

// ── DiscoveryEvent ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Added(ServiceRecord),
    Removed(String),
    /// The snapshot requested with `share_payload` is complete.
    Synced,
}

// ── Discovery ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Discovery {
    filter: ServiceFilter,
    records: Vec<ServiceRecord>,
    synced: bool,
}

impl Discovery {
    pub fn new(filter: ServiceFilter) -> Self {
        Self {
            filter,
            records: Vec::new(),
            synced: false,
        }
    }

    /// The `(share …)` request to publish to the Registrar's `in` topic.
    /// Matching records come back on `response_topic`.
    pub fn share_payload(&self, response_topic: &str) -> String {
        let field = |value: &str| SValue::symbol(value);
        Command::new(
            "share",
            vec![
                field(response_topic),
                field(&self.filter.name),
                field(&self.filter.owner),
                field(&self.filter.protocol),
                field(&self.filter.transport),
                SValue::List(
                    self.filter
                        .tags
                        .iter()
                        .map(|tag| SValue::symbol(tag))
                        .collect(),
                ),
            ],
        )
        .to_payload()
    }

    /// Feed one payload from the response topic or the Registrar's `out`
    /// stream.
    pub fn handle_payload(&mut self, payload: &str) -> Vec<DiscoveryEvent> {
        match Command::parse(payload) {
            Ok(command) => self.handle_command(&command),
            Err(_) => Vec::new(),
        }
    }

    pub fn handle_command(&mut self, command: &Command) -> Vec<DiscoveryEvent> {
        match command.method.as_str() {
            "add" => {
                let Some(record) = command
                    .arg(0)
                    .and_then(|value| ServiceRecord::from_svalue(value).ok())
                else {
                    return Vec::new();
                };
                if !self.filter.matches(&record) {
                    return Vec::new();
                }
                if self
                    .records
                    .iter()
                    .any(|existing| existing.topic_path == record.topic_path)
                {
                    return Vec::new();
                }
                self.records.push(record.clone());
                vec![DiscoveryEvent::Added(record)]
            }
            "remove" => {
                let Some(topic_path) = command.arg(0).and_then(SValue::as_text) else {
                    return Vec::new();
                };
                let before = self.records.len();
                self.records
                    .retain(|record| record.topic_path != topic_path);
                if self.records.len() == before {
                    return Vec::new();
                }
                vec![DiscoveryEvent::Removed(topic_path.to_string())]
            }
            "sync" => {
                self.synced = true;
                vec![DiscoveryEvent::Synced]
            }
            _ => Vec::new(),
        }
    }

    pub fn records(&self) -> &[ServiceRecord] {
        &self.records
    }

    /// First matching record, the resolution rule for remote proxies.
    pub fn first(&self) -> Option<&ServiceRecord> {
        self.records.first()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
