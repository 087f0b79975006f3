//! The Registrar: the distinguished service maintaining the set of live
//! services.
//!
//! Election happens through the retained boot topic
//! `<namespace>/service/registrar`. A starting registrar searches for an
//! existing primary; if none announces itself within the search window it
//! self-promotes by publishing the retained `(primary found …)` marker.
//! First to publish wins; later starters observe the retained message and
//! stand by as secondaries.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use aiko_sexpr::SValue;
use aiko_types::{Config, ServiceFilter, ServiceRecord, ServiceTags};

use crate::actor::{Actor, ActorContext, ActorError, ActorInfo, Command, RegistrarEvent};

pub const PROTOCOL_REGISTRAR: &str = "aiko/registrar:2";
const REGISTRAR_VERSION: u32 = 2;

const PRIMARY_SEARCH_TIMEOUT: Duration = Duration::from_secs(2);
const TIMER_PRIMARY_SEARCH: u32 = 1;

const HISTORY_RING_SIZE: usize = 4096;
const HISTORY_REPLY_DEFAULT: usize = 16;

// ── Election ──────────────────────────────────────────────────────────────────

/// `PrimarySearch → Primary | Secondary`; a vanished primary sends a
/// secondary back to the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    PrimarySearch,
    Primary,
    Secondary { primary: String },
}

// ── RegistrarActor ────────────────────────────────────────────────────────────

struct HistoryEntry {
    record: ServiceRecord,
    time_add: DateTime<Utc>,
    time_remove: DateTime<Utc>,
}

pub struct RegistrarActor {
    config: Config,
    state: ElectionState,
    /// Insertion-ordered table of live services.
    services: Vec<(ServiceRecord, DateTime<Utc>)>,
    /// Ring of removed services, newest first.
    history: VecDeque<HistoryEntry>,
    started_at: DateTime<Utc>,
}

impl RegistrarActor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ElectionState::PrimarySearch,
            services: Vec::new(),
            history: VecDeque::new(),
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Publish the retained primary marker and become primary.
    fn promote(&mut self, ctx: &mut ActorContext) {
        self.state = ElectionState::Primary;
        let payload = format!(
            "(primary found {} {} {})",
            ctx.topic_path,
            REGISTRAR_VERSION,
            self.started_at.timestamp()
        );
        ctx.publish_retained(&self.config.registrar_topic(), &payload);
        info!(topic_path = %ctx.topic_path, "registrar promoted to primary");
    }

    fn enter_search(&mut self, ctx: &mut ActorContext) {
        self.state = ElectionState::PrimarySearch;
        ctx.add_timer(self.search_timeout(ctx), false, TIMER_PRIMARY_SEARCH);
    }

    /// The search window, spread per process so simultaneous starters do not
    /// promote in lockstep.
    fn search_timeout(&self, ctx: &ActorContext) -> Duration {
        let spread: u64 = ctx
            .topic_path
            .process_id
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
            % 500;
        PRIMARY_SEARCH_TIMEOUT + Duration::from_millis(spread)
    }

    // ── Service table ────────────────────────────────────────────────────

    fn service_add(&mut self, record: ServiceRecord, ctx: &mut ActorContext) {
        if self
            .services
            .iter()
            .any(|(existing, _)| existing.topic_path == record.topic_path)
        {
            return;
        }
        debug!(topic_path = %record.topic_path, name = %record.name, "service add");
        let payload = Command::new("add", vec![record.to_svalue()]).to_payload();
        ctx.publish(&ctx.topic_path.out_topic(), &payload);
        self.services.push((record, Utc::now()));
    }

    fn service_remove(&mut self, topic_path: &str, ctx: &mut ActorContext) {
        let Some(position) = self
            .services
            .iter()
            .position(|(record, _)| record.topic_path == topic_path)
        else {
            return;
        };
        let (record, time_add) = self.services.remove(position);
        debug!(topic_path = %record.topic_path, "service remove");

        self.history.push_front(HistoryEntry {
            record,
            time_add,
            time_remove: Utc::now(),
        });
        self.history.truncate(HISTORY_RING_SIZE);

        let payload = format!("(remove {topic_path})");
        ctx.publish(&ctx.topic_path.out_topic(), &payload);
    }

    /// A process liveness topic reported `(absent)`. Service id 0 means the
    /// whole process terminated; retract everything it hosted.
    fn handle_absent(&mut self, service_topic_path: &str, ctx: &mut ActorContext) {
        let retracted: Vec<String> = if let Some(process_path) =
            service_topic_path.strip_suffix("/0")
        {
            let prefix = format!("{process_path}/");
            self.services
                .iter()
                .filter(|(record, _)| record.topic_path.starts_with(&prefix))
                .map(|(record, _)| record.topic_path.clone())
                .collect()
        } else {
            vec![service_topic_path.to_string()]
        };
        for topic_path in &retracted {
            self.service_remove(topic_path, ctx);
        }

        // A vanished primary sends a secondary back to the search.
        let vanished_primary = match &self.state {
            ElectionState::Secondary { primary } => {
                let gone = retracted.iter().any(|t| t == primary)
                    || service_topic_path
                        .strip_suffix("/0")
                        .is_some_and(|p| primary.starts_with(&format!("{p}/")));
                gone.then(|| primary.clone())
            }
            _ => None,
        };
        if let Some(primary) = vanished_primary {
            warn!(%primary, "primary registrar vanished");
            self.enter_search(ctx);
        }
    }

    // ── Query protocol ───────────────────────────────────────────────────

    fn handle_share(&mut self, command: &Command, ctx: &mut ActorContext) {
        let Some(response_topic) = command.arg(0).and_then(SValue::as_text) else {
            warn!("share request without response topic");
            return;
        };
        let filter = parse_filter(command);
        let matched: Vec<&ServiceRecord> = self
            .services
            .iter()
            .map(|(record, _)| record)
            .filter(|record| filter.matches(record))
            .collect();

        ctx.publish(response_topic, &format!("(item_count {})", matched.len()));
        for record in matched {
            let payload = Command::new("add", vec![record.to_svalue()]).to_payload();
            ctx.publish(response_topic, &payload);
        }
        ctx.publish(response_topic, &format!("(sync {response_topic})"));
    }

    fn handle_history(&mut self, command: &Command, ctx: &mut ActorContext) {
        let Some(response_topic) = command.arg(0).and_then(SValue::as_text) else {
            return;
        };
        let count = match command.arg(1) {
            Some(SValue::Int(n)) => *n as usize,
            _ => HISTORY_REPLY_DEFAULT,
        };
        let count = count.min(self.history.len());

        ctx.publish(response_topic, &format!("(item_count {count})"));
        for entry in self.history.iter().take(count) {
            let payload = Command::new(
                "add",
                vec![
                    entry.record.to_svalue(),
                    SValue::Int(entry.time_add.timestamp()),
                    SValue::Int(entry.time_remove.timestamp()),
                ],
            )
            .to_payload();
            ctx.publish(response_topic, &payload);
        }
    }
}

/// `(share response_topic name owner protocol transport (tags))`, each field
/// `*`-wildcarded.
fn parse_filter(command: &Command) -> ServiceFilter {
    let field = |index: usize| {
        command
            .arg(index)
            .and_then(SValue::as_text)
            .unwrap_or("*")
            .to_string()
    };
    let tags = match command.arg(5) {
        Some(value @ SValue::List(_)) => ServiceTags::from_svalue(value).0,
        _ => Vec::new(),
    };
    ServiceFilter {
        topic_path: "*".into(),
        name: field(1),
        owner: field(2),
        protocol: field(3),
        transport: field(4),
        tags,
    }
}

// ── Actor implementation ──────────────────────────────────────────────────────

impl Actor for RegistrarActor {
    fn info(&self) -> ActorInfo {
        ActorInfo {
            name: "registrar".into(),
            protocol: PROTOCOL_REGISTRAR.into(),
            tags: ServiceTags::new(&["registrar=true"]),
        }
    }

    fn on_start(&mut self, ctx: &mut ActorContext) {
        ctx.subscribe(&self.config.service_state_pattern());
        self.enter_search(ctx);
    }

    fn on_timer(&mut self, token: u32, ctx: &mut ActorContext) {
        if token == TIMER_PRIMARY_SEARCH && self.state == ElectionState::PrimarySearch {
            self.promote(ctx);
        }
    }

    fn on_registrar(&mut self, event: &RegistrarEvent, ctx: &mut ActorContext) {
        match event {
            RegistrarEvent::Found { topic_path } => {
                if *topic_path == ctx.topic_path.to_string() {
                    return; // our own retained marker echoed back
                }
                match &self.state {
                    ElectionState::PrimarySearch => {
                        info!(primary = %topic_path, "standing by as secondary");
                        self.state = ElectionState::Secondary {
                            primary: topic_path.clone(),
                        };
                    }
                    ElectionState::Primary => {
                        warn!(other = %topic_path, "another registrar took the retained marker");
                        self.state = ElectionState::Secondary {
                            primary: topic_path.clone(),
                        };
                    }
                    ElectionState::Secondary { .. } => {
                        self.state = ElectionState::Secondary {
                            primary: topic_path.clone(),
                        };
                    }
                }
            }
            RegistrarEvent::Absent => match self.state {
                // The reset state: an empty marker during the search means
                // nobody is primary, so take the role immediately.
                ElectionState::PrimarySearch => self.promote(ctx),
                _ => {
                    self.services.clear();
                    self.enter_search(ctx);
                }
            },
        }
    }

    fn on_command(
        &mut self,
        command: &Command,
        ctx: &mut ActorContext,
    ) -> Result<Option<SValue>, ActorError> {
        match command.method.as_str() {
            "add" => {
                let record = command
                    .arg(0)
                    .ok_or_else(|| ActorError::Failed("add without record".into()))
                    .and_then(|value| {
                        ServiceRecord::from_svalue(value)
                            .map_err(|e| ActorError::Failed(e.to_string()))
                    })?;
                self.service_add(record, ctx);
                Ok(None)
            }
            "remove" => {
                let topic_path = command
                    .arg(0)
                    .and_then(SValue::as_text)
                    .ok_or_else(|| ActorError::Failed("remove without topic path".into()))?
                    .to_string();
                self.service_remove(&topic_path, ctx);
                Ok(None)
            }
            "share" => {
                self.handle_share(command, ctx);
                Ok(None)
            }
            "history" => {
                self.handle_history(command, ctx);
                Ok(None)
            }
            other => Err(ActorError::UnknownMethod(other.to_string())),
        }
    }

    fn on_message(&mut self, topic: &str, payload: &str, _retain: bool, ctx: &mut ActorContext) {
        let Some(service_topic_path) = topic.strip_suffix("/state") else {
            return;
        };
        if payload.trim().is_empty() {
            return; // cleared liveness marker
        }
        if let Ok(command) = Command::parse(payload) {
            if command.method == "absent" {
                self.handle_absent(service_topic_path, ctx);
            }
        }
    }

    fn on_stop(&mut self, ctx: &mut ActorContext) {
        // Leaving as primary clears the retained marker so a newcomer can
        // promote without waiting for a stale address to expire.
        if self.state == ElectionState::Primary {
            ctx.publish_retained(&self.config.registrar_topic(), "");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Action;
    use aiko_types::TopicPath;

    fn context(path: &str) -> ActorContext {
        ActorContext::new(1, TopicPath::parse(path).unwrap(), None)
    }

    fn record(topic_path: &str, name: &str) -> ServiceRecord {
        ServiceRecord {
            topic_path: topic_path.into(),
            name: name.into(),
            owner: "tester".into(),
            protocol: "aiko/test:0".into(),
            transport: "mqtt".into(),
            tags: ServiceTags::default(),
        }
    }

    fn add_command(topic_path: &str, name: &str) -> Command {
        Command::new("add", vec![record(topic_path, name).to_svalue()])
    }

    fn published_payloads(ctx: &mut ActorContext) -> Vec<(String, String, bool)> {
        ctx.take_actions()
            .into_iter()
            .filter_map(|action| match action {
                Action::Publish {
                    topic,
                    payload,
                    retain,
                } => Some((topic, payload, retain)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn search_timeout_promotes_to_primary() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/1/1");
        registrar.on_start(&mut ctx);
        assert_eq!(registrar.state(), &ElectionState::PrimarySearch);

        registrar.on_timer(TIMER_PRIMARY_SEARCH, &mut ctx);
        assert_eq!(registrar.state(), &ElectionState::Primary);

        let publishes = published_payloads(&mut ctx);
        let (topic, payload, retain) = publishes.last().unwrap();
        assert_eq!(topic, "aiko/service/registrar");
        assert!(payload.starts_with("(primary found aiko/h/1/1 2 "));
        assert!(*retain);
    }

    #[test]
    fn existing_primary_keeps_newcomer_in_standby() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/2/1");
        registrar.on_start(&mut ctx);
        registrar.on_registrar(
            &RegistrarEvent::Found {
                topic_path: "aiko/h/1/1".into(),
            },
            &mut ctx,
        );
        assert_eq!(
            registrar.state(),
            &ElectionState::Secondary {
                primary: "aiko/h/1/1".into()
            }
        );

        // The stale timer firing later must not promote.
        ctx.take_actions();
        registrar.on_timer(TIMER_PRIMARY_SEARCH, &mut ctx);
        assert!(published_payloads(&mut ctx).is_empty());
    }

    #[test]
    fn empty_retained_marker_promotes_searcher() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/1/1");
        registrar.on_start(&mut ctx);
        registrar.on_registrar(&RegistrarEvent::Absent, &mut ctx);
        assert_eq!(registrar.state(), &ElectionState::Primary);
    }

    #[test]
    fn share_returns_every_active_service_once() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/1/1");
        registrar
            .on_command(&add_command("aiko/h/2/1", "a"), &mut ctx)
            .unwrap();
        registrar
            .on_command(&add_command("aiko/h/3/1", "b"), &mut ctx)
            .unwrap();
        // Duplicate add is ignored.
        registrar
            .on_command(&add_command("aiko/h/2/1", "a"), &mut ctx)
            .unwrap();
        assert_eq!(registrar.service_count(), 2);
        ctx.take_actions();

        let share = Command::parse("(share aiko/h/9/1/in * * * * ())").unwrap();
        registrar.on_command(&share, &mut ctx).unwrap();
        let publishes = published_payloads(&mut ctx);
        assert_eq!(publishes[0].1, "(item_count 2)");
        assert!(publishes[1].1.contains("aiko/h/2/1"));
        assert!(publishes[2].1.contains("aiko/h/3/1"));
        assert_eq!(publishes[3].1, "(sync aiko/h/9/1/in)");
        assert!(publishes.iter().all(|(topic, _, _)| topic == "aiko/h/9/1/in"));
    }

    #[test]
    fn removed_service_no_longer_shared_and_lands_in_history() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/1/1");
        registrar
            .on_command(&add_command("aiko/h/2/1", "a"), &mut ctx)
            .unwrap();
        registrar
            .on_command(&Command::parse("(remove aiko/h/2/1)").unwrap(), &mut ctx)
            .unwrap();
        ctx.take_actions();

        let share = Command::parse("(share aiko/h/9/1/in * * * * ())").unwrap();
        registrar.on_command(&share, &mut ctx).unwrap();
        assert_eq!(published_payloads(&mut ctx)[0].1, "(item_count 0)");

        registrar.on_command(
            &Command::parse("(history aiko/h/9/1/in 16)").unwrap(),
            &mut ctx,
        )
        .unwrap();
        let publishes = published_payloads(&mut ctx);
        assert_eq!(publishes[0].1, "(item_count 1)");
        assert!(publishes[1].1.contains("aiko/h/2/1"));
    }

    #[test]
    fn name_filter_narrows_share_results() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/1/1");
        registrar
            .on_command(&add_command("aiko/h/2/1", "p_local"), &mut ctx)
            .unwrap();
        registrar
            .on_command(&add_command("aiko/h/3/1", "other"), &mut ctx)
            .unwrap();
        ctx.take_actions();

        let share = Command::parse("(share aiko/h/9/1/in p_local * * * ())").unwrap();
        registrar.on_command(&share, &mut ctx).unwrap();
        let publishes = published_payloads(&mut ctx);
        assert_eq!(publishes[0].1, "(item_count 1)");
        assert!(publishes[1].1.contains("p_local"));
    }

    #[test]
    fn process_absent_retracts_all_its_services() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/1/1");
        registrar
            .on_command(&add_command("aiko/h/2/1", "a"), &mut ctx)
            .unwrap();
        registrar
            .on_command(&add_command("aiko/h/2/2", "b"), &mut ctx)
            .unwrap();
        registrar
            .on_command(&add_command("aiko/h/3/1", "c"), &mut ctx)
            .unwrap();

        registrar.on_message("aiko/h/2/0/state", "(absent)", false, &mut ctx);
        assert_eq!(registrar.service_count(), 1);
    }

    #[test]
    fn vanished_primary_restarts_the_search() {
        let mut registrar = RegistrarActor::new(Config::default());
        let mut ctx = context("aiko/h/2/1");
        registrar.on_start(&mut ctx);
        registrar.on_registrar(
            &RegistrarEvent::Found {
                topic_path: "aiko/h/1/1".into(),
            },
            &mut ctx,
        );

        registrar.on_message("aiko/h/1/0/state", "(absent)", false, &mut ctx);
        assert_eq!(registrar.state(), &ElectionState::PrimarySearch);
    }
}
