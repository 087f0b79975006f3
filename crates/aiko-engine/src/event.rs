//! Timer list for the event loop.
//!
//! Deadlines are kept sorted; the loop sleeps until the earliest one and
//! fires everything due. Periodic timers re-arm from their previous deadline,
//! so drift is bounded by the duration of the currently executing handler.

use std::time::{Duration, Instant};

// ── Timer types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What to do when a timer fires.
#[derive(Debug, Clone)]
pub enum TimerAction {
    /// Invoke `on_timer(token)` on the owning service.
    Notify { service_id: u32, token: u32 },
    /// Publish a deferred payload (proxy `delay` support).
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
}

#[derive(Debug)]
struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    period: Duration,
    repeat: bool,
    action: TimerAction,
}

// ── Timers ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Timers {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, period: Duration, repeat: bool, action: TimerAction) -> TimerId {
        self.add_at(Instant::now() + period, period, repeat, action)
    }

    fn add_at(
        &mut self,
        deadline: Instant,
        period: Duration,
        repeat: bool,
        action: TimerAction,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let index = self
            .entries
            .partition_point(|entry| entry.deadline <= deadline);
        self.entries.insert(
            index,
            TimerEntry {
                id,
                deadline,
                period,
                repeat,
                action,
            },
        );
        id
    }

    pub fn remove(&mut self, id: TimerId) {
        self.entries.retain(|entry| entry.id != id);
    }

    /// Drop every `Notify` timer owned by `service_id` with this token.
    pub fn remove_token(&mut self, service_id: u32, token: u32) {
        self.entries.retain(|entry| {
            !matches!(
                entry.action,
                TimerAction::Notify { service_id: s, token: t } if s == service_id && t == token
            )
        });
    }

    /// Drop every timer owned by `service_id`.
    pub fn remove_service(&mut self, service_id: u32) {
        self.entries.retain(|entry| {
            !matches!(entry.action, TimerAction::Notify { service_id: s, .. } if s == service_id)
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop every action due at `now`, re-arming periodic timers.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first() {
            if entry.deadline > now {
                break;
            }
            let entry = self.entries.remove(0);
            due.push(entry.action.clone());
            if entry.repeat {
                self.add_at(entry.deadline + entry.period, entry.period, true, entry.action);
            }
        }
        due
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn notify(service_id: u32, token: u32) -> TimerAction {
        TimerAction::Notify { service_id, token }
    }

    #[test]
    fn pops_due_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.add_at(now + Duration::from_secs(2), Duration::from_secs(2), false, notify(1, 2));
        timers.add_at(now + Duration::from_secs(1), Duration::from_secs(1), false, notify(1, 1));

        let due = timers.pop_due(now + Duration::from_secs(3));
        assert_eq!(due.len(), 2);
        assert!(matches!(due[0], TimerAction::Notify { token: 1, .. }));
        assert!(matches!(due[1], TimerAction::Notify { token: 2, .. }));
        assert!(timers.is_empty());
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.add_at(now + Duration::from_secs(5), Duration::from_secs(5), false, notify(1, 1));
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn periodic_timers_re_arm() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.add_at(now + Duration::from_secs(1), Duration::from_secs(1), true, notify(1, 1));

        assert_eq!(timers.pop_due(now + Duration::from_secs(1)).len(), 1);
        assert!(!timers.is_empty());
        assert_eq!(timers.pop_due(now + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn removal_by_id_token_and_service() {
        let mut timers = Timers::new();
        let id = timers.add(Duration::from_secs(1), false, notify(1, 1));
        timers.add(Duration::from_secs(1), false, notify(1, 2));
        timers.add(Duration::from_secs(1), false, notify(2, 1));

        timers.remove(id);
        timers.remove_token(1, 2);
        assert!(!timers.is_empty());

        timers.remove_service(2);
        assert!(timers.is_empty());
    }
}
