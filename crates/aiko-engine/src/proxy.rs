//! Remote actor proxy.
//!
//! A proxy holds only the remote's topic path: every call is a thin wrapper
//! that serializes `(method arg …)` and publishes it to the remote's `in`
//! topic. `call_later` defers the publish through the timer list, used when
//! waiting for a remote lifecycle to reach `running`.

use std::time::Duration;

use aiko_sexpr::SValue;

use crate::actor::{ActorContext, Command};

#[derive(Debug, Clone)]
pub struct RemoteProxy {
    topic_path: String,
}

impl RemoteProxy {
    pub fn new(topic_path: &str) -> Self {
        Self {
            topic_path: topic_path.to_string(),
        }
    }

    pub fn topic_path(&self) -> &str {
        &self.topic_path
    }

    pub fn in_topic(&self) -> String {
        format!("{}/in", self.topic_path)
    }

    pub fn call(&self, ctx: &mut ActorContext, method: &str, args: Vec<SValue>) {
        let payload = Command::new(method, args).to_payload();
        ctx.publish(&self.in_topic(), &payload);
    }

    pub fn call_later(
        &self,
        ctx: &mut ActorContext,
        delay: Duration,
        method: &str,
        args: Vec<SValue>,
    ) {
        let payload = Command::new(method, args).to_payload();
        ctx.publish_later(delay, &self.in_topic(), &payload);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Action;
    use aiko_types::TopicPath;

    #[test]
    fn call_publishes_to_remote_in_topic() {
        let proxy = RemoteProxy::new("aiko/h/2/1");
        let mut ctx = ActorContext::new(1, TopicPath::parse("aiko/h/1/1").unwrap(), None);
        proxy.call(&mut ctx, "echo", vec![SValue::string("hi")]);

        let actions = ctx.take_actions();
        let [Action::Publish { topic, payload, retain }] = &actions[..] else {
            panic!("expected one publish");
        };
        assert_eq!(topic, "aiko/h/2/1/in");
        assert_eq!(payload, "(echo \"hi\")");
        assert!(!retain);
    }

    #[test]
    fn call_later_defers_via_timer() {
        let proxy = RemoteProxy::new("aiko/h/2/1");
        let mut ctx = ActorContext::new(1, TopicPath::parse("aiko/h/1/1").unwrap(), None);
        proxy.call_later(&mut ctx, Duration::from_secs(1), "create_stream", vec![
            SValue::Int(7),
        ]);

        let actions = ctx.take_actions();
        assert!(matches!(
            &actions[..],
            [Action::PublishLater { delay, .. }] if *delay == Duration::from_secs(1)
        ));
    }
}
