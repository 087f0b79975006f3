//! Topic pattern matching for local handler routing.
//!
//! The broker performs its own wildcard matching for subscriptions; this
//! mirror of the MQTT rules routes delivered messages to the handlers whose
//! pattern they satisfy. `+` matches exactly one segment, `#` matches the
//! remaining tail and must be the final segment.

/// True when `topic` satisfies `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
