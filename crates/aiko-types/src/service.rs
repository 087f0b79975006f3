//! Service identity, records, filters and tags.
//!
//! A service is addressable by its topic path
//! `<namespace>/<host>/<process_id>/<service_id>` and described by the record
//! `(topic_path, name, owner, protocol, transport, tags)`. Filters share the
//! record shape with `*` wildcards and drive discovery queries.

use serde::{Deserialize, Serialize};

use aiko_sexpr::SValue;

use crate::error::AikoError;

pub const WILDCARD: &str = "*";

// ── TopicPath ─────────────────────────────────────────────────────────────────

/// Hierarchical address of one service's message channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    pub namespace: String,
    pub hostname: String,
    pub process_id: String,
    pub service_id: u32,
}

impl TopicPath {
    pub fn new(namespace: &str, hostname: &str, process_id: &str, service_id: u32) -> Self {
        Self {
            namespace: namespace.to_string(),
            hostname: hostname.to_string(),
            process_id: process_id.to_string(),
            service_id,
        }
    }

    /// Parse `<ns>/<host>/<pid>/<sid>`; a trailing channel segment is not
    /// accepted here, strip it first.
    pub fn parse(topic_path: &str) -> Result<Self, AikoError> {
        let segments: Vec<&str> = topic_path.split('/').collect();
        if segments.len() != 4 {
            return Err(AikoError::TopicPath(topic_path.to_string()));
        }
        let service_id = segments[3]
            .parse()
            .map_err(|_| AikoError::TopicPath(topic_path.to_string()))?;
        Ok(Self::new(segments[0], segments[1], segments[2], service_id))
    }

    /// `<ns>/<host>/<pid>`, shared by every service in the process.
    pub fn process_path(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.hostname, self.process_id)
    }

    pub fn in_topic(&self) -> String {
        format!("{self}/in")
    }

    pub fn out_topic(&self) -> String {
        format!("{self}/out")
    }

    pub fn state_topic(&self) -> String {
        format!("{self}/state")
    }

    pub fn log_topic(&self) -> String {
        format!("{self}/log")
    }
}

impl std::fmt::Display for TopicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.hostname, self.process_id, self.service_id
        )
    }
}

// ── ServiceTags ───────────────────────────────────────────────────────────────

/// Ordered set of `key=value` strings attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceTags(pub Vec<String>);

impl ServiceTags {
    pub fn new(tags: &[&str]) -> Self {
        Self(tags.iter().map(|t| t.to_string()).collect())
    }

    pub fn add(&mut self, tag: &str) {
        if !self.0.iter().any(|t| t == tag) {
            self.0.push(tag.to_string());
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.0.iter().find_map(|tag| {
            let (k, v) = tag.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// True when every `key=value` in `wanted` is present here.
    pub fn contains_all(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|tag| self.0.iter().any(|t| t == tag))
    }

    pub fn to_svalue(&self) -> SValue {
        SValue::List(self.0.iter().map(|t| SValue::symbol(t)).collect())
    }

    pub fn from_svalue(value: &SValue) -> Self {
        let tags = value
            .as_list()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_text().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self(tags)
    }
}

// ── ServiceRecord ─────────────────────────────────────────────────────────────

/// One discoverable service, as held by the Registrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub topic_path: String,
    pub name: String,
    pub owner: String,
    pub protocol: String,
    pub transport: String,
    pub tags: ServiceTags,
}

impl ServiceRecord {
    /// Wire shape: `(topic name owner protocol transport (tag …))`.
    pub fn to_svalue(&self) -> SValue {
        SValue::List(vec![
            SValue::symbol(&self.topic_path),
            SValue::symbol(&self.name),
            SValue::symbol(&self.owner),
            SValue::symbol(&self.protocol),
            SValue::symbol(&self.transport),
            self.tags.to_svalue(),
        ])
    }

    pub fn from_svalue(value: &SValue) -> Result<Self, AikoError> {
        let items = value
            .as_list()
            .ok_or_else(|| AikoError::ServiceRecord(value.to_string()))?;
        let [topic_path, name, owner, protocol, transport, tags] = items else {
            return Err(AikoError::ServiceRecord(value.to_string()));
        };
        let text = |v: &SValue| {
            v.as_text()
                .map(str::to_string)
                .ok_or_else(|| AikoError::ServiceRecord(value.to_string()))
        };
        Ok(Self {
            topic_path: text(topic_path)?,
            name: text(name)?,
            owner: text(owner)?,
            protocol: text(protocol)?,
            transport: text(transport)?,
            tags: ServiceTags::from_svalue(tags),
        })
    }
}

// ── ServiceFilter ─────────────────────────────────────────────────────────────

/// Record shape with `*` wildcards, used for discovery queries. An empty tag
/// list matches any tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFilter {
    #[serde(default = "wildcard")]
    pub topic_path: String,
    #[serde(default = "wildcard")]
    pub name: String,
    #[serde(default = "wildcard")]
    pub owner: String,
    #[serde(default = "wildcard")]
    pub protocol: String,
    #[serde(default = "wildcard")]
    pub transport: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

impl Default for ServiceFilter {
    fn default() -> Self {
        Self {
            topic_path: wildcard(),
            name: wildcard(),
            owner: wildcard(),
            protocol: wildcard(),
            transport: wildcard(),
            tags: Vec::new(),
        }
    }
}

impl ServiceFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        let field = |filter: &str, value: &str| filter == WILDCARD || filter == value;
        field(&self.topic_path, &record.topic_path)
            && field(&self.name, &record.name)
            && field(&self.owner, &record.owner)
            && field(&self.protocol, &record.protocol)
            && field(&self.transport, &record.transport)
            && record.tags.contains_all(&self.tags)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic_path: &str, name: &str) -> ServiceRecord {
        ServiceRecord {
            topic_path: topic_path.to_string(),
            name: name.to_string(),
            owner: "tester".into(),
            protocol: "aiko/pipeline:0".into(),
            transport: "mqtt".into(),
            tags: ServiceTags::new(&["ec=true"]),
        }
    }

    #[test]
    fn topic_path_round_trip() {
        let path = TopicPath::parse("aiko/h/1/1").unwrap();
        assert_eq!(path.to_string(), "aiko/h/1/1");
        assert_eq!(path.process_path(), "aiko/h/1");
        assert_eq!(path.in_topic(), "aiko/h/1/1/in");
        assert_eq!(path.state_topic(), "aiko/h/1/1/state");
    }

    #[test]
    fn topic_path_rejects_wrong_segment_count() {
        assert!(TopicPath::parse("aiko/h/1").is_err());
        assert!(TopicPath::parse("aiko/h/1/1/in").is_err());
    }

    #[test]
    fn tags_lookup_and_match() {
        let tags = ServiceTags::new(&["a=1", "b=2"]);
        assert_eq!(tags.value("a"), Some("1"));
        assert_eq!(tags.value("c"), None);
        assert!(tags.contains_all(&["a=1".into()]));
        assert!(!tags.contains_all(&["a=2".into()]));
    }

    #[test]
    fn record_wire_round_trip() {
        let original = record("aiko/h/1/1", "p_local");
        let wire = original.to_svalue();
        assert_eq!(ServiceRecord::from_svalue(&wire).unwrap(), original);
    }

    #[test]
    fn filter_wildcards_and_fields() {
        let record = record("aiko/h/1/1", "p_local");
        assert!(ServiceFilter::any().matches(&record));
        assert!(ServiceFilter::with_name("p_local").matches(&record));
        assert!(!ServiceFilter::with_name("other").matches(&record));

        let mut tagged = ServiceFilter::any();
        tagged.tags = vec!["ec=true".into()];
        assert!(tagged.matches(&record));
        tagged.tags = vec!["ec=false".into()];
        assert!(!tagged.matches(&record));
    }
}
