//! Pipeline definition documents.
//!
//! JSON is the authoritative format; a textual S-expression variant sharing
//! the same field structure is also accepted (detected by a leading `(`).
//! `#` keys are comments at both the pipeline and element level. The
//! `deploy` field is exactly one of `local` / `remote`, with `class_name`
//! defaulting to the element name.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use aiko_sexpr::SValue;
use aiko_types::ServiceFilter;

use crate::error::{PipelineError, Result};

pub const DEFINITION_VERSION: u32 = 0;

// ── Definition structs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(rename = "#", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub version: u32,
    pub name: String,
    /// Informational only.
    pub runtime: String,
    pub graph: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub elements: Vec<ElementDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDefinition {
    #[serde(rename = "#", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: Vec<PortDefinition>,
    #[serde(default)]
    pub output: Vec<PortDefinition>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub deploy: Deploy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    /// Opaque type tag, matched by name only.
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Exactly one of `local` / `remote`; the externally tagged form matches
/// the document shape directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deploy {
    Local(DeployLocal),
    Remote(DeployRemote),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployLocal {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRemote {
    pub service_filter: ServiceFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Definition(format!("{}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parse a definition document, JSON or the S-expression variant.
    pub fn parse(text: &str) -> Result<Self> {
        let definition = if text.trim_start().starts_with('(') {
            Self::parse_sexpr(text)?
        } else {
            serde_json::from_str(text)
                .map_err(|e| PipelineError::Definition(e.to_string()))?
        };
        definition.validate()?;
        Ok(definition)
    }

    /// The S-expression variant is structurally identical to the JSON form:
    /// maps become objects, lists become arrays.
    fn parse_sexpr(text: &str) -> Result<Self> {
        let value =
            aiko_sexpr::parse(text).map_err(|e| PipelineError::Definition(e.to_string()))?;
        let json = svalue_to_json(&value);
        serde_json::from_value(json).map_err(|e| PipelineError::Definition(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.version != DEFINITION_VERSION {
            return Err(PipelineError::Definition(format!(
                "version must be {DEFINITION_VERSION}, but is {}",
                self.version
            )));
        }
        if self.elements.is_empty() {
            return Err(PipelineError::Definition(
                "definition does not define any elements".into(),
            ));
        }
        if self.graph.is_empty() {
            return Err(PipelineError::Definition(
                "definition does not define a graph".into(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for element in &self.elements {
            if !seen.insert(element.name.as_str()) {
                return Err(PipelineError::Invariant(format!(
                    "duplicate element definition: {}",
                    element.name
                )));
            }
        }
        Ok(())
    }

    pub fn element(&self, name: &str) -> Option<&ElementDefinition> {
        self.elements.iter().find(|element| element.name == name)
    }

    /// Pipeline-wide parameter defaults as runtime values.
    pub fn parameter_values(&self) -> std::collections::HashMap<String, SValue> {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), svalue_from_json(value)))
            .collect()
    }
}

impl ElementDefinition {
    /// `deploy.local.class_name`, defaulting to the element's name.
    pub fn class_name(&self) -> Option<&str> {
        match &self.deploy {
            Deploy::Local(local) => {
                Some(local.class_name.as_deref().unwrap_or(self.name.as_str()))
            }
            Deploy::Remote(_) => None,
        }
    }

    pub fn parameter_values(&self) -> std::collections::HashMap<String, SValue> {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), svalue_from_json(value)))
            .collect()
    }
}

// ── Value conversions ─────────────────────────────────────────────────────────

pub fn svalue_from_json(value: &serde_json::Value) -> SValue {
    match value {
        serde_json::Value::Null => SValue::Null,
        serde_json::Value::Bool(b) => SValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SValue::Int(i)
            } else {
                SValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => SValue::Str(s.clone()),
        serde_json::Value::Array(items) => {
            SValue::List(items.iter().map(svalue_from_json).collect())
        }
        serde_json::Value::Object(map) => SValue::Map(
            map.iter()
                .map(|(k, v)| (SValue::Symbol(k.clone()), svalue_from_json(v)))
                .collect(),
        ),
    }
}

fn svalue_to_json(value: &SValue) -> serde_json::Value {
    match value {
        SValue::Null => serde_json::Value::Null,
        SValue::Bool(b) => serde_json::Value::Bool(*b),
        SValue::Int(n) => serde_json::Value::from(*n),
        SValue::Float(f) => serde_json::Value::from(*f),
        SValue::Str(s) | SValue::Symbol(s) => serde_json::Value::String(s.clone()),
        SValue::List(items) => {
            serde_json::Value::Array(items.iter().map(svalue_to_json).collect())
        }
        SValue::Map(pairs) => {
            let mut map = serde_json::Map::new();
            for (key, value) in pairs {
                let key = match key {
                    SValue::Symbol(s) | SValue::Str(s) => s.clone(),
                    SValue::Int(n) => n.to_string(),
                    other => other.to_string(),
                };
                map.insert(key, svalue_to_json(value));
            }
            serde_json::Value::Object(map)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR_JSON: &str = r##"{
        "#": "Two-element chain",
        "version": 0,
        "name": "p_test",
        "runtime": "rust",
        "graph": ["(PE_0 PE_1)"],
        "parameters": {"rate": 10, "label": null},
        "elements": [
            {
                "#": "adds one",
                "name": "PE_0",
                "input":  [{"name": "a", "type": "int"}],
                "output": [{"name": "b", "type": "int"}],
                "deploy": {"local": {"module": "test_elements"}}
            },
            {
                "name": "PE_1",
                "input":  [{"name": "b", "type": "int"}],
                "output": [{"name": "f", "type": "int"}],
                "parameters": {"increment": 1},
                "deploy": {"local": {"module": "test_elements", "class_name": "AddOne"}}
            }
        ]
    }"##;

    #[test]
    fn json_definition_parses() {
        let definition = PipelineDefinition::parse(LINEAR_JSON).unwrap();
        assert_eq!(definition.name, "p_test");
        assert_eq!(definition.graph, vec!["(PE_0 PE_1)"]);
        assert_eq!(definition.elements.len(), 2);
        assert_eq!(definition.comment.as_deref(), Some("Two-element chain"));

        let parameters = definition.parameter_values();
        assert_eq!(parameters.get("rate"), Some(&SValue::Int(10)));
        assert_eq!(parameters.get("label"), Some(&SValue::Null));
    }

    #[test]
    fn class_name_defaults_to_element_name() {
        let definition = PipelineDefinition::parse(LINEAR_JSON).unwrap();
        assert_eq!(definition.element("PE_0").unwrap().class_name(), Some("PE_0"));
        assert_eq!(definition.element("PE_1").unwrap().class_name(), Some("AddOne"));
    }

    #[test]
    fn remote_deploy_parses_service_filter() {
        let text = r#"{
            "version": 0, "name": "p", "runtime": "rust",
            "graph": ["(PE_0)"],
            "elements": [{
                "name": "PE_0",
                "deploy": {"remote": {"service_filter": {"name": "p_local"}}}
            }]
        }"#;
        let definition = PipelineDefinition::parse(text).unwrap();
        let Deploy::Remote(remote) = &definition.elements[0].deploy else {
            panic!("expected remote deploy");
        };
        assert_eq!(remote.service_filter.name, "p_local");
        assert_eq!(remote.service_filter.protocol, "*");
    }

    #[test]
    fn version_and_emptiness_validated() {
        let bad_version = LINEAR_JSON.replace("\"version\": 0", "\"version\": 1");
        assert!(matches!(
            PipelineDefinition::parse(&bad_version),
            Err(PipelineError::Definition(_))
        ));

        let no_elements = r#"{"version": 0, "name": "p", "runtime": "rust",
                              "graph": ["(A)"], "elements": []}"#;
        assert!(PipelineDefinition::parse(no_elements).is_err());
    }

    #[test]
    fn duplicate_element_names_rejected() {
        let text = r#"{
            "version": 0, "name": "p", "runtime": "rust", "graph": ["(A A)"],
            "elements": [
                {"name": "A", "deploy": {"local": {"module": "m"}}},
                {"name": "A", "deploy": {"local": {"module": "m"}}}
            ]
        }"#;
        assert!(matches!(
            PipelineDefinition::parse(text),
            Err(PipelineError::Invariant(_))
        ));
    }

    #[test]
    fn sexpr_variant_shares_the_schema() {
        let text = r#"(version: 0 name: p_sexpr runtime: rust
            graph: ("(PE_0)")
            elements: ((name: PE_0
                        input: ((name: a type: int))
                        output: ((name: b type: int))
                        deploy: (local: (module: test_elements)))))"#;
        let definition = PipelineDefinition::parse(text).unwrap();
        assert_eq!(definition.name, "p_sexpr");
        assert_eq!(definition.elements[0].input[0].name, "a");
        assert!(matches!(definition.elements[0].deploy, Deploy::Local(_)));
    }
}
