//! In-memory value model for the S-expression wire format.

use std::fmt;

// ── SValue ────────────────────────────────────────────────────────────────────

/// A parsed S-expression value.
///
/// Maps preserve insertion order, which the codec round-trips. Symbols and
/// strings serialize differently (`abc` vs `"abc"`) but compare by content
/// where the framework looks values up by name.
#[derive(Debug, Clone, PartialEq)]
pub enum SValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    List(Vec<SValue>),
    Map(Vec<(SValue, SValue)>),
}

impl SValue {
    /// Symbol or string text, if this value carries any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(SValue, SValue)]> {
        match self {
            Self::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Look up a map entry whose key renders as `key`.
    ///
    /// Keys on the wire are symbols or integers (`(stream_id: 7)`, `(0:)`),
    /// so lookup compares the rendered key text.
    pub fn get(&self, key: &str) -> Option<&SValue> {
        let pairs = self.as_map()?;
        pairs
            .iter()
            .find(|(k, _)| key_text_matches(k, key))
            .map(|(_, v)| v)
    }

    /// Build a map from `(key, value)` pairs with symbol keys.
    pub fn map_of(pairs: Vec<(&str, SValue)>) -> Self {
        Self::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (Self::Symbol(k.to_string()), v))
                .collect(),
        )
    }

    pub fn symbol(text: &str) -> Self {
        Self::Symbol(text.to_string())
    }

    pub fn string(text: &str) -> Self {
        Self::Str(text.to_string())
    }
}

fn key_text_matches(key: &SValue, wanted: &str) -> bool {
    match key {
        SValue::Symbol(s) | SValue::Str(s) => s == wanted,
        SValue::Int(n) => n.to_string() == wanted,
        _ => false,
    }
}

impl fmt::Display for SValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::generate(self))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
