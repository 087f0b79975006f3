//! S-expression serializer.
//!
//! Total over the value model. Strings are double-quoted with minimal
//! escaping; maps serialize as `(k1: v1 k2: v2 …)` in insertion order. A
//! symbol containing a delimiter falls back to quoted-string form, which is
//! the one place round-tripping loses the symbol/string distinction.

use crate::value::SValue;

/// Serialize a value to payload text.
pub fn generate(value: &SValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &SValue) {
    match value {
        SValue::Null => out.push_str("null"),
        SValue::Bool(true) => out.push_str("true"),
        SValue::Bool(false) => out.push_str("false"),
        SValue::Int(n) => out.push_str(&n.to_string()),
        SValue::Float(f) => out.push_str(&format!("{f:?}")),
        SValue::Str(s) => write_quoted(out, s),
        SValue::Symbol(s) => {
            if needs_quoting(s) {
                write_quoted(out, s);
            } else {
                out.push_str(s);
            }
        }
        SValue::List(items) => {
            out.push('(');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(' ');
                }
                write_value(out, item);
            }
            out.push(')');
        }
        SValue::Map(pairs) => {
            out.push('(');
            for (index, (key, value)) in pairs.iter().enumerate() {
                if index > 0 {
                    out.push(' ');
                }
                write_key(out, key);
                out.push(' ');
                write_value(out, value);
            }
            out.push(')');
        }
    }
}

fn write_key(out: &mut String, key: &SValue) {
    match key {
        SValue::Symbol(s) | SValue::Str(s) => out.push_str(s),
        SValue::Int(n) => out.push_str(&n.to_string()),
        other => write_value(out, other),
    }
    out.push(':');
}

fn needs_quoting(symbol: &str) -> bool {
    symbol.is_empty()
        || symbol
            .chars()
            .any(|c| matches!(c, ' ' | '\t' | '\n' | '\r' | '(' | ')' | '\'' | '"'))
}

fn write_quoted(out: &mut String, text: &str) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

// ── Tests ─────────────────────────────────────────────────────────────────────
