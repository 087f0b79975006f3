//! S-expression parser.
//!
//! Whitespace separates atoms. A parenthesized sequence whose first atom is a
//! keyword (`key:`) parses as an ordered map; keywords appearing after
//! positional items gather the tail into a trailing map, which is how command
//! payloads `(method arg … kw: val …)` carry their keyword arguments. A
//! trailing keyword with no value maps to `null`, so `(0:)` is `{0: null}`.

use crate::value::SValue;

// ── ParseError ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at offset {offset}: {reason}")]
pub struct ParseError {
    pub offset: usize,
    pub reason: String,
}

impl ParseError {
    fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}

type Result<T> = std::result::Result<T, ParseError>;

// ── Entry point ───────────────────────────────────────────────────────────────

/// Parse a complete payload into a single value.
pub fn parse(input: &str) -> Result<SValue> {
    let mut parser = Parser {
        src: input,
        pos: 0,
    };
    parser.skip_whitespace();
    if parser.at_end() {
        return Err(ParseError::new(0, "empty payload"));
    }
    let value = match parser.next_item()? {
        Item::Value(value) => value,
        Item::Key(_, offset) => {
            return Err(ParseError::new(offset, "keyword outside a list"));
        }
    };
    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(ParseError::new(
            parser.pos,
            "unexpected trailing characters",
        ));
    }
    Ok(value)
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// A sequence item: either a positional value or a `key:` keyword.
enum Item {
    Value(SValue),
    Key(SValue, usize),
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c == b' ' || c == b'\t' || c == b'\n' || c == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn next_item(&mut self) -> Result<Item> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                Ok(Item::Value(self.sequence()?))
            }
            Some(b')') => Err(ParseError::new(self.pos, "unexpected ')'")),
            Some(q @ (b'\'' | b'"')) => Ok(Item::Value(SValue::Str(self.quoted(q)?))),
            Some(_) => self.atom(),
            None => Err(ParseError::new(self.pos, "unexpected end of payload")),
        }
    }

    /// Parse the items of a parenthesized sequence, then shape them into a
    /// list, a map, or a list with a trailing map.
    fn sequence(&mut self) -> Result<SValue> {
        let open = self.pos - 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(ParseError::new(open, "unterminated list")),
                Some(_) => items.push(self.next_item()?),
            }
        }
        shape_sequence(items)
    }

    fn quoted(&mut self, quote: u8) -> Result<String> {
        let open = self.pos;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::new(open, "unterminated string")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(text);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'n') => text.push('\n'),
                        Some(b't') => text.push('\t'),
                        Some(b'r') => text.push('\r'),
                        Some(c @ (b'\\' | b'\'' | b'"')) => text.push(c as char),
                        Some(c) => {
                            return Err(ParseError::new(
                                self.pos,
                                format!("unknown escape '\\{}'", c as char),
                            ));
                        }
                        None => return Err(ParseError::new(open, "unterminated string")),
                    }
                    self.pos += 1;
                }
                Some(_) => {
                    // Advance one whole character, not one byte.
                    let rest = &self.src[self.pos..];
                    let ch = rest.chars().next().unwrap();
                    text.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn atom(&mut self) -> Result<Item> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b' ' | b'\t' | b'\n' | b'\r' | b'(' | b')' | b'\'' | b'"') {
                break;
            }
            self.pos += 1;
        }
        let token = &self.src[start..self.pos];

        // `key:` introduces a map entry; a lone ':' stays a symbol.
        if token.len() > 1 && token.ends_with(':') {
            let key = &token[..token.len() - 1];
            return Ok(Item::Key(classify_key(key), start));
        }
        Ok(Item::Value(classify_atom(token)))
    }
}

fn classify_atom(token: &str) -> SValue {
    match token {
        "null" => return SValue::Null,
        "true" => return SValue::Bool(true),
        "false" => return SValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return SValue::Int(n);
    }
    if token.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+') {
        if let Ok(f) = token.parse::<f64>() {
            return SValue::Float(f);
        }
    }
    SValue::Symbol(token.to_string())
}

fn classify_key(key: &str) -> SValue {
    if let Ok(n) = key.parse::<i64>() {
        SValue::Int(n)
    } else {
        SValue::Symbol(key.to_string())
    }
}

/// Shape parsed items: pure positional items form a list, a leading keyword
/// makes the whole sequence a map, and keywords after positional items
/// gather the tail into a trailing map element.
fn shape_sequence(items: Vec<Item>) -> Result<SValue> {
    let first_key = items
        .iter()
        .position(|item| matches!(item, Item::Key(_, _)));

    let Some(split) = first_key else {
        let values = items
            .into_iter()
            .map(|item| match item {
                Item::Value(v) => v,
                Item::Key(_, _) => unreachable!(),
            })
            .collect();
        return Ok(SValue::List(values));
    };

    let mut values = Vec::with_capacity(split);
    let mut rest = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        if index < split {
            match item {
                Item::Value(v) => values.push(v),
                Item::Key(_, _) => unreachable!(),
            }
        } else {
            rest.push(item);
        }
    }

    let mut pairs = Vec::new();
    let mut pending: Option<SValue> = None;
    for item in rest {
        match (item, pending.take()) {
            (Item::Key(key, _), None) => pending = Some(key),
            (Item::Value(value), Some(key)) => pairs.push((key, value)),
            (Item::Key(key, _), Some(prev)) => {
                // Keyword directly after a keyword: the previous key is null.
                pairs.push((prev, SValue::Null));
                pending = Some(key);
            }
            (Item::Value(_), None) => {
                return Err(ParseError::new(
                    0,
                    "positional value after keyword arguments",
                ));
            }
        }
    }
    if let Some(key) = pending {
        pairs.push((key, SValue::Null));
    }

    let map = SValue::Map(pairs);
    if values.is_empty() {
        Ok(map)
    } else {
        values.push(map);
        Ok(SValue::List(values))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
