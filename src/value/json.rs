//! Hand-written JSON codec for [`Value`](super::Value).
//!
//! Deliberately not `serde_json`: the wire grammar extends past strict JSON
//! (`NaN`/`Infinity`/`-Infinity` literals, `\xNN` byte escapes, logged-and-kept
//! unknown escapes, EOF-closed unterminated strings), none of which
//! `serde_json` accepts.

use std::fmt;

use super::{OrderedMap, Value, WString};

#[derive(Debug)]
pub struct JsonError(pub String);

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value is not JSON-serializable: {}", self.0)
    }
}

impl std::error::Error for JsonError {}

// ---------------------------------------------------------------------------
// Dump
// ---------------------------------------------------------------------------

pub fn dump(value: &Value) -> Result<String, JsonError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<(), JsonError> {
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => write_float(*f, out),
        Value::Str(s) => write_escaped_string(s, out),
        Value::Vector(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Map(map) => {
            out.push('{');
            for (idx, (key, item)) in map.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_escaped_string(&WString::from(key), out);
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
        Value::Callable(_) => {
            return Err(JsonError("cannot serialize a callable".to_owned()));
        }
    }
    Ok(())
}

fn write_float(f: f64, out: &mut String) {
    if f.is_nan() {
        out.push_str("NaN");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "Infinity" } else { "-Infinity" });
    } else if f == f.trunc() && f.abs() < 1e17 {
        // Keep a decimal point so re-parsing recognizes this as a float.
        out.push_str(&format!("{f:.1}"));
    } else {
        out.push_str(&format!("{f}"));
    }
}

fn write_escaped_string(s: &WString, out: &mut String) {
    out.push('"');
    match std::str::from_utf8(s.as_bytes()) {
        Ok(text) => {
            for ch in text.chars() {
                write_escaped_char(ch, out);
            }
        }
        Err(_) => {
            // Not valid UTF-8 as a whole: fall back to a byte-wise pass,
            // escaping anything outside printable ASCII as \xNN.
            for &b in s.as_bytes() {
                if b.is_ascii_graphic() || b == b' ' {
                    write_escaped_char(b as char, out);
                } else {
                    out.push_str(&format!("\\x{b:02x}"));
                }
            }
        }
    }
    out.push('"');
}

fn write_escaped_char(ch: char, out: &mut String) {
    match ch {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        '\u{0b}' => out.push_str("\\v"),
        '\u{0c}' => out.push_str("\\f"),
        '\u{07}' => out.push_str("\\a"),
        c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
        c => out.push(c),
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

pub fn load(text: &str) -> Value {
    let mut parser = Parser {
        bytes: text.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    if parser.pos >= parser.bytes.len() {
        return Value::None;
    }
    parser.parse_value()
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, lit: &str) -> bool {
        self.bytes[self.pos..].starts_with(lit.as_bytes())
    }

    fn parse_value(&mut self) -> Value {
        self.skip_ws();
        match self.peek() {
            None => Value::None,
            Some(b'n') if self.starts_with("null") => {
                self.pos += 4;
                Value::None
            }
            Some(b't') if self.starts_with("true") => {
                self.pos += 4;
                Value::Bool(true)
            }
            Some(b'f') if self.starts_with("false") => {
                self.pos += 5;
                Value::Bool(false)
            }
            Some(b'N') if self.starts_with("NaN") => {
                self.pos += 3;
                Value::Float(f64::NAN)
            }
            Some(b'I') if self.starts_with("Infinity") => {
                self.pos += 8;
                Value::Float(f64::INFINITY)
            }
            Some(b'-') if self.starts_with("-Infinity") => {
                self.pos += 9;
                Value::Float(f64::NEG_INFINITY)
            }
            Some(b'"') => self.parse_string(),
            Some(b'[') => self.parse_array(),
            Some(b'{') => self.parse_object(),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(other) => {
                tracing::warn!(byte = other, "unexpected byte while parsing JSON value");
                self.pos += 1;
                Value::None
            }
        }
    }

    fn parse_number(&mut self) -> Value {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    is_float = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let token = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("0");
        if is_float {
            Value::Float(token.parse().unwrap_or(0.0))
        } else {
            match token.parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Float(token.parse().unwrap_or(0.0)),
            }
        }
    }

    fn parse_string(&mut self) -> Value {
        Value::Str(WString(self.parse_raw_string()))
    }

    /// Parses a `"..."` token into raw bytes, honoring the extended escape
    /// table and tolerating malformed input.
    fn parse_raw_string(&mut self) -> Vec<u8> {
        debug_assert_eq!(self.peek(), Some(b'"'));
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => {
                    tracing::warn!("unterminated JSON string, closing at end of input");
                    break;
                }
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    None => {
                        tracing::warn!("unterminated escape at end of input");
                        break;
                    }
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'"') => out.push(b'"'),
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'v') => out.push(0x0b),
                    Some(b'f') => out.push(0x0c),
                    Some(b'a') => out.push(0x07),
                    Some(b'x') => {
                        let hi = self.bump();
                        let lo = self.bump();
                        match (hi.and_then(hex_digit), lo.and_then(hex_digit)) {
                            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                            _ => tracing::warn!("invalid \\x escape in JSON string"),
                        }
                    }
                    Some(other) => {
                        tracing::warn!(escape = other as char, "unknown escape in JSON string");
                        out.push(other);
                    }
                },
                Some(b) => out.push(b),
            }
        }
        out
    }

    fn parse_array(&mut self) -> Value {
        debug_assert_eq!(self.peek(), Some(b'['));
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Value::Vector(items);
        }
        loop {
            items.push(self.parse_value());
            self.skip_ws();
            match self.bump() {
                Some(b',') => continue,
                Some(b']') | None => break,
                Some(_) => break,
            }
        }
        Value::Vector(items)
    }

    fn parse_object(&mut self) -> Value {
        debug_assert_eq!(self.peek(), Some(b'{'));
        self.pos += 1;
        let mut map = OrderedMap::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Value::Map(map);
        }
        loop {
            self.skip_ws();
            if self.peek() != Some(b'"') {
                break;
            }
            let key_bytes = self.parse_raw_string();
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            self.skip_ws();
            if self.bump() != Some(b':') {
                break;
            }
            let value = self.parse_value();
            map.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(b',') => continue,
                Some(b'}') | None => break,
                Some(_) => break,
            }
        }
        Value::Map(map)
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value) -> Value {
        let text = dump(v).unwrap();
        load(&text)
    }

    #[test]
    fn primitives_round_trip() {
        assert_eq!(roundtrip(&Value::None), Value::None);
        assert_eq!(roundtrip(&Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(&Value::Int(-42)), Value::Int(-42));
        assert_eq!(roundtrip(&Value::Str("hi".into())), Value::Str("hi".into()));
    }

    #[test]
    fn float_round_trips_with_decimal_point() {
        let text = dump(&Value::Float(3.0)).unwrap();
        assert_eq!(text, "3.0");
        assert_eq!(load(&text), Value::Float(3.0));
    }

    #[test]
    fn nan_and_infinity_literals_parse() {
        assert!(matches!(load("NaN"), Value::Float(f) if f.is_nan()));
        assert_eq!(load("Infinity"), Value::Float(f64::INFINITY));
        assert_eq!(load("-Infinity"), Value::Float(f64::NEG_INFINITY));
    }

    #[test]
    fn vector_and_map_round_trip_preserving_order() {
        let mut m = OrderedMap::new();
        m.insert("z", Value::Int(1));
        m.insert("a", Value::Int(2));
        let v = Value::Vector(vec![Value::Map(m)]);
        let text = dump(&v).unwrap();
        assert_eq!(text, r#"[{"z":1,"a":2}]"#);
        assert_eq!(load(&text), v);
    }

    #[test]
    fn hex_byte_escape_round_trips() {
        let v = Value::Str(WString(vec![0x01, b'x', 0xff]));
        let text = dump(&v).unwrap();
        assert_eq!(text, r#""\x01x\xff""#);
        assert_eq!(load(&text), v);
    }

    #[test]
    fn unknown_escape_keeps_character() {
        assert_eq!(load(r#""\q""#), Value::Str("q".into()));
    }

    #[test]
    fn unterminated_string_closes_at_eof() {
        assert_eq!(load(r#""abc"#), Value::Str("abc".into()));
    }

    #[test]
    fn int_vs_float_distinguished_by_dot_or_exponent() {
        assert_eq!(load("10"), Value::Int(10));
        assert_eq!(load("10.0"), Value::Float(10.0));
        assert_eq!(load("1e3"), Value::Float(1000.0));
    }
}
