//! Ordered FITS header model.
//!
//! A [`Header`] keeps cards in insertion order with unique keys. Values are typed
//! ([`HeaderValue`]) and share one text grammar between FITS cards and the
//! flattened `KEY = VALUE` dump lines, so a dump parses back to the same header.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while rebuilding a header from dump lines.
#[derive(Debug, Error, PartialEq)]
pub enum HeaderError {
    /// A dump line has no ` = ` separator.
    #[error("Malformed header line: {0:?}")]
    MalformedLine(String),
}

/// Typed value of one header card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    /// Parse the value field of a card (comment already removed).
    ///
    /// Quoted text is a string, `T`/`F` are logicals, then integers and reals
    /// (a Fortran `D` exponent is accepted). Anything else is kept as raw text.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(inner) = text.strip_prefix('\'') {
            let inner = inner.strip_suffix('\'').unwrap_or(inner);
            return HeaderValue::Str(inner.replace("''", "'").trim_end().to_string());
        }
        match text {
            "T" => return HeaderValue::Bool(true),
            "F" => return HeaderValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            return HeaderValue::Int(i);
        }
        if let Ok(f) = text.replace(['D', 'd'], "E").parse::<f64>() {
            return HeaderValue::Float(f);
        }
        HeaderValue::Str(text.to_string())
    }

    /// Render the value in card syntax. Inverse of [`HeaderValue::parse`].
    pub fn render(&self) -> String {
        match self {
            HeaderValue::Bool(true) => "T".to_string(),
            HeaderValue::Bool(false) => "F".to_string(),
            HeaderValue::Int(i) => i.to_string(),
            HeaderValue::Float(f) => format!("{:?}", f),
            HeaderValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a FITS logical, accepting `'T'`/`'F'` strings too.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            HeaderValue::Str(s) => match s.trim() {
                "T" => Some(true),
                "F" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            other => f.write_str(&other.render()),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl From<f64> for HeaderValue {
    fn from(f: f64) -> Self {
        HeaderValue::Float(f)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Bool(b)
    }
}

/// Insertion-ordered header with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, HeaderValue)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.cards.iter().position(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set `key`, replacing an existing value in place or appending a new card.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(idx) => self.cards[idx].1 = value,
            None => self.cards.push((key, value)),
        }
    }

    /// Insert `key` at `index`, removing any earlier card with the same key first.
    pub fn insert_at(
        &mut self,
        index: usize,
        key: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) {
        let key = key.into();
        self.remove(&key);
        let index = index.min(self.cards.len());
        self.cards.insert(index, (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let idx = self.position(key)?;
        Some(self.cards.remove(idx).1)
    }

    /// Overlay every card of `other`; keys of `other` win on conflict.
    pub fn update(&mut self, other: &Header) {
        for (key, value) in &other.cards {
            self.set(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().map(|(k, _)| k.as_str())
    }

    /// Flatten the header to `KEY = VALUE` lines in card order.
    pub fn dump_lines(&self) -> Vec<String> {
        self.cards
            .iter()
            .map(|(k, v)| format!("{} = {}", k, v.render()))
            .collect()
    }

    /// Rebuild a header from lines produced by [`Header::dump_lines`].
    pub fn from_dump_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, HeaderError> {
        let mut header = Header::new();
        for line in lines {
            let line = line.as_ref();
            let (key, value) = line
                .split_once(" = ")
                .ok_or_else(|| HeaderError::MalformedLine(line.to_string()))?;
            header.set(key, HeaderValue::parse(value));
        }
        Ok(header)
    }
}

impl FromIterator<(String, HeaderValue)> for Header {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (k, v) in iter {
            header.set(k, v);
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn value_strategy() -> impl Strategy<Value = HeaderValue> {
        prop_oneof![
            any::<bool>().prop_map(HeaderValue::Bool),
            any::<i64>().prop_map(HeaderValue::Int),
            (-1.0e12f64..1.0e12).prop_map(HeaderValue::Float),
            "[a-zA-Z0-9 '=./_-]{0,20}"
                .prop_map(|s| HeaderValue::Str(s.trim_end().to_string())),
        ]
    }

    // Property: rendering a value and parsing it back yields the same value.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_value_render_parse_inverse(value in value_strategy()) {
            let text = value.render();
            prop_assert_eq!(HeaderValue::parse(&text), value);
        }
    }

    #[test]
    fn test_parse_card_values() {
        assert_eq!(HeaderValue::parse("'HCYCLE1 '"), HeaderValue::from("HCYCLE1"));
        assert_eq!(HeaderValue::parse("'it''s'"), HeaderValue::from("it's"));
        assert_eq!(HeaderValue::parse("T"), HeaderValue::Bool(true));
        assert_eq!(HeaderValue::parse("  42"), HeaderValue::Int(42));
        assert_eq!(HeaderValue::parse("1.5D2"), HeaderValue::Float(150.0));
        assert_eq!(HeaderValue::parse("-0.25"), HeaderValue::Float(-0.25));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut header = Header::new();
        header.set("SIMPLE", true);
        header.set("BITPIX", -32i64);
        header.set("SIMPLE", false);

        let keys: Vec<_> = header.keys().collect();
        assert_eq!(keys, vec!["SIMPLE", "BITPIX"]);
        assert_eq!(header.get("SIMPLE"), Some(&HeaderValue::Bool(false)));
    }

    #[test]
    fn test_insert_at_moves_existing_key() {
        let mut header = Header::new();
        header.set("A", 1i64);
        header.set("B", 2i64);
        header.set("C", 3i64);
        header.insert_at(0, "C", 30i64);

        let keys: Vec<_> = header.keys().collect();
        assert_eq!(keys, vec!["C", "A", "B"]);
        assert_eq!(header.get("C"), Some(&HeaderValue::Int(30)));
    }

    #[test]
    fn test_update_frame_keys_win() {
        let mut primary = Header::new();
        primary.set("OBJECT", "target");
        primary.set("EXPTIME", 1.0);
        let mut frame = Header::new();
        frame.set("EXPTIME", 0.5);
        frame.set("ESO DET FRAM TYPE", "HCYCLE1");

        primary.update(&frame);
        assert_eq!(primary.get("EXPTIME"), Some(&HeaderValue::Float(0.5)));
        assert_eq!(primary.position("ESO DET FRAM TYPE"), Some(2));
    }

    #[test]
    fn test_dump_round_trip() {
        let mut header = Header::new();
        header.set("SIMPLE", true);
        header.set("NAXIS", 3i64);
        header.set("ESO SEQ NODPOS", "A");
        header.set("ESO DET DIT", 0.0125);
        header.set("COMMENTS", "a = b");

        let lines = header.dump_lines();
        assert_eq!(lines[2], "ESO SEQ NODPOS = 'A'");
        let rebuilt = Header::from_dump_lines(&lines).unwrap();
        assert_eq!(rebuilt, header);
    }

    #[test]
    fn test_malformed_dump_line() {
        let err = Header::from_dump_lines(&["NOSEPARATOR"]).unwrap_err();
        assert_eq!(err, HeaderError::MalformedLine("NOSEPARATOR".to_string()));
    }
}
