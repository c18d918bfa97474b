//! Helpers built on the value API: builders, deep copy, propdict resolution,
//! dict formatting and url decoding.

use indexmap::IndexMap;

use super::{Coll, Dict, Node, Value, ValueError, ValueType};

/// Source preference used when the caller supplies none.
pub const DEFAULT_SOURCE_PREFERENCE: &[&str] = &[
    "server",
    "client/*",
    "plugin/playlist",
    "plugin/id3v2",
    "plugin/segment",
    "plugin/*",
    "*",
];

impl Value {
    /// A list holding `items`.
    pub fn build_list<I>(items: I) -> Value
    where
        I: IntoIterator<Item = Value>,
    {
        Value::from_list(items.into_iter().collect(), None)
    }

    /// A dict holding `entries` in iteration order. A repeated key keeps its
    /// first position and its last value.
    pub fn build_dict<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let map: IndexMap<String, Value> = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::from_dict(Dict::from_entries(map))
    }

    /// A list of strings, restricted to the string type.
    pub fn make_stringlist(items: &[&str]) -> Value {
        Value::from_list(
            items.iter().map(|s| Value::new_string(*s)).collect(),
            Some(ValueType::String),
        )
    }

    /// Copy the whole tree. Every node of the result is fresh with a single
    /// owner; nothing is shared with `self`.
    pub fn deep_copy(&self) -> Value {
        match self.node() {
            Node::None => Value::new_none(),
            Node::Error(message) => Value::new_error(message.clone()),
            Node::Int64(i) => Value::new_int(*i),
            Node::Float(f) => Value::new_float(*f),
            Node::String(bytes) => Value::new_string_bytes(bytes.clone()),
            Node::Binary(bytes) => Value::new_binary(bytes.clone()),
            Node::List(list) => {
                let list = list.read_recursive();
                Value::from_list(
                    list.items().iter().map(Value::deep_copy).collect(),
                    list.restrict(),
                )
            }
            Node::Dict(dict) => {
                let entries = dict
                    .read_recursive()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::from_dict(Dict::from_entries(entries))
            }
            Node::Coll(coll) => {
                let coll = coll.read_recursive();
                Value::from_coll(Coll::from_parts(
                    coll.kind(),
                    coll.attributes()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.deep_copy()))
                        .collect(),
                    coll.idlist().to_vec(),
                    coll.operands().iter().map(Value::deep_copy).collect(),
                ))
            }
            Node::BitBuffer(bb) => Value::from_bitbuffer(bb.lock().clone()),
        }
    }

    /// Store `value` under `key` as reported by `source` in a propdict
    /// (a dict of `key -> dict(source -> value)`).
    pub fn propdict_set(&self, key: &str, source: &str, value: &Value) -> Result<(), ValueError> {
        let sources = match self.dict_get(key) {
            Ok(existing) => existing,
            Err(ValueError::MissingKey(_)) => {
                let fresh = Value::new_dict();
                self.dict_set(key, &fresh)?;
                fresh
            }
            Err(e) => return Err(e),
        };
        sources.dict_set(source, value)
    }

    /// Pick the preferred value of `key`.
    ///
    /// Sources are ranked by the first pattern in `prefs` they match; on a
    /// tie the source listed first wins. Returns `None` if no source matches.
    pub fn propdict_resolve(&self, key: &str, prefs: &[&str]) -> Option<Value> {
        let sources = self.dict_get(key).ok()?;
        best_source(&sources, prefs)
    }

    /// Collapse every key of a propdict to a plain dict. Keys without a
    /// matching source are left out.
    pub fn propdict_to_dict(&self, prefs: &[&str]) -> Result<Value, ValueError> {
        let entries = self
            .dict_entries()
            .ok_or_else(|| self.mismatch(ValueType::Dict))?;
        let out = Value::new_dict();
        for (key, sources) in entries {
            if let Some(best) = best_source(&sources, prefs) {
                out.dict_set(&key, &best)?;
            }
        }
        Ok(out)
    }

    /// Expand `${key}` references in `fmt` from this dict.
    ///
    /// `${minutes}` and `${seconds}` are derived from the `duration` entry
    /// (milliseconds, rounded to the nearest second; negative counts as zero).
    /// Missing keys and values that are neither strings nor numbers expand to nothing.
    pub fn dict_format(&self, fmt: &str) -> Option<String> {
        if !self.is_type(ValueType::Dict) {
            return None;
        }

        let mut out = String::with_capacity(fmt.len());
        let mut rest = fmt;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let (key, next) = match after.find('}') {
                Some(end) => (&after[..end], Some(&after[end + 1..])),
                None => (after, None),
            };
            self.format_key(key, &mut out);
            match next {
                Some(next) => rest = next,
                None => return Some(out),
            }
        }
        out.push_str(rest);
        Some(out)
    }

    fn format_key(&self, key: &str, out: &mut String) {
        match key {
            "minutes" | "seconds" => {
                let duration = self.dict_get_int("duration").unwrap_or(0).max(0);
                if duration == 0 {
                    out.push_str("00");
                } else {
                    let rounded = duration.saturating_add(500);
                    let part = if key == "minutes" {
                        rounded / 60_000
                    } else {
                        (rounded / 1000) % 60
                    };
                    out.push_str(&format!("{part:02}"));
                }
            }
            _ => {
                let Ok(value) = self.dict_get(key) else {
                    return;
                };
                match value.node() {
                    Node::String(bytes) => out.push_str(&String::from_utf8_lossy(bytes)),
                    Node::Int64(i) => out.push_str(&i.to_string()),
                    Node::Float(f) => out.push_str(&format!("{f:.6}")),
                    _ => {}
                }
            }
        }
    }

    /// Url-decode a string value into a binary value.
    pub fn decoded_url(&self) -> Option<Value> {
        let encoded = self.get_string_bytes()?;
        decode_url(&encoded).map(Value::new_binary)
    }
}

fn best_source(sources: &Value, prefs: &[&str]) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;
    for (source, value) in sources.dict_entries()? {
        let Some(rank) = prefs.iter().position(|p| source_matches(&source, p)) else {
            continue;
        };
        if best.as_ref().map_or(true, |(best_rank, _)| rank < *best_rank) {
            best = Some((rank, value));
        }
    }
    best.map(|(_, value)| value)
}

/// Case-insensitive match of a source name against a pattern; a trailing `*`
/// matches any suffix.
fn source_matches(source: &str, pattern: &str) -> bool {
    if pattern.eq_ignore_ascii_case(source) {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => source
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
        None => false,
    }
}

/// Decode `%XX` escapes and `+` in a url-encoded byte string.
///
/// The result has no known encoding. Returns `None` on a truncated or
/// non-hex escape.
pub fn decode_url(encoded: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut bytes = encoded.iter();
    while let Some(&b) = bytes.next() {
        match b {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = hex_digit(*bytes.next()?)?;
                let lo = hex_digit(*bytes.next()?)?;
                out.push(hi << 4 | lo);
            }
            other => out.push(other),
        }
    }
    Some(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).map(|d| d as u8)
}

/// Whether `bytes` is well-formed UTF-8.
pub fn utf8_validate(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok()
}
