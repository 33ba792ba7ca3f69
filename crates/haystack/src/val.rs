//! Tag values, record identifiers and tag dictionaries
//!
//! Only the JSON encoding is provided here; it is what the server speaks.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::{HaystackError, Num, Result};

/// Record identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(Arc<str>);

impl Ref {
    /// Create a ref from its id, with or without a leading `@`.
    ///
    /// Legal characters are `A-Z a-z 0-9 _ : - . ~`.
    pub fn new(id: &str) -> Result<Ref> {
        let id = id.strip_prefix('@').unwrap_or(id);
        if Self::is_id(id) {
            Ok(Ref(Arc::from(id)))
        } else {
            Err(HaystackError::InvalidRef(id.to_string()))
        }
    }

    pub fn is_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-' | '.' | '~'))
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("r:{}", self.0))
    }
}

impl<'de> Deserialize<'de> for Ref {
    /// Accepts `r:id`, `@id` or a bare id
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let id = s.strip_prefix("r:").unwrap_or(&s);
        // "r:id dis" carries a display name we do not keep
        let id = id.split(' ').next().unwrap_or(id);
        Ref::new(id).map_err(de::Error::custom)
    }
}

/// A tag value
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Marker,
    Bool(bool),
    Num(Num),
    Str(String),
    Ref(Ref),
    DateTime(DateTime<Utc>),
}

impl Val {
    pub fn as_num(&self) -> Option<&Num> {
        match self {
            Self::Num(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&Ref> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker)
    }

    /// Encode as a Haystack JSON value
    pub fn to_json(&self) -> Json {
        match self {
            Self::Marker => Json::String("m:".into()),
            Self::Bool(b) => Json::Bool(*b),
            Self::Num(n) => Json::String(n.to_json()),
            Self::Str(s) if looks_tagged(s) => Json::String(format!("s:{s}")),
            Self::Str(s) => Json::String(s.clone()),
            Self::Ref(r) => Json::String(format!("r:{}", r.id())),
            Self::DateTime(ts) => Json::String(format!(
                "t:{} UTC",
                ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            )),
        }
    }

    /// Decode a Haystack JSON value. `null` yields `None`.
    pub fn from_json(json: &Json) -> Result<Option<Val>> {
        let val = match json {
            Json::Null => return Ok(None),
            Json::Bool(b) => Val::Bool(*b),
            Json::Number(n) => match n.as_f64() {
                Some(f) => Val::Num(Num::new(f)),
                None => return Err(HaystackError::InvalidArgument(format!("number {n}"))),
            },
            Json::String(s) => decode_str(s)?,
            other => {
                return Err(HaystackError::InvalidArgument(format!(
                    "unsupported JSON value: {other}"
                )));
            }
        };
        Ok(Some(val))
    }
}

fn looks_tagged(s: &str) -> bool {
    s.as_bytes().get(1) == Some(&b':')
}

fn decode_str(s: &str) -> Result<Val> {
    if !looks_tagged(s) {
        return Ok(Val::Str(s.to_string()));
    }
    let body = &s[2..];
    match &s[..2] {
        "m:" => Ok(Val::Marker),
        "n:" => Num::from_tagged(s).map(Val::Num),
        "s:" => Ok(Val::Str(body.to_string())),
        "r:" => Ref::new(body.split(' ').next().unwrap_or(body)).map(Val::Ref),
        "t:" => {
            let stamp = body.split(' ').next().unwrap_or(body);
            DateTime::parse_from_rfc3339(stamp)
                .map(|ts| Val::DateTime(ts.with_timezone(&Utc)))
                .map_err(|e| HaystackError::InvalidArgument(format!("datetime {body}: {e}")))
        }
        _ => Ok(Val::Str(s.to_string())),
    }
}

impl Serialize for Val {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Val {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Val::from_json(&json)
            .map_err(<D::Error as de::Error>::custom)?
            .ok_or_else(|| <D::Error as de::Error>::custom("null is not a value"))
    }
}

impl From<Num> for Val {
    fn from(n: Num) -> Self {
        Val::Num(n)
    }
}

impl From<Ref> for Val {
    fn from(r: Ref) -> Self {
        Val::Ref(r)
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Self {
        Val::Str(s)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

impl From<f64> for Val {
    fn from(f: f64) -> Self {
        Val::Num(Num::new(f))
    }
}

impl From<DateTime<Utc>> for Val {
    fn from(ts: DateTime<Utc>) -> Self {
        Val::DateTime(ts)
    }
}

/// Insertion-ordered map of tag name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dict(IndexMap<String, Val>);

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Val> {
        self.0.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, val: impl Into<Val>) -> &mut Self {
        self.0.insert(name.into(), val.into());
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Val> {
        self.0.shift_remove(name)
    }

    /// The `id` tag, if it holds a ref
    pub fn id(&self) -> Option<&Ref> {
        self.get("id").and_then(Val::as_ref_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Val)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Val)> for Dict {
    fn from_iter<T: IntoIterator<Item = (String, Val)>>(iter: T) -> Self {
        Dict(iter.into_iter().collect())
    }
}

impl Serialize for Dict {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Dict {
    /// Null-valued entries are skipped
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DictVisitor;

        impl<'de> Visitor<'de> for DictVisitor {
            type Value = Dict;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of tags")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Dict, A::Error> {
                let mut dict = Dict::new();
                while let Some((name, json)) = access.next_entry::<String, Json>()? {
                    if let Some(val) = Val::from_json(&json).map_err(<A::Error as de::Error>::custom)? {
                        dict.0.insert(name, val);
                    }
                }
                Ok(dict)
            }
        }

        deserializer.deserialize_map(DictVisitor)
    }
}

/// Build a [`Dict`] from `name => value` pairs
#[macro_export]
macro_rules! dict {
    () => { $crate::Dict::new() };
    ($($name:expr => $val:expr),+ $(,)?) => {{
        let mut d = $crate::Dict::new();
        $( d.set($name, $val); )+
        d
    }};
}
