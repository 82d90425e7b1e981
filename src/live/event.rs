//! Wire messages exchanged with the client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Sent once when a socket connects.
pub const EVENT_CONNECT: &str = "connect";
/// URL parameters changed on the client.
pub const EVENT_PARAMS: &str = "params";
/// Acknowledges a client event, carrying its id.
pub const EVENT_ACK: &str = "ack";
/// An error raised while handling an event.
pub const EVENT_ERROR: &str = "err";
/// Patch operations for the current render.
pub const EVENT_PATCH: &str = "patch";
/// A full render, sent when there is nothing to diff against.
pub const EVENT_RENDER: &str = "render";

/// Separator between a child id and its event name.
pub const CHILD_EVENT_SEPARATOR: &str = "--";

/// A message on the wire: `{"type", "id", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
}

impl Event {
    pub fn new(t: impl Into<String>, data: JsonValue) -> Self {
        Self {
            t: t.into(),
            id: None,
            data,
        }
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    /// Parameters carried by the event payload.
    pub fn params(&self) -> Params {
        Params::from_value(&self.data)
    }

    /// Every way to read the event name as `(child id, event name)`, longest
    /// id first. Child ids and event names may themselves contain the
    /// separator; the caller picks the first id that is actually attached.
    pub fn child_scopes(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        let name = self.t.as_str();
        let sep = CHILD_EVENT_SEPARATOR;
        (0..name.len())
            .rev()
            .filter(move |&at| name.as_bytes()[at..].starts_with(sep.as_bytes()))
            .map(move |at| (&name[..at], &name[at + sep.len()..]))
    }
}

/// Payload of an error event: the event that failed and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub source: Event,
    pub err: String,
}

impl ErrorEvent {
    pub fn into_event(self) -> Event {
        let id = self.source.id;
        let data = serde_json::to_value(&self).unwrap_or(JsonValue::Null);
        Event::new(EVENT_ERROR, data).with_id(id)
    }
}

/// Event or URL parameters as an ordered key/value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, JsonValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters from a JSON payload; non-object payloads yield no params.
    pub fn from_value(value: &JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self(map.clone()),
            _ => Self::default(),
        }
    }

    /// Parse a URL query string. Repeated keys keep the last value.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Map::new();
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key);
            let value = decode_component(value);
            params.insert(key, JsonValue::String(value));
        }
        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    /// Integer value, accepting numbers and numeric strings.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    match urlencoding::decode(&s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s,
    }
}
