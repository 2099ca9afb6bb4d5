use crate::traits::error::{Result, TransportError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Message type reserved for heartbeat requests
pub const PING_TYPE: &str = "ping";

/// Message type reserved for heartbeat replies
pub const PONG_TYPE: &str = "pong";

/// A JSON record exchanged with the server
///
/// Only `id`, `type`, `data` and `timestamp` carry meaning for the
/// transports; any other fields are preserved untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier, used as the resumption cursor
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    /// Message type, also used as a routing event name
    #[serde(
        rename = "type",
        default,
        deserialize_with = "deserialize_kind",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Epoch milliseconds; any non-integer value reads as absent
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Create a typed message carrying `data`
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: Some(kind.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Heartbeat ping carrying its send time as correlation id
    pub fn ping(timestamp: i64) -> Self {
        Self {
            kind: Some(PING_TYPE.to_string()),
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Parse one JSON object
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TransportError::Parse(e.to_string()))
    }

    /// Build a message from an already decoded JSON value
    ///
    /// Objects are read field by field; any other value becomes the `data`
    /// of a plain `message`.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_object() {
            serde_json::from_value(value).map_err(|e| TransportError::Parse(e.to_string()))
        } else {
            Ok(Self::new("message", value))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TransportError::Parse(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| TransportError::Parse(e.to_string()))
    }

    /// Set `timestamp` to now unless the sender already provided one
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(now_millis());
        }
    }

    #[inline]
    pub fn is_pong(&self) -> bool {
        self.kind.as_deref() == Some(PONG_TYPE)
    }

    /// Correlation id of a ping or pong
    ///
    /// Servers echo it either at the top level or inside `data`.
    pub fn correlation(&self) -> Option<i64> {
        self.timestamp.or_else(|| {
            self.data
                .as_ref()
                .and_then(|d| d.get("timestamp"))
                .and_then(Value::as_i64)
        })
    }

    /// Event name for type-specific routing
    ///
    /// Only messages carrying both a `type` and a `data` field are routed.
    pub fn routing_type(&self) -> Option<&str> {
        match (&self.kind, &self.data) {
            (Some(kind), Some(_)) => Some(kind.as_str()),
            _ => None,
        }
    }
}

/// Current wall clock in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Accept string or numeric ids
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Only string types route; anything else reads as untyped
fn deserialize_kind<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

/// Integral millis only; other formats read as absent
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|value| value.as_i64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_typed_message() {
        let msg = Message::from_json(r#"{"id":"m1","type":"chat","data":{"text":"hi"}}"#).unwrap();
        assert_eq!(msg.id.as_deref(), Some("m1"));
        assert_eq!(msg.routing_type(), Some("chat"));
        assert_eq!(msg.data, Some(json!({"text": "hi"})));
    }

    #[test]
    fn test_numeric_id_and_extra_fields() {
        let msg = Message::from_json(r#"{"id":42,"channel":"lobby"}"#).unwrap();
        assert_eq!(msg.id.as_deref(), Some("42"));
        assert_eq!(msg.extra.get("channel"), Some(&json!("lobby")));
        assert_eq!(msg.routing_type(), None);
    }

    #[test]
    fn test_foreign_timestamp_formats_do_not_reject_record() {
        let iso = Message::from_json(
            r#"{"id":"m1","type":"chat","data":{"text":"hi"},"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(iso.id.as_deref(), Some("m1"));
        assert_eq!(iso.routing_type(), Some("chat"));
        assert_eq!(iso.timestamp, None);

        let fractional =
            Message::from_json(r#"{"id":"m2","type":"chat","data":1,"timestamp":1700000000000.5}"#)
                .unwrap();
        assert_eq!(fractional.id.as_deref(), Some("m2"));
        assert_eq!(fractional.timestamp, None);

        let integral = Message::from_json(r#"{"type":"chat","timestamp":1700000000000}"#).unwrap();
        assert_eq!(integral.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_non_string_type_reads_as_untyped() {
        let msg = Message::from_json(r#"{"id":"m3","type":7,"data":{}}"#).unwrap();
        assert_eq!(msg.kind, None);
        assert_eq!(msg.routing_type(), None);
        assert_eq!(msg.id.as_deref(), Some("m3"));
    }

    #[test]
    fn test_type_without_data_is_not_routed() {
        let msg = Message::from_json(r#"{"type":"chat"}"#).unwrap();
        assert_eq!(msg.routing_type(), None);
    }

    #[test]
    fn test_non_object_becomes_plain_message() {
        let msg = Message::from_value(json!([1, 2])).unwrap();
        assert_eq!(msg.kind.as_deref(), Some("message"));
        assert_eq!(msg.data, Some(json!([1, 2])));
        assert!(Message::from_json("not json").is_err());
    }

    #[test]
    fn test_stamp_keeps_existing_timestamp() {
        let mut msg = Message::new("chat", json!({}));
        msg.timestamp = Some(7);
        msg.stamp();
        assert_eq!(msg.timestamp, Some(7));

        let mut fresh = Message::new("chat", json!({}));
        fresh.stamp();
        assert!(fresh.timestamp.is_some());
    }

    #[test]
    fn test_pong_correlation() {
        let top = Message::from_json(r#"{"type":"pong","timestamp":100}"#).unwrap();
        assert!(top.is_pong());
        assert_eq!(top.correlation(), Some(100));

        let nested = Message::from_json(r#"{"type":"pong","data":{"timestamp":200}}"#).unwrap();
        assert_eq!(nested.correlation(), Some(200));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = Message::ping(5).to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping","timestamp":5}"#);
    }
}
