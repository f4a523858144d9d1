//! Bus events — transient notifications of state changes.

use serde::{Deserialize, Serialize};

/// Topic for build-level status changes.
pub const TOPIC_BUILD: &str = "build";
/// Topic for job-level status changes.
pub const TOPIC_JOB: &str = "job";

/// A notification published on the event bus.
///
/// The payload is opaque to the bus. Runtime lifecycle events also carry
/// the container, host and time they refer to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            container: None,
            host: None,
            time: None,
        }
    }

    /// Event whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize>(name: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(name, serde_json::to_vec(value)?))
    }

    /// A container lifecycle event reported by a runtime host.
    pub fn runtime(
        status: impl Into<String>,
        container: impl Into<String>,
        host: impl Into<String>,
        time: u64,
    ) -> Self {
        Self {
            name: status.into(),
            payload: Vec::new(),
            container: Some(container.into()),
            host: Some(host.into()),
            time: Some(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payload_round_trips_value() {
        let ev = Event::json(TOPIC_JOB, &serde_json::json!({"id": 7})).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&ev.payload).unwrap();
        assert_eq!(v["id"], 7);
        assert!(ev.container.is_none());
    }

    #[test]
    fn runtime_event_skips_nothing() {
        let ev = Event::runtime("die", "abc123", "node-1", 1_700_000_000);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["container"], "abc123");
        assert_eq!(json["host"], "node-1");
        assert_eq!(json["time"], 1_700_000_000u64);
    }
}
