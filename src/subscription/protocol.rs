//! GraphQL-over-WebSocket (`graphql-ws`) frames used by the bridge.
//!
//! Field order of serialized frames is `id`, `type`, `payload`, matching what unmodified
//! downstream servers expect.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";
pub const SYSTEM_STATS_ID: &str = "system-stats";
pub const SYSTEM_STATS_QUERY: &str =
    "subscription { info { cpu { speed usage } memory { total used } os { uptime } } }";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OutgoingFrame {
    pub fn connection_init() -> Self {
        Self {
            id: None,
            kind: "connection_init",
            payload: Some(json!({})),
        }
    }

    pub fn start(id: &str, query: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: "start",
            payload: Some(json!({ "query": query, "variables": {} })),
        }
    }

    pub fn stop(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: "stop",
            payload: None,
        }
    }

    pub fn to_text(&self) -> String {
        // Only strings and JSON values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl IncomingFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// `payload.data` when present and not null.
    pub fn data(&self) -> Option<&Value> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("data"))
            .filter(|data| !data.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_match_the_wire_format() {
        assert_eq!(
            OutgoingFrame::connection_init().to_text(),
            r#"{"type":"connection_init","payload":{}}"#
        );
        assert_eq!(
            OutgoingFrame::stop(SYSTEM_STATS_ID).to_text(),
            r#"{"id":"system-stats","type":"stop"}"#
        );
        assert_eq!(
            OutgoingFrame::start(SYSTEM_STATS_ID, "subscription { x }").to_text(),
            r#"{"id":"system-stats","type":"start","payload":{"query":"subscription { x }","variables":{}}}"#
        );
    }

    #[test]
    fn incoming_frames_tolerate_missing_fields() {
        let ack = IncomingFrame::parse(r#"{"type":"connection_ack"}"#).unwrap();
        assert_eq!(ack.kind, "connection_ack");
        assert!(ack.id.is_none());
        assert!(ack.data().is_none());

        let next = IncomingFrame::parse(
            r#"{"id":"system-stats","type":"next","payload":{"data":{"info":{"cpu":{"usage":12}}}}}"#,
        )
        .unwrap();
        assert_eq!(next.data().unwrap()["info"]["cpu"]["usage"], 12);

        let empty = IncomingFrame::parse(r#"{"type":"data","payload":{"data":null}}"#).unwrap();
        assert!(empty.data().is_none());
    }

    #[test]
    fn frames_without_type_are_rejected() {
        assert!(IncomingFrame::parse(r#"{"id":"x"}"#).is_err());
        assert!(IncomingFrame::parse("not json").is_err());
    }
}
