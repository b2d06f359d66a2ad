//! Realtime gateway: WebSocket fanout of market snapshots.
//!
//! Clients connect, identify themselves with a `hello` frame, and from
//! then on receive full-replacement `market_update` events. Updates are
//! driven by bus notices (re-read from the cache) and by a periodic
//! full-catalog resync that bounds staleness when a notice is dropped.
//! Each user id holds at most one live session; a newer connection
//! supersedes the old one.

pub mod registry;
pub mod server;

use chrono::{DateTime, Utc};
use oddsbook_common::{MarketSnapshot, ResultEntry, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::{ClientSession, ConnId, ConnectionRegistry};
pub use server::{GatewayServer, SharedGatewayServer, spawn_gateway};

/// Where a pushed snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Pushed in response to a change notice.
    Live,
    /// Pushed by the reconciliation broadcast or the connect-time catalog.
    Resync,
}

/// Server-to-client events. Every `market_update` is a full replacement,
/// never a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    #[serde(rename_all = "camelCase")]
    MarketUpdate {
        market_id: String,
        current_state: Option<Value>,
        recent_results: Vec<ResultEntry>,
        timestamp: DateTime<Utc>,
        source_tag: SourceTag,
    },
    /// The user opened a newer session; this connection closes after a
    /// short grace period.
    #[serde(rename_all = "camelCase")]
    SessionSuperseded { user_id: String },
}

impl PushEvent {
    pub fn market_update(snapshot: &MarketSnapshot, source_tag: SourceTag) -> Self {
        PushEvent::MarketUpdate {
            market_id: snapshot.market_id.clone(),
            current_state: snapshot.current_state.clone(),
            recent_results: snapshot.recent_results.clone(),
            timestamp: Utc::now(),
            source_tag,
        }
    }

    pub fn session_superseded(user_id: impl Into<String>) -> Self {
        PushEvent::SessionSuperseded {
            user_id: user_id.into(),
        }
    }
}

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// First frame after connect; identifies the session owner.
    #[serde(rename_all = "camelCase")]
    Hello { user_id: String, role: Role },
}

#[cfg(test)]
mod tests {
    use super::*;
    use oddsbook_common::MarketKind;
    use serde_json::json;

    #[test]
    fn test_market_update_wire_shape() {
        let mut snapshot = MarketSnapshot::empty("m1", MarketKind::Casino);
        snapshot.current_state = Some(json!({"round": 4}));
        snapshot
            .recent_results
            .push(ResultEntry::new("A", json!({"winner": "A"})));

        let event = PushEvent::market_update(&snapshot, SourceTag::Live);
        let wire: Value = serde_json::to_value(&event).unwrap();

        assert_eq!(wire["type"], "market_update");
        assert_eq!(wire["marketId"], "m1");
        assert_eq!(wire["currentState"]["round"], 4);
        assert_eq!(wire["recentResults"][0]["winner"], "A");
        assert_eq!(wire["sourceTag"], "live");
        assert!(wire["timestamp"].is_string());
    }

    #[test]
    fn test_session_superseded_wire_shape() {
        let wire: Value =
            serde_json::to_value(PushEvent::session_superseded("u1")).unwrap();
        assert_eq!(wire["type"], "session_superseded");
        assert_eq!(wire["userId"], "u1");
    }

    #[test]
    fn test_hello_parses() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"hello","userId":"u1","role":"player"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Hello {
                user_id: "u1".to_string(),
                role: Role::Player,
            }
        );
    }
}
