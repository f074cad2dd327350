//! Websocket wire messages
//!
//! Every frame is `{"type": ..., "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prediction::models::{OddsBook, ValueBet};

/// Server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveMessage {
    /// Event re-broadcast from `match_events:{match_id}`
    MatchEvent {
        match_id: String,
        event: serde_json::Value,
    },
    OddsUpdate {
        match_id: String,
        odds: OddsBook,
    },
    EdgeAlert {
        match_id: String,
        value_bets: Vec<ValueBet>,
        detected_at: DateTime<Utc>,
    },
    LiveMetric {
        match_id: String,
        name: String,
        value: f64,
        at: DateTime<Utc>,
    },
    Subscribed {
        match_id: String,
    },
    Unsubscribed {
        match_id: String,
    },
    Error {
        message: String,
    },
    Pong {
        timestamp: i64,
    },
}

impl LiveMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize live message: {}", e);
            "{}".to_string()
        })
    }
}

/// Client -> server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        match_id: String,
    },
    Unsubscribe {
        match_id: String,
    },
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
}

/// Event payload published on `match_events:{match_id}`. Only `kind` is
/// interpreted; the rest is passed through to clients.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchEventEnvelope {
    #[serde(default)]
    pub kind: String,
}
