//! JSON wire protocol
//!
//! Every frame is a JSON object tagged by `"type"`. Field names are
//! camelCase. Identifiers may arrive as strings or non-negative integers and
//! are always sent back as strings.

use serde::{Deserialize, Deserializer, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{PositionEvent, StatusEvent};
use crate::broker::topic::TopicKind;
use crate::cache::Proximity;
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        topic_kind: TopicKind,
        #[serde(deserialize_with = "id_token")]
        id: String,
    },
    Unsubscribe {
        topic_kind: TopicKind,
        #[serde(deserialize_with = "id_token")]
        id: String,
    },
    ReportPosition {
        #[serde(deserialize_with = "id_token")]
        bus_id: String,
        latitude: f64,
        longitude: f64,
    },
    ReportStatus {
        #[serde(deserialize_with = "id_token")]
        trip_id: String,
        status: String,
    },
    QueryPositions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        near: Option<Proximity>,
    },
}

impl ClientMessage {
    pub fn request_kind(&self) -> RequestKind {
        match self {
            Self::Subscribe { .. } => RequestKind::Subscribe,
            Self::Unsubscribe { .. } => RequestKind::Unsubscribe,
            Self::ReportPosition { .. } => RequestKind::ReportPosition,
            Self::ReportStatus { .. } => RequestKind::ReportStatus,
            Self::QueryPositions { .. } => RequestKind::QueryPositions,
        }
    }
}

/// Which request an acknowledgement answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Connect,
    Subscribe,
    Unsubscribe,
    ReportPosition,
    ReportStatus,
    QueryPositions,
    /// The frame could not be parsed at all.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    BusLocation(PositionEvent),
    TripStatus(StatusEvent),
    Ack {
        request: RequestKind,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Positions {
        positions: Vec<PositionEvent>,
    },
}

impl ServerMessage {
    pub fn ok(request: RequestKind) -> Self {
        Self::Ack {
            request,
            ok: true,
            error: None,
        }
    }

    pub fn failed(request: RequestKind, error: impl Into<String>) -> Self {
        Self::Ack {
            request,
            ok: false,
            error: Some(error.into()),
        }
    }

    /// Serialize into a text frame.
    pub fn to_frame(&self) -> Result<WsMessage> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }
}

fn id_token<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Text(String),
        Number(u64),
    }

    Ok(match Token::deserialize(deserializer)? {
        Token::Text(text) => text,
        Token::Number(number) => number.to_string(),
    })
}
