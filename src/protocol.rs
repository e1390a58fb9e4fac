//! Tunnel envelope messages exchanged between the remote and home sides.
//!
//! Every WebSocket text frame carries exactly one JSON object with a `"type"`
//! field. IPC payload bytes travel as standard base64 in the `data` field so
//! arbitrary binary content survives the text transport.
//!
//! | Type                   | Direction     | Fields                              |
//! |------------------------|---------------|-------------------------------------|
//! | `ipc_data`             | remote → home | `channel`, `data`                   |
//! | `ipc_response`         | home → remote | `channel`, `data`                   |
//! | `app_connected`        | remote → home | `channel`, `timestamp`              |
//! | `app_disconnected`     | remote → home | `channel`, `timestamp`              |
//! | `app_presence_cleared` | home → remote | `channel`, `success`, `timestamp`   |
//! | `clear_presence`       | remote → home | `timestamp`                         |
//! | `clear_presence_ack`   | home → remote | `timestamp`                         |
//! | `ping`                 | both          | `timestamp`                         |
//! | `pong`                 | both          | `timestamp`, `echo`                 |
//!
//! Decoding never fails the session: callers log a [`DecodeError`] and move on.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of IPC slots Discord scans (`discord-ipc-0` .. `discord-ipc-9`).
pub const CHANNEL_COUNT: u8 = 10;

/// A fixed IPC slot, always in `0..CHANNEL_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Returns `None` when `id` falls outside the channel range.
    pub fn new(id: u8) -> Option<Self> {
        (id < CHANNEL_COUNT).then_some(Self(id))
    }

    /// Every channel, in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..CHANNEL_COUNT).map(Self)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single tunnel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    IpcData {
        channel: ChannelId,
        #[serde(with = "base64_payload")]
        data: Vec<u8>,
    },
    IpcResponse {
        channel: ChannelId,
        #[serde(with = "base64_payload")]
        data: Vec<u8>,
    },
    AppConnected {
        channel: ChannelId,
        #[serde(default)]
        timestamp: u64,
    },
    AppDisconnected {
        channel: ChannelId,
        #[serde(default)]
        timestamp: u64,
    },
    AppPresenceCleared {
        channel: ChannelId,
        success: bool,
        #[serde(default)]
        timestamp: u64,
    },
    ClearPresence {
        #[serde(default)]
        timestamp: u64,
    },
    ClearPresenceAck {
        #[serde(default)]
        timestamp: u64,
    },
    Ping {
        /// Absent from some peers; the `pong` then carries no `echo`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        timestamp: u64,
        /// Timestamp of the `ping` being answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        echo: Option<u64>,
    },
}

/// Wire names accepted by [`Envelope::decode`].
const KNOWN_TYPES: &[&str] = &[
    "ipc_data",
    "ipc_response",
    "app_connected",
    "app_disconnected",
    "app_presence_cleared",
    "clear_presence",
    "clear_presence_ack",
    "ping",
    "pong",
];

/// Why an inbound frame could not be turned into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("message has no string \"type\" field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("channel {0} out of range (0..{CHANNEL_COUNT})")]
    ChannelOutOfRange(u64),
}

impl Envelope {
    /// Serialize to the JSON text sent in one WebSocket frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one WebSocket text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(DecodeError::UnknownType(kind));
        }
        // Report out-of-range channels distinctly from other shape errors.
        if let Some(channel) = value.get("channel").and_then(Value::as_u64) {
            if channel >= u64::from(CHANNEL_COUNT) {
                return Err(DecodeError::ChannelOutOfRange(channel));
            }
        }
        serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
    }

    /// The wire `type` name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IpcData { .. } => "ipc_data",
            Self::IpcResponse { .. } => "ipc_response",
            Self::AppConnected { .. } => "app_connected",
            Self::AppDisconnected { .. } => "app_disconnected",
            Self::AppPresenceCleared { .. } => "app_presence_cleared",
            Self::ClearPresence { .. } => "clear_presence",
            Self::ClearPresenceAck { .. } => "clear_presence_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(id: u8) -> ChannelId {
        ChannelId::new(id).unwrap()
    }

    #[test]
    fn channel_range_is_enforced() {
        assert!(ChannelId::new(0).is_some());
        assert!(ChannelId::new(9).is_some());
        assert!(ChannelId::new(10).is_none());
        assert_eq!(ChannelId::all().count(), 10);
    }

    #[test]
    fn ipc_data_carries_base64_payload() {
        let msg = Envelope::IpcData {
            channel: ch(3),
            data: vec![0x00, 0xff, 0x80, b'{'],
        };
        let text = msg.encode().unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "ipc_data");
        assert_eq!(json["channel"], 3);
        assert_eq!(json["data"], "AP+Aew==");
        assert_eq!(Envelope::decode(&text).unwrap(), msg);
    }

    #[test]
    fn decodes_messages_from_peer() {
        let msg = Envelope::decode(r#"{"type":"ping","timestamp":1700000000000}"#).unwrap();
        assert_eq!(
            msg,
            Envelope::Ping {
                timestamp: Some(1_700_000_000_000)
            }
        );

        let msg = Envelope::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, Envelope::Ping { timestamp: None });

        let msg = Envelope::decode(r#"{"type":"clear_presence"}"#).unwrap();
        assert_eq!(msg, Envelope::ClearPresence { timestamp: 0 });

        let msg = Envelope::decode(
            r#"{"type":"app_presence_cleared","channel":2,"success":false,"timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Envelope::AppPresenceCleared {
                channel: ch(2),
                success: false,
                timestamp: 5
            }
        );
    }

    #[test]
    fn pong_echo_is_optional() {
        let msg = Envelope::decode(r#"{"type":"pong","timestamp":7}"#).unwrap();
        assert_eq!(
            msg,
            Envelope::Pong {
                timestamp: 7,
                echo: None
            }
        );
        let text = Envelope::Pong {
            timestamp: 8,
            echo: Some(7),
        }
        .encode()
        .unwrap();
        assert!(text.contains(r#""echo":7"#));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = Envelope::decode(r#"{"type":"tunnel.register"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(t) if t == "tunnel.register"));
    }

    #[test]
    fn rejects_missing_type_and_bad_json() {
        assert!(matches!(
            Envelope::decode(r#"{"channel":1}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            Envelope::decode("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_channel() {
        let err = Envelope::decode(r#"{"type":"ipc_data","channel":10,"data":""}"#).unwrap_err();
        assert!(matches!(err, DecodeError::ChannelOutOfRange(10)));
    }

    #[test]
    fn rejects_missing_channel_and_bad_base64() {
        let err = Envelope::decode(r#"{"type":"ipc_response","data":"AA=="}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { ref kind, .. } if kind == "ipc_response"));

        let err = Envelope::decode(r#"{"type":"ipc_data","channel":0,"data":"%%%"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }
}
