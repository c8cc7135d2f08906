//! Push channel message and state types.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named category of server-pushed messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushTopic {
    /// A grant newly matched the user's profile.
    NewMatch,
    /// An already matched grant changed.
    MatchUpdated,
    /// A saved grant's deadline is approaching.
    DeadlineReminder,
}

impl PushTopic {
    pub const ALL: [PushTopic; 3] = [
        PushTopic::NewMatch,
        PushTopic::MatchUpdated,
        PushTopic::DeadlineReminder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PushTopic::NewMatch => "new_match",
            PushTopic::MatchUpdated => "match_updated",
            PushTopic::DeadlineReminder => "deadline_reminder",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        PushTopic::ALL.into_iter().find(|topic| topic.name() == name)
    }
}

impl fmt::Display for PushTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pushed message. The payload is passed to subscribers unmodified.
#[derive(Clone, Debug, PartialEq)]
pub struct PushMessage {
    pub topic: PushTopic,
    pub payload: serde_json::Value,
}

/// Frame layout on the wire, in either JSON text or MessagePack binary.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    #[serde(alias = "event")]
    topic: String,
    #[serde(alias = "data", default)]
    payload: serde_json::Value,
}

impl PushMessage {
    pub fn new(topic: PushTopic, payload: serde_json::Value) -> Self {
        Self { topic, payload }
    }

    /// Decode a JSON text frame. Frames for unknown topics decode to `None`.
    pub fn decode_text(text: &str) -> Result<Option<Self>> {
        let frame: WireFrame =
            serde_json::from_str(text).map_err(|e| SyncError::InvalidFrame(e.to_string()))?;
        Ok(Self::from_frame(frame))
    }

    /// Decode a MessagePack binary frame. Frames for unknown topics decode
    /// to `None`.
    pub fn decode_binary(bytes: &[u8]) -> Result<Option<Self>> {
        let frame: WireFrame =
            rmp_serde::from_slice(bytes).map_err(|e| SyncError::InvalidFrame(e.to_string()))?;
        Ok(Self::from_frame(frame))
    }

    fn from_frame(frame: WireFrame) -> Option<Self> {
        match PushTopic::from_name(&frame.topic) {
            Some(topic) => Some(Self::new(topic, frame.payload)),
            None => {
                tracing::trace!(topic = %frame.topic, "Ignoring push for unknown topic");
                None
            }
        }
    }

    fn to_frame(&self) -> WireFrame {
        WireFrame {
            topic: self.topic.name().to_string(),
            payload: self.payload.clone(),
        }
    }

    pub fn encode_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_frame())?)
    }

    pub fn encode_binary(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(&self.to_frame())?)
    }
}

/// Connection state of a [`PushChannel`](super::PushChannel).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// Waiting for or performing reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
}

impl ChannelState {
    pub fn is_disconnected(self) -> bool {
        self == ChannelState::Disconnected
    }
}
