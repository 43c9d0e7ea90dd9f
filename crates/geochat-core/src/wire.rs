//! # Wire Payloads
//!
//! JSON payloads exchanged between peers, plus the backlog text format.
//!
//! Every field is mandatory except the advisory `kind` on a direct message.
//! Decoding fails closed: a payload missing any field is rejected as a whole
//! and never partially applied.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::{Coordinate, Identity, MessageKind, PeerAddress};

/// Default discovery topic
pub const DISCOVERY_TOPIC: &str = "users/online";

/// Default prefix of per-recipient backlog topics
pub const BACKLOG_TOPIC_PREFIX: &str = "messages";

/// Separator between timestamp and message in a backlog entry
pub const ENTRY_SEPARATOR: &str = " | ";

/// Separator between backlog entries
pub const ENTRY_DELIMITER: char = '\n';

/// Timestamp layout used on every message
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Backlog topic for `identity` under `prefix`
pub fn backlog_topic(prefix: &str, identity: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), identity)
}

/// Local wall-clock timestamp in [`TIMESTAMP_FORMAT`]
pub fn timestamp_now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Presence announcement published on the discovery channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    pub username: Identity,
    pub latitude: f64,
    pub longitude: f64,
    pub ip: String,
    pub port: u16,
}

impl DiscoveryAnnouncement {
    pub fn new(username: impl Into<Identity>, coordinate: Coordinate, address: PeerAddress) -> Self {
        Self {
            username: username.into(),
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            ip: address.host,
            port: address.port,
        }
    }

    /// Decode and validate a raw announcement
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let announcement: Self = serde_json::from_slice(raw)
            .map_err(|e| ProtocolError::InvalidAnnouncement(e.to_string()))?;
        announcement.validate()?;
        Ok(announcement)
    }

    /// Encode to JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(ProtocolError::InvalidAnnouncement(
                "empty username".to_string(),
            ));
        }
        if self.ip.trim().is_empty() {
            return Err(ProtocolError::InvalidAnnouncement("empty ip".to_string()));
        }
        if !self.coordinate().is_valid() {
            return Err(ProtocolError::InvalidAnnouncement(format!(
                "coordinate out of range: {}",
                self.coordinate()
            )));
        }
        Ok(())
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.ip.clone(), self.port)
    }
}

/// Full backlog blob retained on a recipient's backlog topic
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatedMessageEnvelope {
    pub sender: Identity,
    pub accumulated_text: String,
}

impl AccumulatedMessageEnvelope {
    pub fn new(sender: impl Into<Identity>, accumulated_text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            accumulated_text: accumulated_text.into(),
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(raw)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        if envelope.sender.trim().is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty sender".to_string()));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Split the blob into its individual entries
    pub fn entries(&self) -> Vec<BacklogEntry> {
        parse_backlog(&self.accumulated_text)
    }
}

/// Body of a `receiveMessage` call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub sender: Identity,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
}

impl DirectMessage {
    pub fn new(sender: impl Into<Identity>, message: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
            timestamp: timestamp.into(),
            kind: Some(MessageKind::Direct),
        }
    }
}

/// One `(timestamp, message)` pair out of a backlog blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BacklogEntry {
    pub timestamp: String,
    pub message: String,
}

impl BacklogEntry {
    /// Render as `"<timestamp> | <message>"`
    pub fn format(&self) -> String {
        format_entry(&self.timestamp, &self.message)
    }
}

/// Render a single backlog entry
pub fn format_entry(timestamp: &str, message: &str) -> String {
    format!("{timestamp}{ENTRY_SEPARATOR}{message}")
}

/// Split accumulated text into entries.
///
/// Lines are split on the first separator only, so messages containing
/// `" | "` survive intact. A line with no separator becomes a message with an
/// empty timestamp. Blank lines are skipped.
pub fn parse_backlog(text: &str) -> Vec<BacklogEntry> {
    text.split(ENTRY_DELIMITER)
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(ENTRY_SEPARATOR) {
            Some((timestamp, message)) => BacklogEntry {
                timestamp: timestamp.trim().to_string(),
                message: message.to_string(),
            },
            None => BacklogEntry {
                timestamp: String::new(),
                message: line.to_string(),
            },
        })
        .collect()
}
