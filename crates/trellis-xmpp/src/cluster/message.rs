//! Wire format of cluster pub/sub messages.

use serde::{Deserialize, Serialize};

/// Broadcast channel every node subscribes to.
pub const ALL_NODES: &str = "cluster:nodes:all";

/// Private channel of one node.
pub fn node_channel(node: &str) -> String {
    format!("cluster:nodes:{}", node)
}

/// What an [`Envelope`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Heartbeat,
    Online,
    Offline,
    Stanza,
    User,
}

/// JSON envelope published on cluster channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node id
    pub from: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Sender's clock in milliseconds, on heartbeat and online
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    /// Serialized stanza, on stanza
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stanza: Option<String>,
    /// Bare JID whose account changed, on user; the one resource a
    /// stanza is for, on stanza
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
}

impl Envelope {
    fn new(from: &str, kind: MessageType) -> Self {
        Self {
            from: from.to_string(),
            kind,
            time: None,
            stanza: None,
            jid: None,
        }
    }

    pub fn heartbeat(from: &str, time: i64) -> Self {
        Self {
            time: Some(time),
            ..Self::new(from, MessageType::Heartbeat)
        }
    }

    pub fn online(from: &str, time: i64) -> Self {
        Self {
            time: Some(time),
            ..Self::new(from, MessageType::Online)
        }
    }

    pub fn offline(from: &str) -> Self {
        Self::new(from, MessageType::Offline)
    }

    pub fn stanza(from: &str, stanza: String) -> Self {
        Self {
            stanza: Some(stanza),
            ..Self::new(from, MessageType::Stanza)
        }
    }

    /// A stanza for exactly one resource, whatever its `to` says.
    pub fn stanza_for(from: &str, stanza: String, recipient: String) -> Self {
        Self {
            jid: Some(recipient),
            ..Self::stanza(from, stanza)
        }
    }

    pub fn user(from: &str, jid: String) -> Self {
        Self {
            jid: Some(jid),
            ..Self::new(from, MessageType::User)
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
