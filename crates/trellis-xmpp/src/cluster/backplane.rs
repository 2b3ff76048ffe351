//! Transport and shared directory behind the cluster.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, FullJid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

use crate::XmppError;

/// The capacity of each individual broadcast channel.
const CHANNEL_CAPACITY: usize = 128;

/// Publish/subscribe bus shared by all nodes.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` on `channel`, returning how many subscribers got it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, XmppError>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Receiver<String>, XmppError>;
}

/// One full JID's entry in the shared session directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Node owning the connection
    pub node: String,
    pub available: bool,
    pub interested: bool,
    /// Serialized last broadcast presence
    #[serde(default)]
    pub presence: Option<String>,
}

/// Replicated session table reachable by every node.
///
/// Each operation is atomic on its own; nothing spans several calls.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Upsert the record of a full JID.
    async fn save(&self, jid: &FullJid, record: SessionRecord) -> Result<(), XmppError>;

    /// Remove the record of a full JID.
    async fn delete(&self, jid: &FullJid) -> Result<(), XmppError>;

    /// All records under a bare JID.
    async fn find(&self, jid: &BareJid) -> Result<Vec<(FullJid, SessionRecord)>, XmppError>;

    /// Remove every record owned by `node`, returning how many were removed.
    async fn delete_node(&self, node: &str) -> Result<usize, XmppError>;
}

/// In-process bus and directory, shared by every node built on the same
/// instance.
#[derive(Debug, Default)]
pub struct MemoryBackplane {
    channels: DashMap<String, Arc<Sender<String>>>,
    sessions: RwLock<HashMap<BareJid, HashMap<FullJid, SessionRecord>>>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of records in the directory.
    pub fn session_count(&self) -> usize {
        self.sessions.read().values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl PubSub for MemoryBackplane {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, XmppError> {
        let receivers = match self.channels.get(channel) {
            // `send` only fails when nobody is listening.
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        };
        debug!(channel = %channel, receivers, "Published cluster message");
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Receiver<String>, XmppError> {
        Ok(self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe())
    }
}

#[async_trait]
impl SessionDirectory for MemoryBackplane {
    async fn save(&self, jid: &FullJid, record: SessionRecord) -> Result<(), XmppError> {
        self.sessions
            .write()
            .entry(jid.to_bare())
            .or_default()
            .insert(jid.clone(), record);
        Ok(())
    }

    async fn delete(&self, jid: &FullJid) -> Result<(), XmppError> {
        let mut sessions = self.sessions.write();
        let bare = jid.to_bare();
        if let Some(resources) = sessions.get_mut(&bare) {
            resources.remove(jid);
            if resources.is_empty() {
                sessions.remove(&bare);
            }
        }
        Ok(())
    }

    async fn find(&self, jid: &BareJid) -> Result<Vec<(FullJid, SessionRecord)>, XmppError> {
        Ok(self
            .sessions
            .read()
            .get(jid)
            .map(|resources| {
                resources
                    .iter()
                    .map(|(jid, record)| (jid.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_node(&self, node: &str) -> Result<usize, XmppError> {
        let mut sessions = self.sessions.write();
        let mut removed = 0;
        sessions.retain(|_, resources| {
            let before = resources.len();
            resources.retain(|_, record| record.node != node);
            removed += before - resources.len();
            !resources.is_empty()
        });
        Ok(removed)
    }
}
