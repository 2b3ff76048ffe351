//! Multi-node operation.
//!
//! Every node has a random id, broadcasts a heartbeat once per second on
//! [`ALL_NODES`] and listens on its own private channel for stanzas and
//! account updates routed to it. Sessions are published to a shared
//! [`SessionDirectory`] so any node can find resources bound elsewhere and
//! reach them through a [`RemoteSession`].
//!
//! A peer silent for more than five seconds is considered dead and its
//! sessions are purged, the same as if it had broadcast "offline". Directory
//! writes, heartbeats and expiry are not atomic with each other, so a dead
//! node's sessions may stay visible for up to that timeout.

mod backplane;
mod message;

pub use backplane::{MemoryBackplane, PubSub, SessionDirectory, SessionRecord};
pub use message::{node_channel, Envelope, MessageType, ALL_NODES};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::metrics;
use crate::router::Router;
use crate::session::Session;
use crate::XmppError;

/// How often a node announces itself.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Silence after which a peer is considered dead, in milliseconds.
pub const NODE_TIMEOUT_MS: i64 = 5_000;

/// Current wall clock in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Liveness of one peer, in our clock.
#[derive(Debug, Clone, Copy)]
struct PeerClock {
    /// Our clock minus the peer's, measured on its first message
    offset: i64,
    /// Peer's latest heartbeat time translated to our clock
    last_seen: i64,
}

/// This node's membership in the cluster.
pub struct Cluster {
    id: String,
    pubsub: Arc<dyn PubSub>,
    directory: Arc<dyn SessionDirectory>,
    nodes: Mutex<HashMap<String, PeerClock>>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("peers", &self.nodes.lock().len())
            .finish()
    }
}

impl Cluster {
    /// Create a node with a fresh random id.
    pub fn new(pubsub: Arc<dyn PubSub>, directory: Arc<dyn SessionDirectory>) -> Self {
        let id = Uuid::new_v4().to_string();
        info!(node = %id, "Cluster node created");
        Self {
            id,
            pubsub,
            directory,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a node on an in-process backplane.
    pub fn in_memory(backplane: Arc<MemoryBackplane>) -> Self {
        Self::new(backplane.clone(), backplane)
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peers currently considered alive.
    pub fn peers(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    /// Publish this node's ownership of a bound session.
    #[instrument(name = "xmpp.cluster.save_session", skip(self, session), fields(node = %self.id))]
    pub async fn save_session(&self, session: &Session) -> Result<(), XmppError> {
        let Some(jid) = session.jid() else {
            return Ok(());
        };
        let record = SessionRecord {
            node: self.id.clone(),
            available: session.is_available(),
            interested: session.is_interested(),
            presence: session.last_presence().map(|p| String::from(&p)),
        };
        debug!(jid = %jid, "Saving cluster session");
        self.directory.save(&jid, record).await
    }

    /// Remove a session from the directory.
    #[instrument(name = "xmpp.cluster.delete_session", skip(self), fields(node = %self.id))]
    pub async fn delete_session(&self, jid: &FullJid) -> Result<(), XmppError> {
        self.directory.delete(jid).await
    }

    /// Sessions of `jid` owned by other nodes.
    pub async fn remote_sessions(
        self: &Arc<Self>,
        jid: &Jid,
    ) -> Result<Vec<RemoteSession>, XmppError> {
        let records = self.directory.find(&jid.to_bare()).await?;
        let full = jid.try_as_full().ok();
        Ok(records
            .into_iter()
            .filter(|(bound, record)| {
                record.node != self.id && full.map(|full| full == bound).unwrap_or(true)
            })
            .map(|(bound, record)| RemoteSession {
                jid: bound,
                record,
                cluster: Arc::clone(self),
            })
            .collect())
    }

    /// Send a stanza to the node owning its recipient.
    #[instrument(name = "xmpp.cluster.route", skip(self, stanza), fields(node = %self.id))]
    pub async fn route(&self, stanza: &Element, target: &str) -> Result<(), XmppError> {
        let envelope = Envelope::stanza(&self.id, String::from(stanza));
        self.publish_to(target, envelope).await
    }

    /// Send a stanza to one resource bound on `target`. The stanza keeps its
    /// own `to`, which may be the bare JID.
    #[instrument(name = "xmpp.cluster.route_to", skip(self, stanza), fields(node = %self.id))]
    pub async fn route_to(
        &self,
        stanza: &Element,
        recipient: &FullJid,
        target: &str,
    ) -> Result<(), XmppError> {
        let envelope = Envelope::stanza_for(&self.id, String::from(stanza), recipient.to_string());
        self.publish_to(target, envelope).await
    }

    async fn publish_to(&self, target: &str, envelope: Envelope) -> Result<(), XmppError> {
        let payload = envelope
            .encode()
            .map_err(|e| XmppError::cluster(e.to_string()))?;
        self.pubsub.publish(&node_channel(target), payload).await?;
        Ok(())
    }

    /// Ask `target` to reload `jid` and push the change to its resources.
    #[instrument(name = "xmpp.cluster.update_user", skip(self), fields(node = %self.id))]
    pub async fn update_user(&self, jid: &BareJid, target: &str) -> Result<(), XmppError> {
        let payload = Envelope::user(&self.id, jid.to_string())
            .encode()
            .map_err(|e| XmppError::cluster(e.to_string()))?;
        self.pubsub.publish(&node_channel(target), payload).await?;
        Ok(())
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<(), XmppError> {
        let payload = envelope
            .encode()
            .map_err(|e| XmppError::cluster(e.to_string()))?;
        self.pubsub.publish(ALL_NODES, payload).await?;
        Ok(())
    }

    /// One heartbeat cycle: announce ourselves and expire silent peers.
    /// Failures are logged; the next cycle runs regardless.
    pub async fn tick(&self, now: i64) {
        if let Err(e) = self.broadcast(Envelope::heartbeat(&self.id, now)).await {
            warn!(error = %e, "Failed to publish heartbeat");
        }
        self.expire_nodes(now).await;
    }

    /// Drop peers not heard from for more than [`NODE_TIMEOUT_MS`] and purge
    /// their sessions. Returns the expired node ids.
    pub async fn expire_nodes(&self, now: i64) -> Vec<String> {
        let expired: Vec<String> = {
            let nodes = self.nodes.lock();
            nodes
                .iter()
                .filter(|(_, clock)| now - clock.last_seen > NODE_TIMEOUT_MS)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for node in &expired {
            warn!(peer = %node, "Cluster node timed out");
            self.remove_node(node).await;
        }
        expired
    }

    /// Record a heartbeat sent at `time` by the peer's clock.
    fn observe(&self, node: &str, time: i64, now: i64) {
        let mut nodes = self.nodes.lock();
        let clock = nodes.entry(node.to_string()).or_insert_with(|| {
            info!(peer = %node, offset_ms = now - time, "Cluster node joined");
            PeerClock {
                offset: now - time,
                last_seen: now,
            }
        });
        clock.last_seen = time + clock.offset;
        metrics::record_cluster_nodes(nodes.len() as i64 + 1);
    }

    async fn remove_node(&self, node: &str) {
        let remaining = {
            let mut nodes = self.nodes.lock();
            nodes.remove(node);
            nodes.len()
        };
        metrics::record_cluster_nodes(remaining as i64 + 1);
        match self.directory.delete_node(node).await {
            Ok(removed) => info!(peer = %node, sessions = removed, "Purged sessions of departed node"),
            Err(e) => warn!(peer = %node, error = %e, "Failed to purge sessions of departed node"),
        }
    }

    /// Handle one payload from either subscribed channel.
    ///
    /// Malformed payloads are logged and dropped.
    pub async fn handle_message(&self, router: &Router, payload: &str, now: i64) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed cluster message");
                return;
            }
        };
        if envelope.from == self.id {
            return;
        }

        match envelope.kind {
            MessageType::Heartbeat | MessageType::Online => match envelope.time {
                Some(time) => self.observe(&envelope.from, time, now),
                None => warn!(peer = %envelope.from, "Heartbeat without time"),
            },
            MessageType::Offline => {
                info!(peer = %envelope.from, "Cluster node left");
                self.remove_node(&envelope.from).await;
            }
            MessageType::Stanza => {
                let stanza = envelope.stanza.as_deref().map(str::parse::<Element>);
                let recipient = match envelope.jid.as_deref().map(str::parse::<FullJid>) {
                    None => None,
                    Some(Ok(jid)) => Some(jid),
                    Some(Err(e)) => {
                        warn!(error = %e, "Dropping cluster stanza with invalid recipient");
                        return;
                    }
                };
                match stanza {
                    Some(Ok(stanza)) => {
                        if let Err(e) = router.deliver_from_cluster(stanza, recipient).await {
                            debug!(error = %e, "Cluster stanza undeliverable");
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Dropping unparsable cluster stanza"),
                    None => warn!("Dropping cluster stanza message without stanza"),
                }
            }
            MessageType::User => match envelope.jid.as_deref().map(str::parse::<BareJid>) {
                Some(Ok(jid)) => router.notify_local_user_updated(&jid),
                _ => warn!("Dropping user update without valid jid"),
            },
        }
    }

    /// Announce ourselves to the cluster.
    pub async fn join(&self) -> Result<(), XmppError> {
        self.broadcast(Envelope::online(&self.id, now_ms())).await
    }

    /// Announce departure and drop our sessions from the directory.
    pub async fn leave(&self) {
        if let Err(e) = self.broadcast(Envelope::offline(&self.id)).await {
            warn!(error = %e, "Failed to publish offline");
        }
        if let Err(e) = self.directory.delete_node(&self.id).await {
            warn!(error = %e, "Failed to delete own sessions");
        }
    }

    /// Subscribe, join and run the heartbeat loop until `shutdown`.
    pub async fn start(
        self: &Arc<Self>,
        router: Arc<Router>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, XmppError> {
        let mut all = self.pubsub.subscribe(ALL_NODES).await?;
        let mut own = self.pubsub.subscribe(&node_channel(&self.id)).await?;
        self.join().await?;

        let cluster = Arc::clone(self);
        let span = info_span!("xmpp.cluster", node = %self.id);
        Ok(tokio::spawn(
            async move {
                let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Cluster node shutting down");
                            cluster.leave().await;
                            return;
                        }
                        _ = heartbeat.tick() => cluster.tick(now_ms()).await,
                        received = all.recv() => {
                            if !cluster.receive(&router, received).await {
                                return;
                            }
                        }
                        received = own.recv() => {
                            if !cluster.receive(&router, received).await {
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        ))
    }

    /// Returns `false` once the channel is gone.
    async fn receive(&self, router: &Router, received: Result<String, RecvError>) -> bool {
        match received {
            Ok(payload) => {
                self.handle_message(router, &payload, now_ms()).await;
                true
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Cluster subscriber lagged");
                true
            }
            Err(RecvError::Closed) => {
                warn!("Cluster channel closed");
                false
            }
        }
    }
}

/// A session bound on another node.
#[derive(Clone)]
pub struct RemoteSession {
    jid: FullJid,
    record: SessionRecord,
    cluster: Arc<Cluster>,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("jid", &self.jid)
            .field("node", &self.record.node)
            .finish()
    }
}

impl RemoteSession {
    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    /// Owning node.
    pub fn node(&self) -> &str {
        &self.record.node
    }

    pub fn is_available(&self) -> bool {
        self.record.available
    }

    pub fn is_interested(&self) -> bool {
        self.record.interested
    }

    pub fn last_presence(&self) -> Option<Element> {
        self.record
            .presence
            .as_deref()
            .and_then(|p| p.parse::<Element>().ok())
    }

    /// Forward a stanza to the owning node.
    pub async fn write(&self, stanza: Element) -> Result<(), XmppError> {
        self.cluster
            .route_to(&stanza, &self.jid, &self.record.node)
            .await
    }
}
