//! Stanza routing.
//!
//! The [`Router`] keeps the registry of live connections on this process,
//! answers "which resources does this JID have", and delivers stanzas either
//! to local connections, to other cluster nodes or over server-to-server
//! streams. Outbound S2S streams are established on demand; stanzas for a
//! domain wait in a pending queue until its stream is ready.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::cluster::{Cluster, RemoteSession};
use crate::config::Config;
use crate::error::{is_error_stanza, stanza_error_reply, StanzaErrorCondition};
use crate::metrics;
use crate::session::Session;
use crate::types::{Flavor, StanzaType, StreamKind};
use crate::XmppError;

/// Messages delivered to a connection task from outside.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Write a stanza to the peer
    Stanza(Element),
    /// The account was changed elsewhere; reload it and push the roster
    UserUpdated(BareJid),
    /// Close the stream with the given stream error condition
    Close(&'static str),
}

/// Result of attempting to send a message to a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum SendResult {
    /// Message was successfully queued for delivery
    Sent,
    /// The channel to the recipient is full (backpressure)
    ChannelFull,
    /// The channel to the recipient is closed
    ChannelClosed,
}

/// A live connection as seen from the router.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    flavor: Flavor,
    session: Arc<Session>,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle for a connection task listening on `sender`.
    pub fn new(flavor: Flavor, session: Arc<Session>, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            flavor,
            session,
            sender,
        }
    }

    /// Registry key, the session id.
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn kind(&self) -> StreamKind {
        self.flavor.kind()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Local vhost for clients, peer domain for servers and components.
    pub fn domain(&self) -> Option<String> {
        self.session.domain()
    }

    /// Queue a message for the connection without waiting.
    pub fn send(&self, message: Outbound) -> SendResult {
        match self.sender.try_send(message) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.id(), "Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = %self.id(), "Outbound channel closed, connection may have dropped");
                SendResult::ChannelClosed
            }
        }
    }
}

/// A bound resource, on this node or on another cluster node.
///
/// Callers write to either variant the same way and cannot tell a local
/// delivery from a cluster-routed one.
#[derive(Debug, Clone)]
pub enum Resource {
    Local(ConnectionHandle),
    Remote(RemoteSession),
}

impl Resource {
    /// Deliver a stanza to this resource.
    pub async fn write(&self, stanza: Element) -> Result<(), XmppError> {
        match self {
            Resource::Local(handle) => match handle.send(Outbound::Stanza(stanza)) {
                SendResult::Sent => Ok(()),
                SendResult::ChannelFull => Err(XmppError::stanza(
                    StanzaErrorCondition::ResourceConstraint,
                    Some("recipient is not keeping up".to_string()),
                )),
                SendResult::ChannelClosed => Err(XmppError::stanza(
                    StanzaErrorCondition::RecipientUnavailable,
                    None,
                )),
            },
            Resource::Remote(remote) => remote.write(stanza).await,
        }
    }

    /// Whether the resource sent initial presence.
    pub fn is_available(&self) -> bool {
        match self {
            Resource::Local(handle) => handle.session().is_available(),
            Resource::Remote(remote) => remote.is_available(),
        }
    }

    /// Whether the resource requested its roster.
    pub fn is_interested(&self) -> bool {
        match self {
            Resource::Local(handle) => handle.session().is_interested(),
            Resource::Remote(remote) => remote.is_interested(),
        }
    }

    /// Bound full JID.
    pub fn jid(&self) -> Option<FullJid> {
        match self {
            Resource::Local(handle) => handle.session().jid(),
            Resource::Remote(remote) => Some(remote.jid().clone()),
        }
    }

    /// Last broadcast presence.
    pub fn last_presence(&self) -> Option<Element> {
        match self {
            Resource::Local(handle) => handle.session().last_presence(),
            Resource::Remote(remote) => remote.last_presence(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Resource::Local(_))
    }
}

/// Establishes outbound server-to-server streams.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `remote` on behalf of `local` and return the handle once
    /// the stream is ready to carry stanzas. The returned handle is not yet
    /// attached; the router does that.
    async fn connect(
        &self,
        router: Arc<Router>,
        local: String,
        remote: String,
    ) -> Result<ConnectionHandle, XmppError>;
}

/// Connector used when federation is disabled.
pub struct NullConnector;

#[async_trait]
impl Connector for NullConnector {
    async fn connect(
        &self,
        _router: Arc<Router>,
        _local: String,
        remote: String,
    ) -> Result<ConnectionHandle, XmppError> {
        Err(XmppError::remote_server_not_found(Some(format!(
            "federation with {} is disabled",
            remote
        ))))
    }
}

/// Process-local registry of live connections and stanza router.
pub struct Router {
    config: Arc<Config>,
    clients: DashMap<Uuid, ConnectionHandle>,
    servers: DashMap<Uuid, ConnectionHandle>,
    components: DashMap<Uuid, ConnectionHandle>,
    /// Stanzas waiting for an outbound stream, keyed by remote domain
    pending: Mutex<HashMap<String, Vec<Element>>>,
    /// Held while an account checks its resources and binds a new one
    binding: DashMap<BareJid, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn Connector>,
    cluster: Option<Arc<Cluster>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("clients", &self.clients.len())
            .field("servers", &self.servers.len())
            .field("components", &self.components.len())
            .field("clustered", &self.cluster.is_some())
            .finish()
    }
}

impl Router {
    /// Create a router that opens outbound streams with `connector`.
    pub fn new(config: Arc<Config>, connector: Arc<dyn Connector>) -> Self {
        info!("Creating router");
        Self {
            config,
            clients: DashMap::new(),
            servers: DashMap::new(),
            components: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            binding: DashMap::new(),
            connector,
            cluster: None,
        }
    }

    /// Defer to `cluster` for JIDs not connected to this process.
    pub fn with_cluster(mut self, cluster: Arc<Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    fn registry(&self, kind: StreamKind) -> &DashMap<Uuid, ConnectionHandle> {
        match kind {
            StreamKind::Client => &self.clients,
            StreamKind::Server => &self.servers,
            StreamKind::Component => &self.components,
        }
    }

    /// Register a connection under its flavor.
    #[instrument(name = "xmpp.router.attach", skip(self, handle), fields(connection = %handle.id(), kind = %handle.kind()))]
    pub fn attach(&self, handle: ConnectionHandle) {
        let kind = handle.kind();
        let registry = self.registry(kind);
        if registry.insert(handle.id(), handle).is_some() {
            debug!("Replaced existing registration");
        } else {
            debug!("Attached connection");
        }
        metrics::record_connection_count(registry.len() as i64, kind);
    }

    /// Remove a connection from whichever collection holds it.
    #[instrument(name = "xmpp.router.detach", skip(self))]
    pub fn detach(&self, id: Uuid) -> Option<ConnectionHandle> {
        for kind in [StreamKind::Client, StreamKind::Server, StreamKind::Component] {
            let registry = self.registry(kind);
            if let Some((_, handle)) = registry.remove(&id) {
                debug!(kind = %kind, "Detached connection");
                metrics::record_connection_count(registry.len() as i64, kind);
                return Some(handle);
            }
        }
        None
    }

    /// Serialize resource binding for one account on this node.
    ///
    /// The resource count and the new registration happen under the same
    /// guard, so concurrent binds cannot both pass the limit or claim the
    /// same resource. Release it with [`Router::finish_binding`].
    pub async fn begin_binding(&self, bare: &BareJid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .binding
            .entry(bare.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the guard from [`Router::begin_binding`] and forget the lock
    /// once nobody else waits on it.
    pub fn finish_binding(&self, bare: &BareJid, guard: tokio::sync::OwnedMutexGuard<()>) {
        drop(guard);
        self.binding
            .remove_if(bare, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of attached connections of one kind.
    pub fn count(&self, kind: StreamKind) -> usize {
        self.registry(kind).len()
    }

    /// Number of attached connections.
    pub fn size(&self) -> usize {
        self.clients.len() + self.servers.len() + self.components.len()
    }

    /// Bound client connections on this node matching a bare or full JID.
    pub fn local_resources(&self, jid: &Jid) -> Vec<ConnectionHandle> {
        let bare = jid.to_bare();
        let full = jid.try_as_full().ok();
        self.clients
            .iter()
            .filter(|entry| match entry.value().session().jid() {
                Some(bound) => match full {
                    Some(full) => &bound == full,
                    None => bound.to_bare() == bare,
                },
                None => false,
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Resources of `jid`, local and on other cluster nodes, visible to
    /// `asking`.
    pub async fn connected_resources(&self, jid: &Jid, asking: &Jid) -> Vec<Resource> {
        if !self.config.allowed(jid, asking) {
            debug!(jid = %jid, asking = %asking, "Resources hidden by visibility policy");
            return Vec::new();
        }

        let mut resources: Vec<Resource> = self
            .local_resources(jid)
            .into_iter()
            .map(Resource::Local)
            .collect();

        if let Some(cluster) = &self.cluster {
            match cluster.remote_sessions(jid).await {
                Ok(remote) => resources.extend(remote.into_iter().map(Resource::Remote)),
                Err(e) => warn!(jid = %jid, error = %e, "Cluster session lookup failed"),
            }
        }
        resources
    }

    /// Resources of any of `jids` that sent initial presence.
    pub async fn available_resources(&self, jids: &[Jid], asking: &Jid) -> Vec<Resource> {
        let mut resources = Vec::new();
        for jid in jids {
            resources.extend(
                self.connected_resources(jid, asking)
                    .await
                    .into_iter()
                    .filter(Resource::is_available),
            );
        }
        resources
    }

    /// Resources of any of `jids` that requested their roster.
    pub async fn interested_resources(&self, jids: &[Jid], asking: &Jid) -> Vec<Resource> {
        let mut resources = Vec::new();
        for jid in jids {
            resources.extend(
                self.connected_resources(jid, asking)
                    .await
                    .into_iter()
                    .filter(Resource::is_interested),
            );
        }
        resources
    }

    /// Whether a stanza is for this server: no `to`, or a hosted domain.
    pub fn is_local(&self, stanza: &Element) -> bool {
        match stanza.attr("to") {
            None => true,
            Some(to) => match Jid::new(to) {
                Ok(jid) => self.config.is_local_domain(jid.domain().as_str()),
                Err(_) => false,
            },
        }
    }

    /// The outbound server or component stream that carries stanzas for
    /// `domain`.
    fn owner(&self, domain: &str) -> Option<ConnectionHandle> {
        let owns = |handle: &ConnectionHandle| handle.domain().as_deref() == Some(domain);
        self.components
            .iter()
            .find(|entry| owns(entry.value()))
            .or_else(|| {
                self.servers.iter().find(|entry| {
                    entry.value().flavor() == Flavor::ServerOutbound && owns(entry.value())
                })
            })
            .map(|entry| entry.value().clone())
    }

    /// Send a stanza toward a domain not hosted here.
    ///
    /// Stanzas hidden by the visibility policy are dropped silently. A domain
    /// with a pending outbound attempt queues the stanza; a domain owned by a
    /// component or ready outbound stream gets it directly; an allow-listed
    /// domain starts a new attempt. Anything else is `remote-server-not-found`.
    #[instrument(name = "xmpp.router.route", skip(self, stanza), fields(to = ?stanza.attr("to")))]
    pub fn route(self: &Arc<Self>, stanza: Element) -> Result<(), XmppError> {
        let to = parse_jid(stanza.attr("to"))?;
        let from = parse_jid(stanza.attr("from"))?;

        if !self.config.allowed(&to, &from) {
            debug!(from = %from, "Dropping stanza hidden by visibility policy");
            return Ok(());
        }

        let domain = to.domain().to_string();

        {
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.get_mut(&domain) {
                queue.push(stanza);
                debug!(domain = %domain, queued = queue.len(), "Queued stanza behind pending connection");
                metrics::record_stanza_routed("queued");
                return Ok(());
            }
        }

        if let Some(owner) = self.owner(&domain) {
            return self.send_to_owner(&owner, stanza);
        }

        if self.config.s2s_allowed(&domain) {
            let mut pending = self.pending.lock();
            // An attempt may have finished since the first check.
            if let Some(owner) = self.owner(&domain) {
                drop(pending);
                return self.send_to_owner(&owner, stanza);
            }
            match pending.get_mut(&domain) {
                Some(queue) => queue.push(stanza),
                None => {
                    pending.insert(domain.clone(), vec![stanza]);
                    self.start_outbound(from.domain().to_string(), domain);
                }
            }
            metrics::record_stanza_routed("queued");
            return Ok(());
        }

        debug!(domain = %domain, "No route to domain");
        Err(XmppError::remote_server_not_found(None))
    }

    fn send_to_owner(&self, owner: &ConnectionHandle, stanza: Element) -> Result<(), XmppError> {
        match owner.send(Outbound::Stanza(stanza)) {
            SendResult::Sent => {
                metrics::record_stanza_routed(match owner.kind() {
                    StreamKind::Component => "component",
                    _ => "s2s",
                });
                Ok(())
            }
            SendResult::ChannelFull => Err(XmppError::resource_constraint(None)),
            SendResult::ChannelClosed => {
                self.detach(owner.id());
                Err(XmppError::remote_server_not_found(None))
            }
        }
    }

    fn start_outbound(self: &Arc<Self>, local: String, remote: String) {
        info!(local = %local, remote = %remote, "Starting outbound server connection");
        metrics::record_s2s_connection_attempt();

        let router = Arc::clone(self);
        let span = info_span!("xmpp.s2s.outbound", remote = %remote);
        tokio::spawn(
            async move {
                let result = router
                    .connector
                    .connect(Arc::clone(&router), local, remote.clone())
                    .await;
                router.finish_outbound(&remote, result).await;
            }
            .instrument(span),
        );
    }

    /// Resolve a pending outbound attempt exactly once.
    ///
    /// On success the stream is attached and queued stanzas are flushed to
    /// it in enqueue order. On failure each queued stanza is bounced to its
    /// sender as `remote-server-not-found`.
    pub async fn finish_outbound(
        self: &Arc<Self>,
        domain: &str,
        result: Result<ConnectionHandle, XmppError>,
    ) {
        let failed = {
            let mut pending = self.pending.lock();
            let queue = pending.remove(domain).unwrap_or_default();
            match result {
                Ok(handle) => {
                    info!(domain = %domain, queued = queue.len(), "Outbound connection ready");
                    self.attach(handle.clone());
                    let mut undelivered = Vec::new();
                    for stanza in queue {
                        if handle.send(Outbound::Stanza(stanza.clone())) == SendResult::Sent {
                            metrics::record_stanza_routed("s2s");
                        } else {
                            undelivered.push(stanza);
                        }
                    }
                    undelivered
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, queued = queue.len(), "Outbound connection failed");
                    queue
                }
            }
        };

        for stanza in failed {
            self.bounce(&stanza, StanzaErrorCondition::RemoteServerNotFound)
                .await;
        }
    }

    /// Return an error reply for `stanza` to its sender.
    pub async fn bounce(self: &Arc<Self>, stanza: &Element, condition: StanzaErrorCondition) {
        if is_error_stanza(stanza) || stanza.attr("from").is_none() {
            return;
        }
        let reply = stanza_error_reply(stanza, condition, condition.default_type(), None);
        if let Err(e) = self.deliver_local(reply).await {
            debug!(error = %e, "Bounce undeliverable");
        }
    }

    /// Deliver a stanza wherever it is addressed.
    ///
    /// Local domains are handled here; everything else goes through
    /// [`Router::route`].
    #[instrument(name = "xmpp.router.deliver", skip(self, stanza), fields(to = ?stanza.attr("to")))]
    pub async fn deliver(self: &Arc<Self>, stanza: Element) -> Result<(), XmppError> {
        if self.is_local(&stanza) {
            self.deliver_local(stanza).await
        } else {
            self.route(stanza)
        }
    }

    /// Deliver a stanza addressed to a hosted domain to its resources.
    async fn deliver_local(&self, stanza: Element) -> Result<(), XmppError> {
        let to = parse_jid(stanza.attr("to"))?;
        let from = match stanza.attr("from") {
            Some(from) => parse_jid(Some(from))?,
            None => Jid::from(to.to_bare()),
        };
        if !self.config.allowed(&to, &from) {
            debug!(from = %from, "Dropping stanza hidden by visibility policy");
            return Ok(());
        }

        let kind = StanzaType::of(&stanza);
        let silent = is_error_stanza(&stanza);
        if to.node().is_none() {
            // addressed to the server itself, nothing left to do here
            return match kind {
                StanzaType::Iq if !silent => Err(XmppError::service_unavailable(None)),
                _ => Ok(()),
            };
        }

        let mut targets = Vec::new();
        if to.resource().is_some() {
            targets = self.connected_resources(&to, &from).await;
        }
        if targets.is_empty() {
            let bare = Jid::from(to.to_bare());
            targets = match (kind, to.resource().is_some()) {
                (StanzaType::Message, _) | (StanzaType::Presence, false) => {
                    self.available_resources(std::slice::from_ref(&bare), &from)
                        .await
                }
                _ => Vec::new(),
            };
        }

        if targets.is_empty() {
            return match kind {
                StanzaType::Presence => Ok(()),
                _ if silent => Ok(()),
                _ => Err(XmppError::service_unavailable(None)),
            };
        }

        for target in targets {
            if let Err(e) = target.write(stanza.clone()).await {
                debug!(to = ?target.jid(), error = %e, "Delivery to resource failed");
            }
        }
        metrics::record_stanza_routed("local");
        Ok(())
    }

    /// Hand a stanza that arrived from another cluster node to the local
    /// resources it names. With a `recipient` only that resource gets it,
    /// even when the stanza is addressed to the bare JID.
    pub async fn deliver_from_cluster(
        &self,
        stanza: Element,
        recipient: Option<FullJid>,
    ) -> Result<(), XmppError> {
        let to = match recipient {
            Some(full) => Jid::from(full),
            None => parse_jid(stanza.attr("to"))?,
        };
        let handles = self.local_resources(&to);
        if handles.is_empty() {
            debug!(to = %to, "Cluster stanza for resource no longer here");
        }
        for handle in handles {
            Resource::Local(handle).write(stanza.clone()).await?;
        }
        metrics::record_stanza_routed("cluster");
        Ok(())
    }

    /// Tell every resource of `jid`, here and on other nodes, that the
    /// account changed.
    #[instrument(name = "xmpp.router.user_updated", skip(self))]
    pub async fn notify_user_updated(&self, jid: &BareJid) {
        self.notify_local_user_updated(jid);

        if let Some(cluster) = &self.cluster {
            match cluster.remote_sessions(&Jid::from(jid.clone())).await {
                Ok(remote) => {
                    let mut nodes: Vec<&str> = remote.iter().map(RemoteSession::node).collect();
                    nodes.sort_unstable();
                    nodes.dedup();
                    for node in nodes {
                        if let Err(e) = cluster.update_user(jid, node).await {
                            warn!(node = %node, error = %e, "Failed to publish user update");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Cluster session lookup failed"),
            }
        }
    }

    /// Local half of [`Router::notify_user_updated`].
    pub fn notify_local_user_updated(&self, jid: &BareJid) {
        for handle in self.local_resources(&Jid::from(jid.clone())) {
            handle.send(Outbound::UserUpdated(jid.clone()));
        }
    }

    /// Ask every attached connection to close with `condition`.
    pub fn close_all(&self, condition: &'static str) {
        for registry in [&self.clients, &self.servers, &self.components] {
            for entry in registry.iter() {
                entry.value().send(Outbound::Close(condition));
            }
        }
    }
}

fn parse_jid(value: Option<&str>) -> Result<Jid, XmppError> {
    let value = value.ok_or_else(|| XmppError::stanza(StanzaErrorCondition::JidMalformed, None))?;
    Jid::new(value).map_err(|e| {
        XmppError::stanza(StanzaErrorCondition::JidMalformed, Some(e.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, ServerConfig};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            hosts: vec![
                HostConfig::new("example.com").with_component("chat.example.com", "secret"),
                HostConfig::new("example.org"),
            ],
            server: Some(ServerConfig {
                bind: SocketAddr::from(([127, 0, 0, 1], 5269)),
                hosts: vec!["remote.org".to_string()],
            }),
            ..Default::default()
        })
    }

    fn client(jid: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let session = Arc::new(Session::new());
        let jid: FullJid = jid.parse().unwrap();
        session.set_domain(jid.domain().as_str());
        session.set_jid(jid);
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(Flavor::Client, session, tx), rx)
    }

    fn peer(flavor: Flavor, domain: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let session = Arc::new(Session::new());
        session.set_domain(domain);
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(flavor, session, tx), rx)
    }

    fn message(from: &str, to: &str, id: &str) -> Element {
        Element::builder("message", crate::parser::ns::JABBER_CLIENT)
            .attr("from", from)
            .attr("to", to)
            .attr("id", id)
            .attr("type", "chat")
            .build()
    }

    fn received(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Element> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Outbound::Stanza(stanza) = message {
                out.push(stanza);
            }
        }
        out
    }

    /// Connector whose attempts block until released.
    struct GatedConnector {
        gate: Arc<Notify>,
        outcome: Mutex<Option<Result<ConnectionHandle, XmppError>>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(
            &self,
            _router: Arc<Router>,
            _local: String,
            _remote: String,
        ) -> Result<ConnectionHandle, XmppError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.outcome
                .lock()
                .take()
                .unwrap_or_else(|| Err(XmppError::internal("no outcome")))
        }
    }

    #[test]
    fn test_attach_and_detach() {
        let router = Router::new(config(), Arc::new(NullConnector));
        let (alice, _rx) = client("alice@example.com/phone");
        let (server, _srx) = peer(Flavor::ServerInbound, "remote.org");
        router.attach(alice.clone());
        router.attach(server.clone());

        assert_eq!(router.count(StreamKind::Client), 1);
        assert_eq!(router.count(StreamKind::Server), 1);
        assert_eq!(router.size(), 2);

        assert!(router.detach(alice.id()).is_some());
        assert!(router.detach(alice.id()).is_none());
        assert_eq!(router.count(StreamKind::Client), 0);
        assert_eq!(router.size(), 1);
    }

    #[tokio::test]
    async fn test_connected_resources_by_bare_and_full() {
        let router = Router::new(config(), Arc::new(NullConnector));
        let (phone, _a) = client("alice@example.com/phone");
        let (laptop, _b) = client("alice@example.com/laptop");
        let (bob, _c) = client("bob@example.com/desk");
        router.attach(phone);
        router.attach(laptop.clone());
        router.attach(bob);
        laptop.session().set_available(true);

        let asking: Jid = "bob@example.com/desk".parse().unwrap();
        let bare: Jid = "alice@example.com".parse().unwrap();
        let full: Jid = "alice@example.com/phone".parse().unwrap();

        assert_eq!(router.connected_resources(&bare, &asking).await.len(), 2);
        assert_eq!(router.connected_resources(&full, &asking).await.len(), 1);

        let available = router
            .available_resources(std::slice::from_ref(&bare), &asking)
            .await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].jid().unwrap().resource().as_str(), "laptop");
        assert!(router
            .interested_resources(std::slice::from_ref(&bare), &asking)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_visibility_hides_other_local_hosts() {
        let router = Router::new(config(), Arc::new(NullConnector));
        let (alice, _rx) = client("alice@example.com/phone");
        router.attach(alice);

        let bare: Jid = "alice@example.com".parse().unwrap();
        let outsider: Jid = "eve@example.org".parse().unwrap();
        assert!(router.connected_resources(&bare, &outsider).await.is_empty());
    }

    #[test]
    fn test_is_local() {
        let router = Router::new(config(), Arc::new(NullConnector));
        let to_server = Element::builder("iq", crate::parser::ns::JABBER_CLIENT).build();
        assert!(router.is_local(&to_server));
        assert!(router.is_local(&message("a@example.com", "b@example.org", "1")));
        assert!(!router.is_local(&message("a@example.com", "b@remote.org", "1")));
        assert!(!router.is_local(&message("a@example.com", "room@chat.example.com", "1")));
    }

    #[tokio::test]
    async fn test_route_unknown_domain_is_remote_server_not_found() {
        let router = Arc::new(Router::new(config(), Arc::new(NullConnector)));
        let err = router
            .route(message("alice@example.com/phone", "juliet@unknown.net", "1"))
            .unwrap_err();
        assert!(matches!(
            err,
            XmppError::Stanza {
                condition: StanzaErrorCondition::RemoteServerNotFound,
                ..
            }
        ));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_route_to_component_owner() {
        let router = Arc::new(Router::new(config(), Arc::new(NullConnector)));
        let (component, mut rx) = peer(Flavor::Component, "chat.example.com");
        router.attach(component);

        router
            .route(message("alice@example.com/phone", "room@chat.example.com", "1"))
            .unwrap();
        assert_eq!(received(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_pending_queue_flushes_in_order() {
        let gate = Arc::new(Notify::new());
        let (remote, mut remote_rx) = peer(Flavor::ServerOutbound, "remote.org");
        let connector = Arc::new(GatedConnector {
            gate: Arc::clone(&gate),
            outcome: Mutex::new(Some(Ok(remote))),
            attempts: AtomicUsize::new(0),
        });
        let router = Arc::new(Router::new(config(), connector.clone()));

        for id in ["1", "2", "3"] {
            router
                .route(message("alice@example.com/phone", "juliet@remote.org", id))
                .unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        gate.notify_one();
        for _ in 0..50 {
            if router.count(StreamKind::Server) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let ids: Vec<String> = received(&mut remote_rx)
            .iter()
            .map(|s| s.attr("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);

        router
            .route(message("alice@example.com/phone", "juliet@remote.org", "4"))
            .unwrap();
        assert_eq!(received(&mut remote_rx).len(), 1);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_outbound_bounces_queued_stanzas() {
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(GatedConnector {
            gate: Arc::clone(&gate),
            outcome: Mutex::new(Some(Err(XmppError::remote_server_not_found(None)))),
            attempts: AtomicUsize::new(0),
        });
        let router = Arc::new(Router::new(config(), connector));
        let (alice, mut alice_rx) = client("alice@example.com/phone");
        router.attach(alice);

        router
            .route(message("alice@example.com/phone", "juliet@remote.org", "1"))
            .unwrap();
        router
            .route(message("alice@example.com/phone", "juliet@remote.org", "2"))
            .unwrap();
        tokio::task::yield_now().await;
        gate.notify_one();

        let mut bounced = Vec::new();
        for _ in 0..50 {
            bounced.extend(received(&mut alice_rx));
            if bounced.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bounced.len(), 2);
        assert_eq!(bounced[0].attr("id"), Some("1"));
        assert_eq!(bounced[1].attr("id"), Some("2"));
        for reply in &bounced {
            assert_eq!(reply.attr("type"), Some("error"));
            let error = reply.get_child("error", crate::parser::ns::JABBER_CLIENT).unwrap();
            assert!(error
                .get_child("remote-server-not-found", crate::parser::ns::STANZAS)
                .is_some());
        }
        assert!(router.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_local_message() {
        let router = Arc::new(Router::new(config(), Arc::new(NullConnector)));
        let (bob, mut bob_rx) = client("bob@example.com/desk");
        router.attach(bob.clone());

        router
            .deliver(message("alice@example.com/phone", "bob@example.com/desk", "1"))
            .await
            .unwrap();
        assert_eq!(received(&mut bob_rx).len(), 1);

        // bare JID messages go to available resources only
        let err = router
            .deliver(message("alice@example.com/phone", "bob@example.com", "2"))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());

        bob.session().set_available(true);
        router
            .deliver(message("alice@example.com/phone", "bob@example.com", "3"))
            .await
            .unwrap();
        assert_eq!(received(&mut bob_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_notify_user_updated() {
        let router = Router::new(config(), Arc::new(NullConnector));
        let (alice, mut rx) = client("alice@example.com/phone");
        router.attach(alice);

        router
            .notify_user_updated(&"alice@example.com".parse().unwrap())
            .await;
        assert!(matches!(rx.try_recv(), Ok(Outbound::UserUpdated(_))));
    }
}
