//! Per-connection negotiation context.
//!
//! A [`Stream`] is what protocol states operate on: identity, security
//! properties and an output queue. It owns no socket. The TCP connection
//! actor and the BOSH session actor drain [`Stream::take_output`] after every
//! element and write it on their own transport.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::certs::CertStore;
use crate::config::Config;
use crate::handler::StanzaHandler;
use crate::parser::{open_stream_xml, to_stream_xml};
use crate::router::{ConnectionHandle, Outbound, Router};
use crate::session::Session;
use crate::storage::Storage;
use crate::tls::TlsContext;
use crate::types::Flavor;

/// Collaborators shared by every connection of a server.
pub struct Services {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub certs: Arc<dyn CertStore>,
    pub handler: Arc<dyn StanzaHandler>,
    /// `None` when no hosted domain has a certificate
    pub tls: Option<TlsContext>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("hosts", &self.config.hosts.len())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Negotiation context of one connection.
pub struct Stream {
    id: String,
    flavor: Flavor,
    session: Arc<Session>,
    services: Arc<Services>,
    router: Arc<Router>,
    sender: mpsc::Sender<Outbound>,
    peer: Option<SocketAddr>,
    secured: bool,
    peer_cert: Option<String>,
    requested_to: Option<String>,
    local_domain: Option<String>,
    remote_domain: Option<String>,
    header_sent: bool,
    attached: bool,
    ready: Option<oneshot::Sender<()>>,
    outbox: Vec<String>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("flavor", &self.flavor)
            .field("peer", &self.peer)
            .field("secured", &self.secured)
            .field("jid", &self.session.jid())
            .finish()
    }
}

impl Stream {
    /// Create the context for a new connection. Routed messages for it are
    /// expected on the receiver paired with `sender`.
    pub fn new(
        flavor: Flavor,
        services: Arc<Services>,
        router: Arc<Router>,
        sender: mpsc::Sender<Outbound>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            flavor,
            session: Arc::new(Session::new()),
            services,
            router,
            sender,
            peer,
            secured: false,
            peer_cert: None,
            requested_to: None,
            local_domain: None,
            remote_domain: None,
            header_sent: false,
            attached: false,
            ready: None,
            outbox: Vec::new(),
        }
    }

    /// Stream id sent in our header and used by the component handshake.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.services.storage
    }

    pub fn certs(&self) -> &Arc<dyn CertStore> {
        &self.services.certs
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether TLS was negotiated.
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// The peer's certificate, PEM encoded, if it presented one.
    pub fn peer_cert(&self) -> Option<&str> {
        self.peer_cert.as_deref()
    }

    /// Record a completed TLS handshake.
    pub fn set_secured(&mut self, peer_cert: Option<String>) {
        self.secured = true;
        self.peer_cert = peer_cert;
    }

    /// The `to` of the first stream header we received.
    pub fn requested_to(&self) -> Option<&str> {
        self.requested_to.as_deref()
    }

    pub fn set_requested_to(&mut self, to: impl Into<String>) {
        self.requested_to = Some(to.into());
    }

    /// Our domain on an outbound server stream.
    pub fn local_domain(&self) -> Option<&str> {
        self.local_domain.as_deref()
    }

    pub fn set_local_domain(&mut self, domain: impl Into<String>) {
        self.local_domain = Some(domain.into());
    }

    /// The peer's domain on a server stream.
    pub fn remote_domain(&self) -> Option<&str> {
        self.remote_domain.as_deref()
    }

    pub fn set_remote_domain(&mut self, domain: impl Into<String>) {
        self.remote_domain = Some(domain.into());
    }

    /// Whether we already opened our side of the stream.
    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    /// Queue an element, serialized for this stream's content namespace.
    pub fn write(&mut self, element: &Element) {
        self.outbox.push(to_stream_xml(element, self.flavor.content_ns()));
    }

    /// Queue raw XML.
    pub fn write_raw(&mut self, xml: impl Into<String>) {
        self.outbox.push(xml.into());
    }

    /// Queue our stream header. BOSH sessions carry no header; the `<body/>`
    /// attributes stand in for it.
    pub fn open_stream(&mut self, from: Option<&str>, to: Option<&str>) {
        self.header_sent = true;
        if self.flavor == Flavor::Http {
            return;
        }
        let id = (!self.flavor.is_initiator()).then_some(self.id.as_str());
        let header = open_stream_xml(self.flavor.content_ns(), id, from, to);
        self.outbox.push(header);
    }

    /// Everything queued since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    /// Handle under which the router reaches this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.flavor, Arc::clone(&self.session), self.sender.clone())
    }

    /// Register with the router. Outbound server streams are attached by the
    /// router itself once the connector reports them ready.
    pub fn attach(&mut self) {
        if !self.attached {
            self.router.attach(self.handle());
            self.attached = true;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Channel notified once an outbound stream can carry stanzas.
    pub fn set_ready_signal(&mut self, ready: oneshot::Sender<()>) {
        self.ready = Some(ready);
    }

    /// Report an outbound stream ready. Only the first call has an effect.
    pub fn signal_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            // the router attaches the stream on receipt
            self.attached = true;
            if ready.send(()).is_err() {
                debug!("Outbound stream ready but nobody is waiting");
            }
        }
    }

    /// Send an error reply back toward the originator of a stanza.
    ///
    /// Inbound server streams are receive-only, so replies to a remote
    /// sender go out through the router instead.
    pub async fn reply(&mut self, reply: Element) {
        if self.flavor == Flavor::ServerInbound {
            if let Err(e) = self.router.deliver(reply).await {
                debug!(error = %e, "Error reply undeliverable");
            }
        } else {
            self.write(&reply);
        }
    }

    /// Leave the router and cluster and let the handler clean up.
    ///
    /// Runs once; later calls are ignored.
    pub async fn teardown(&mut self) {
        if !self.session.close() {
            return;
        }
        if self.attached {
            self.router.detach(self.session.id());
            self.attached = false;
        }
        if let (Some(cluster), Some(jid)) = (self.router.cluster().cloned(), self.session.jid()) {
            if let Err(e) = cluster.delete_session(&jid).await {
                warn!(jid = %jid, error = %e, "Failed to delete cluster session");
            }
        }
        let handler = Arc::clone(&self.services.handler);
        handler.disconnected(self).await;
    }
}
