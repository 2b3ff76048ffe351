//! Logical session state shared between a connection and the router.

use std::sync::atomic::{AtomicBool, Ordering};

use jid::{BareJid, FullJid};
use minidom::Element;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::storage::User;

/// Identity and presence flags of one negotiated stream.
///
/// The owning connection is the only writer; the router and other
/// connections read it through [`crate::router::ConnectionHandle`]. For BOSH
/// the same session outlives the individual HTTP requests carrying it.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    jid: RwLock<Option<FullJid>>,
    user: RwLock<Option<User>>,
    domain: RwLock<Option<String>>,
    available: AtomicBool,
    interested: AtomicBool,
    last_presence: RwLock<Option<Element>>,
    closed: AtomicBool,
}

impl Session {
    /// Create an unauthenticated session.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            jid: RwLock::new(None),
            user: RwLock::new(None),
            domain: RwLock::new(None),
            available: AtomicBool::new(false),
            interested: AtomicBool::new(false),
            last_presence: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Unique id, also used as the router registry key.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bound full JID.
    pub fn jid(&self) -> Option<FullJid> {
        self.jid.read().clone()
    }

    /// Bare JID of the bound resource.
    pub fn bare_jid(&self) -> Option<BareJid> {
        self.jid.read().as_ref().map(|j| j.to_bare())
    }

    /// Record the bound resource.
    pub fn set_jid(&self, jid: FullJid) {
        *self.jid.write() = Some(jid);
    }

    /// Authenticated account, if any.
    pub fn user(&self) -> Option<User> {
        self.user.read().clone()
    }

    /// Record the authenticated account.
    pub fn set_user(&self, user: User) {
        *self.user.write() = Some(user);
    }

    /// Whether SASL succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.user.read().is_some()
    }

    /// Domain this stream is about: the local vhost for clients, the peer
    /// domain for servers, the component domain for components.
    pub fn domain(&self) -> Option<String> {
        self.domain.read().clone()
    }

    /// Set the stream domain.
    pub fn set_domain(&self, domain: impl Into<String>) {
        *self.domain.write() = Some(domain.into());
    }

    /// Whether initial presence was sent.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Update the available flag.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Whether the roster was requested.
    pub fn is_interested(&self) -> bool {
        self.interested.load(Ordering::Acquire)
    }

    /// Update the interested flag.
    pub fn set_interested(&self, interested: bool) {
        self.interested.store(interested, Ordering::Release);
    }

    /// Last broadcast presence.
    pub fn last_presence(&self) -> Option<Element> {
        self.last_presence.read().clone()
    }

    /// Record the last broadcast presence.
    pub fn set_last_presence(&self, presence: Option<Element>) {
        *self.last_presence.write() = presence;
    }

    /// Mark the session closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether the session was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
