//! Common types for the XMPP server.

use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::parser::ns;

/// Registry collection a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// C2S and BOSH sessions
    Client,
    /// S2S federation, either direction
    Server,
    /// XEP-0114 external components
    Component,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Client => write!(f, "client"),
            StreamKind::Server => write!(f, "server"),
            StreamKind::Component => write!(f, "component"),
        }
    }
}

/// Connection flavor, selecting which state graph negotiates the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Client-to-server over TCP
    Client,
    /// Server-to-server, accepted from a peer
    ServerInbound,
    /// Server-to-server, initiated by us
    ServerOutbound,
    /// External component
    Component,
    /// Client over BOSH
    Http,
}

impl Flavor {
    /// Registry collection for this flavor.
    pub fn kind(&self) -> StreamKind {
        match self {
            Flavor::Client | Flavor::Http => StreamKind::Client,
            Flavor::ServerInbound | Flavor::ServerOutbound => StreamKind::Server,
            Flavor::Component => StreamKind::Component,
        }
    }

    /// Default namespace of stanzas on this stream.
    pub fn content_ns(&self) -> &'static str {
        match self {
            Flavor::Client | Flavor::Http => ns::JABBER_CLIENT,
            Flavor::ServerInbound | Flavor::ServerOutbound => ns::JABBER_SERVER,
            Flavor::Component => ns::COMPONENT_ACCEPT,
        }
    }

    /// Whether we are the initiating entity.
    pub fn is_initiator(&self) -> bool {
        matches!(self, Flavor::ServerOutbound)
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flavor::Client => write!(f, "c2s"),
            Flavor::ServerInbound => write!(f, "s2s-in"),
            Flavor::ServerOutbound => write!(f, "s2s-out"),
            Flavor::Component => write!(f, "component"),
            Flavor::Http => write!(f, "bosh"),
        }
    }
}

/// Stanza type for metrics and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
    /// Negotiation or other non-stanza element
    Other,
}

impl StanzaType {
    /// Classify a top-level element.
    pub fn of(element: &Element) -> Self {
        match element.name() {
            "message" => StanzaType::Message,
            "presence" => StanzaType::Presence,
            "iq" => StanzaType::Iq,
            _ => StanzaType::Other,
        }
    }
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
            StanzaType::Other => write!(f, "other"),
        }
    }
}
