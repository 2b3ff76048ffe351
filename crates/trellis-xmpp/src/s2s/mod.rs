//! Server-to-server federation plumbing.
//!
//! Inbound streams are accepted by the server listener and negotiated by the
//! inbound server graph. Outbound streams are opened on demand by
//! [`S2sConnector`] when the router has stanzas for a federated domain:
//! `_xmpp-server._tcp` SRV lookup, TCP connect, then the outbound graph
//! (STARTTLS and SASL EXTERNAL).

pub mod dns;
pub mod outbound;

pub use dns::{DnsError, ResolvedTarget, SrvResolver, TargetResolver, DEFAULT_S2S_PORT};
pub use outbound::S2sConnector;
