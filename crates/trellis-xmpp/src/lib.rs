//! # trellis-xmpp
//!
//! XMPP server core: stream negotiation, stanza routing and clustering.
//!
//! ## Architecture
//!
//! - **Connections**: one task per TCP stream owns the socket, an
//!   incremental XML parser, a token-bucket rate limiter and a
//!   negotiation [`state::Machine`]
//! - **BOSH**: HTTP long-polling sessions run the same machine behind an
//!   axum endpoint
//! - **Router**: delivers stanzas to local streams, remote servers
//!   (opening S2S streams on demand) and other cluster nodes
//! - **Cluster**: nodes share a session directory and exchange stanzas
//!   over a pub/sub backplane
//!
//! Accounts, certificates and stanza handling beyond routing are
//! collaborators behind the [`storage::Storage`], [`certs::CertStore`] and
//! [`handler::StanzaHandler`] traits.

pub mod certs;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod parser;
pub mod router;
pub mod s2s;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod stream;
pub mod tls;
pub mod token_bucket;

mod error;
mod types;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{
    generate_stream_error, stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError,
};
pub use parser::{ns, StreamHeader, XmlEvent, XmlParser};
pub use router::Router;
pub use server::{RunningServer, ServerAddresses, XmppServer};
pub use token_bucket::TokenBucket;
pub use types::*;
