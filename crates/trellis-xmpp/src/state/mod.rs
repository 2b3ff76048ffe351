//! Stream negotiation as explicit state graphs.
//!
//! Each connection flavor walks a fixed sequence of [`StateId`]s, one
//! [`State`] at a time. A state sees every parsed event while it is current
//! and answers with a [`Step`]; the [`Machine`] applies it. Transport work
//! (TLS upgrade, parser restart, closing) is handed back to the owner of the
//! socket.
//!
//! | Flavor | Sequence |
//! |---|---|
//! | Client | Start, Tls, AuthRestart, Auth, BindRestart, Bind, Ready |
//! | Inbound server | Start, Tls, AuthRestart, Auth, FinalRestart, Ready |
//! | Outbound server | Start, Tls, TlsResult, AuthRestart, Auth, AuthResult, FinalRestart, FinalFeatures, Ready |
//! | Component | Start, Handshake, Ready |
//! | BOSH | Start, Auth, BindRestart, Bind, Ready |

pub mod client;
pub mod common;
pub mod component;
pub mod http;
pub mod server;

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{generate_sasl_failure, stanza_error_reply};
use crate::handler::is_silent;
use crate::parser::{is_stanza, XmlEvent};
use crate::stream::Stream;
use crate::types::Flavor;
use crate::XmppError;

/// Identity of a negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateId {
    Start,
    Tls,
    TlsResult,
    AuthRestart,
    Auth,
    AuthResult,
    BindRestart,
    Bind,
    FinalRestart,
    FinalFeatures,
    Handshake,
    Ready,
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the machine should do after a state handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep the current state
    Stay,
    /// Move to the state's successor
    Advance,
    /// Jump to a specific state
    AdvanceTo(StateId),
    /// Upgrade the transport to TLS, then advance
    StartTls,
    /// Advance and begin a new stream document on the same transport
    Restart,
    /// Close the stream
    Close,
}

/// One state of a negotiation graph.
#[async_trait]
pub trait State: Send + Sync + fmt::Debug {
    fn id(&self) -> StateId;

    /// The state [`Step::Advance`] leads to.
    fn success(&self) -> Option<StateId>;

    /// Called when the state becomes current. May advance immediately.
    async fn enter(&mut self, _stream: &mut Stream) -> Result<Step, XmppError> {
        Ok(Step::Stay)
    }

    /// Handle one event.
    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError>;
}

impl PartialEq for dyn State {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.success() == other.success()
    }
}

const CLIENT: &[StateId] = &[
    StateId::Start,
    StateId::Tls,
    StateId::AuthRestart,
    StateId::Auth,
    StateId::BindRestart,
    StateId::Bind,
    StateId::Ready,
];

const SERVER_INBOUND: &[StateId] = &[
    StateId::Start,
    StateId::Tls,
    StateId::AuthRestart,
    StateId::Auth,
    StateId::FinalRestart,
    StateId::Ready,
];

const SERVER_OUTBOUND: &[StateId] = &[
    StateId::Start,
    StateId::Tls,
    StateId::TlsResult,
    StateId::AuthRestart,
    StateId::Auth,
    StateId::AuthResult,
    StateId::FinalRestart,
    StateId::FinalFeatures,
    StateId::Ready,
];

const COMPONENT: &[StateId] = &[StateId::Start, StateId::Handshake, StateId::Ready];

const HTTP: &[StateId] = &[
    StateId::Start,
    StateId::Auth,
    StateId::BindRestart,
    StateId::Bind,
    StateId::Ready,
];

/// The state sequence of a flavor.
pub fn graph(flavor: Flavor) -> &'static [StateId] {
    match flavor {
        Flavor::Client => CLIENT,
        Flavor::ServerInbound => SERVER_INBOUND,
        Flavor::ServerOutbound => SERVER_OUTBOUND,
        Flavor::Component => COMPONENT,
        Flavor::Http => HTTP,
    }
}

/// The state following `id` in the graph of `flavor`.
pub fn successor(flavor: Flavor, id: StateId) -> Option<StateId> {
    let states = graph(flavor);
    states
        .iter()
        .position(|s| *s == id)
        .and_then(|i| states.get(i + 1))
        .copied()
}

/// Instantiate state `id` of the graph of `flavor`.
pub fn build(flavor: Flavor, id: StateId) -> Result<Box<dyn State>, XmppError> {
    if !graph(flavor).contains(&id) {
        return Err(XmppError::internal(format!(
            "{} streams have no {} state",
            flavor, id
        )));
    }
    let next = successor(flavor, id);

    let state: Box<dyn State> = match (flavor, id) {
        (Flavor::Client, StateId::Start) => Box::new(client::Start::new(next)),
        (Flavor::Client | Flavor::ServerInbound, StateId::Tls) => {
            Box::new(common::StartTls::new(next))
        }
        (Flavor::Client, StateId::AuthRestart) => Box::new(client::AuthRestart::new(next)),
        (Flavor::Client | Flavor::Http, StateId::Auth) => Box::new(client::PlainAuth::new(next)),
        (Flavor::Client | Flavor::Http, StateId::BindRestart) => {
            Box::new(client::BindRestart::new(next))
        }
        (Flavor::Client | Flavor::Http, StateId::Bind) => Box::new(client::Bind::new(next)),
        (Flavor::Client | Flavor::Http, StateId::Ready) => Box::new(client::Ready::new()),

        (Flavor::ServerInbound, StateId::Start) => Box::new(server::InboundStart::new(next)),
        (Flavor::ServerInbound, StateId::AuthRestart) => {
            Box::new(server::InboundAuthRestart::new(next))
        }
        (Flavor::ServerInbound, StateId::Auth) => Box::new(server::ExternalAuth::new(next)),
        (Flavor::ServerInbound, StateId::FinalRestart) => {
            Box::new(server::InboundFinalRestart::new(next))
        }
        (Flavor::ServerInbound, StateId::Ready) => Box::new(server::InboundReady::new()),

        (Flavor::ServerOutbound, StateId::Start) => Box::new(server::OutboundStart::new(next)),
        (Flavor::ServerOutbound, StateId::Tls) => Box::new(server::OutboundTls::new(next)),
        (Flavor::ServerOutbound, StateId::TlsResult) => Box::new(server::TlsResult::new(next)),
        (Flavor::ServerOutbound, StateId::AuthRestart) => {
            Box::new(server::OutboundAuthRestart::new(next))
        }
        (Flavor::ServerOutbound, StateId::Auth) => Box::new(server::OutboundAuth::new(next)),
        (Flavor::ServerOutbound, StateId::AuthResult) => Box::new(server::AuthResult::new(next)),
        (Flavor::ServerOutbound, StateId::FinalRestart) => {
            Box::new(server::OutboundFinalRestart::new(next))
        }
        (Flavor::ServerOutbound, StateId::FinalFeatures) => {
            Box::new(server::FinalFeatures::new(next))
        }
        (Flavor::ServerOutbound, StateId::Ready) => Box::new(server::OutboundReady::new()),

        (Flavor::Component, StateId::Start) => Box::new(component::Start::new(next)),
        (Flavor::Component, StateId::Handshake) => Box::new(component::Handshake::new(next)),
        (Flavor::Component, StateId::Ready) => Box::new(component::Ready::new()),

        (Flavor::Http, StateId::Start) => Box::new(http::Start::new(next)),

        (flavor, id) => {
            return Err(XmppError::internal(format!(
                "no {} state for {} streams",
                id, flavor
            )))
        }
    };
    Ok(state)
}

/// Drives one stream through its graph.
///
/// The owning task is the only caller, so events reach states strictly in
/// arrival order and never a state that has already been replaced.
#[derive(Debug)]
pub struct Machine {
    flavor: Flavor,
    current: Box<dyn State>,
    trail: Vec<StateId>,
}

impl Machine {
    /// A machine positioned on the first state. Call [`Machine::start`]
    /// before feeding events.
    pub fn new(flavor: Flavor) -> Result<Self, XmppError> {
        Ok(Self {
            flavor,
            current: build(flavor, StateId::Start)?,
            trail: vec![StateId::Start],
        })
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn current(&self) -> StateId {
        self.current.id()
    }

    pub fn state(&self) -> &dyn State {
        self.current.as_ref()
    }

    /// Every state visited, in order.
    pub fn trail(&self) -> &[StateId] {
        &self.trail
    }

    /// Enter the first state.
    pub async fn start(&mut self, stream: &mut Stream) -> Result<(), XmppError> {
        match self.current.enter(stream).await? {
            Step::Advance => self.advance(stream).await,
            Step::AdvanceTo(id) => self.transition(stream, id).await,
            _ => Ok(()),
        }
    }

    /// Move to the current state's successor.
    pub async fn advance(&mut self, stream: &mut Stream) -> Result<(), XmppError> {
        let next = self.current.success().ok_or_else(|| {
            XmppError::internal(format!("{} has no successor", self.current.id()))
        })?;
        self.transition(stream, next).await
    }

    async fn transition(&mut self, stream: &mut Stream, mut next: StateId) -> Result<(), XmppError> {
        loop {
            debug!(from = %self.current.id(), to = %next, flavor = %self.flavor, "State transition");
            self.current = build(self.flavor, next)?;
            self.trail.push(next);
            match self.current.enter(stream).await? {
                Step::Advance => {
                    next = self.current.success().ok_or_else(|| {
                        XmppError::internal(format!("{} has no successor", self.current.id()))
                    })?
                }
                Step::AdvanceTo(id) => next = id,
                _ => return Ok(()),
            }
        }
    }

    /// Feed one event to the current state.
    ///
    /// Graph moves are applied here. The returned step is one of
    /// [`Step::Stay`], [`Step::StartTls`], [`Step::Restart`] (already
    /// advanced; the caller restarts its document) or [`Step::Close`].
    /// SASL and stanza errors are answered on the stream and do not
    /// propagate; anything else is fatal.
    pub async fn process(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        if matches!(event, XmlEvent::StreamClose) {
            return Ok(Step::Close);
        }
        let original = match &event {
            XmlEvent::Stanza(element) if is_stanza(element) => Some(element.clone()),
            _ => None,
        };

        match self.current.node(stream, event).await {
            Ok(Step::Advance) => {
                self.advance(stream).await?;
                Ok(Step::Stay)
            }
            Ok(Step::AdvanceTo(id)) => {
                self.transition(stream, id).await?;
                Ok(Step::Stay)
            }
            Ok(Step::Restart) => {
                self.advance(stream).await?;
                Ok(Step::Restart)
            }
            Ok(step) => Ok(step),
            Err(XmppError::Sasl(condition)) => {
                debug!(condition, "SASL failure");
                stream.write_raw(generate_sasl_failure(condition));
                Ok(Step::Stay)
            }
            Err(XmppError::Stanza {
                condition,
                error_type,
                text,
            }) => {
                match original {
                    Some(stanza) if !is_silent(&stanza) => {
                        let reply =
                            stanza_error_reply(&stanza, condition, error_type, text.as_deref());
                        stream.reply(reply).await;
                    }
                    _ => warn!(condition = %condition, "Stanza error without a stanza to answer"),
                }
                Ok(Step::Stay)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successors_follow_graphs() {
        assert_eq!(successor(Flavor::Client, StateId::Start), Some(StateId::Tls));
        assert_eq!(successor(Flavor::Client, StateId::Bind), Some(StateId::Ready));
        assert_eq!(successor(Flavor::Client, StateId::Ready), None);
        assert_eq!(
            successor(Flavor::ServerInbound, StateId::Auth),
            Some(StateId::FinalRestart)
        );
        assert_eq!(
            successor(Flavor::ServerOutbound, StateId::Tls),
            Some(StateId::TlsResult)
        );
        assert_eq!(
            successor(Flavor::Component, StateId::Start),
            Some(StateId::Handshake)
        );
        assert_eq!(successor(Flavor::Http, StateId::Start), Some(StateId::Auth));
    }

    #[test]
    fn test_every_graph_state_builds() {
        for flavor in [
            Flavor::Client,
            Flavor::ServerInbound,
            Flavor::ServerOutbound,
            Flavor::Component,
            Flavor::Http,
        ] {
            for id in graph(flavor) {
                let state = build(flavor, *id).unwrap();
                assert_eq!(state.id(), *id);
                assert_eq!(state.success(), successor(flavor, *id));
            }
        }
        assert!(build(Flavor::Component, StateId::Bind).is_err());
    }

    #[test]
    fn test_state_equality_is_id_and_successor() {
        let a = build(Flavor::Client, StateId::Auth).unwrap();
        let b = build(Flavor::Http, StateId::Auth).unwrap();
        let c = build(Flavor::Client, StateId::Auth).unwrap();
        // same id, same successor
        assert!(*a == *b);
        assert!(*a == *c);

        let d = build(Flavor::ServerInbound, StateId::Auth).unwrap();
        assert!(*a != *d);
    }
}
