//! Server-to-server graphs, both directions.
//!
//! Federation is authenticated with STARTTLS plus SASL EXTERNAL against the
//! peer's certificate. Dialback is not offered.

use async_trait::async_trait;
use base64::prelude::*;
use jid::Jid;
use minidom::Element;
use tracing::{debug, info, warn};

use super::common::{
    check_header, check_peer_header, expect_element, expect_header, features,
    mechanisms_feature, reply_header, starttls_feature,
};
use super::{State, StateId, Step};
use crate::error::{sasl_errors, stream_errors};
use crate::parser::{is_stanza, ns, XmlEvent};
use crate::stream::Stream;
use crate::XmppError;

/// The domain in a peer-supplied JID string.
fn domain_of(jid: &str) -> Option<String> {
    Jid::new(jid).ok().map(|j| j.domain().to_string())
}

/// Record the peer's `from` the first time it is announced.
fn note_remote(stream: &mut Stream, from: Option<&str>) {
    if stream.remote_domain().is_none() {
        if let Some(domain) = from.and_then(domain_of) {
            stream.set_remote_domain(domain);
        }
    }
}

/// Whether the peer certificate is trusted and names `domain`.
fn peer_cert_valid(stream: &Stream, domain: &str) -> bool {
    let Some(pem) = stream.peer_cert() else {
        debug!(domain = %domain, "Peer presented no certificate");
        return false;
    };
    if !stream.certs().trusted_for_peer(pem) {
        debug!(domain = %domain, "Peer certificate is not trusted");
        return false;
    }
    if !stream.certs().domain_matches(pem, domain) {
        debug!(domain = %domain, "Peer certificate does not name the domain");
        return false;
    }
    true
}

/// Receiving side: opens the stream and offers STARTTLS.
#[derive(Debug)]
pub struct InboundStart {
    next: Option<StateId>,
}

impl InboundStart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for InboundStart {
    fn id(&self) -> StateId {
        StateId::Start
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        note_remote(stream, header.from.as_deref());
        reply_header(stream);
        stream.write(&features(vec![starttls_feature(true)]));
        Ok(Step::Advance)
    }
}

/// Restart after TLS; offers EXTERNAL.
#[derive(Debug)]
pub struct InboundAuthRestart {
    next: Option<StateId>,
}

impl InboundAuthRestart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for InboundAuthRestart {
    fn id(&self) -> StateId {
        StateId::AuthRestart
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        note_remote(stream, header.from.as_deref());
        reply_header(stream);
        stream.write(&features(vec![mechanisms_feature(&["EXTERNAL"])]));
        Ok(Step::Advance)
    }
}

/// SASL EXTERNAL: the peer's certificate must be trusted and name the
/// domain it authenticates as, and that domain must be allow-listed.
#[derive(Debug)]
pub struct ExternalAuth {
    next: Option<StateId>,
}

impl ExternalAuth {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

/// The authorization identity of an EXTERNAL request; `=` or empty means
/// none was given.
pub fn decode_external(payload: &str) -> Result<Option<String>, XmppError> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "=" {
        return Ok(None);
    }
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|_| XmppError::Sasl(sasl_errors::INCORRECT_ENCODING))?;
    let authzid =
        String::from_utf8(bytes).map_err(|_| XmppError::Sasl(sasl_errors::MALFORMED_REQUEST))?;
    Ok((!authzid.is_empty()).then_some(authzid))
}

#[async_trait]
impl State for ExternalAuth {
    fn id(&self) -> StateId {
        StateId::Auth
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if element.is("abort", ns::SASL) {
            return Err(XmppError::Sasl(sasl_errors::ABORTED));
        }
        if !element.is("auth", ns::SASL) {
            return Err(XmppError::stream_with_text(
                stream_errors::NOT_AUTHORIZED,
                "authentication required",
            ));
        }
        if element.attr("mechanism") != Some("EXTERNAL") {
            return Err(XmppError::Sasl(sasl_errors::INVALID_MECHANISM));
        }

        let claimed = match decode_external(&element.text())? {
            Some(authzid) => Some(authzid),
            None => stream.remote_domain().map(str::to_string),
        };
        let Some(claimed) = claimed else {
            debug!("EXTERNAL without an identity to authenticate");
            return Err(XmppError::Sasl(sasl_errors::NOT_AUTHORIZED));
        };

        let accepted = stream.config().s2s_allowed(&claimed) && peer_cert_valid(stream, &claimed);
        crate::metrics::record_auth_attempt("EXTERNAL", accepted);
        if !accepted {
            warn!(domain = %claimed, "Rejected server authentication");
            return Err(XmppError::Sasl(sasl_errors::NOT_AUTHORIZED));
        }

        info!(domain = %claimed, "Server authenticated");
        stream.set_remote_domain(claimed.clone());
        stream.session().set_domain(claimed);
        stream.write(&Element::builder("success", ns::SASL).build());
        Ok(Step::Restart)
    }
}

/// Final restart; empty features, then the stream carries stanzas.
#[derive(Debug)]
pub struct InboundFinalRestart {
    next: Option<StateId>,
}

impl InboundFinalRestart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for InboundFinalRestart {
    fn id(&self) -> StateId {
        StateId::FinalRestart
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        reply_header(stream);
        stream.write(&features(Vec::new()));
        stream.attach();
        Ok(Step::Advance)
    }
}

/// Authenticated inbound stream. Receive only.
#[derive(Debug, Default)]
pub struct InboundReady;

impl InboundReady {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl State for InboundReady {
    fn id(&self) -> StateId {
        StateId::Ready
    }

    fn success(&self) -> Option<StateId> {
        None
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let stanza = expect_element(event)?;
        if !is_stanza(&stanza) {
            return Err(XmppError::stream(stream_errors::UNSUPPORTED_STANZA_TYPE));
        }

        let remote = stream.remote_domain().unwrap_or_default();
        let from = stanza.attr("from").and_then(domain_of);
        if from.as_deref() != Some(remote) {
            return Err(XmppError::stream_with_text(
                stream_errors::INVALID_FROM,
                format!("stanzas must come from {}", remote),
            ));
        }
        let to = stanza.attr("to").and_then(domain_of);
        match to {
            Some(domain) if stream.config().is_local_domain(&domain) || stream.config().is_component(&domain) => {}
            Some(_) => return Err(XmppError::stream(stream_errors::HOST_UNKNOWN)),
            None => return Err(XmppError::stream(stream_errors::IMPROPER_ADDRESSING)),
        }

        let handler = std::sync::Arc::clone(&stream.services().handler);
        handler.handle(stream, stanza).await?;
        Ok(Step::Stay)
    }
}

/// Initiating side: sends our header, waits for the peer's header and
/// features, then requests STARTTLS.
#[derive(Debug)]
pub struct OutboundStart {
    next: Option<StateId>,
}

impl OutboundStart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

/// Send the initiating header from our domain to the peer's.
fn open_outbound(stream: &mut Stream) {
    let local = stream.local_domain().map(str::to_string);
    let remote = stream.remote_domain().map(str::to_string);
    stream.open_stream(local.as_deref(), remote.as_deref());
}

#[async_trait]
impl State for OutboundStart {
    fn id(&self) -> StateId {
        StateId::Start
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn enter(&mut self, stream: &mut Stream) -> Result<Step, XmppError> {
        open_outbound(stream);
        Ok(Step::Stay)
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        match event {
            XmlEvent::StreamOpen(header) => {
                check_peer_header(stream, &header)?;
                Ok(Step::Stay)
            }
            event => {
                let element = expect_element(event)?;
                if element.is("features", ns::STREAM) && element.has_child("starttls", ns::TLS) {
                    stream.write(&Element::builder("starttls", ns::TLS).build());
                    return Ok(Step::Advance);
                }
                Err(XmppError::stream_with_text(
                    stream_errors::REMOTE_CONNECTION_FAILED,
                    "peer does not offer STARTTLS",
                ))
            }
        }
    }
}

/// Waits for `<proceed/>`.
#[derive(Debug)]
pub struct OutboundTls {
    next: Option<StateId>,
}

impl OutboundTls {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for OutboundTls {
    fn id(&self) -> StateId {
        StateId::Tls
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, _stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if element.is("proceed", ns::TLS) {
            return Ok(Step::StartTls);
        }
        Err(XmppError::stream_with_text(
            stream_errors::REMOTE_CONNECTION_FAILED,
            "STARTTLS refused",
        ))
    }
}

/// Reopens the stream over TLS.
#[derive(Debug)]
pub struct TlsResult {
    next: Option<StateId>,
}

impl TlsResult {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for TlsResult {
    fn id(&self) -> StateId {
        StateId::TlsResult
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn enter(&mut self, stream: &mut Stream) -> Result<Step, XmppError> {
        open_outbound(stream);
        Ok(Step::Stay)
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_peer_header(stream, &header)?;
        Ok(Step::Advance)
    }
}

/// Verifies the peer and requests EXTERNAL as our domain.
#[derive(Debug)]
pub struct OutboundAuthRestart {
    next: Option<StateId>,
}

impl OutboundAuthRestart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for OutboundAuthRestart {
    fn id(&self) -> StateId {
        StateId::AuthRestart
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if !element.is("features", ns::STREAM) {
            return Err(XmppError::stream(stream_errors::BAD_FORMAT));
        }

        let remote = stream.remote_domain().unwrap_or_default().to_string();
        if !peer_cert_valid(stream, &remote) {
            return Err(XmppError::stream_with_text(
                stream_errors::REMOTE_CONNECTION_FAILED,
                format!("certificate not valid for {}", remote),
            ));
        }

        let offers_external = element
            .get_child("mechanisms", ns::SASL)
            .map(|m| {
                m.children()
                    .any(|c| c.is("mechanism", ns::SASL) && c.text().trim() == "EXTERNAL")
            })
            .unwrap_or(false);
        if !offers_external {
            return Err(XmppError::stream_with_text(
                stream_errors::REMOTE_CONNECTION_FAILED,
                "peer does not offer SASL EXTERNAL",
            ));
        }

        let local = stream.local_domain().unwrap_or_default().to_string();
        let auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", "EXTERNAL")
            .append(minidom::Node::Text(BASE64_STANDARD.encode(local)))
            .build();
        stream.write(&auth);
        Ok(Step::Advance)
    }
}

/// Waits for the SASL outcome.
#[derive(Debug)]
pub struct OutboundAuth {
    next: Option<StateId>,
}

impl OutboundAuth {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for OutboundAuth {
    fn id(&self) -> StateId {
        StateId::Auth
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if element.is("success", ns::SASL) {
            info!(remote = ?stream.remote_domain(), "Authenticated to peer");
            return Ok(Step::Restart);
        }
        warn!(remote = ?stream.remote_domain(), response = %element.name(), "Peer rejected authentication");
        Err(XmppError::stream_with_text(
            stream_errors::REMOTE_CONNECTION_FAILED,
            "authentication rejected",
        ))
    }
}

/// Reopens the stream after SASL.
#[derive(Debug)]
pub struct AuthResult {
    next: Option<StateId>,
}

impl AuthResult {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for AuthResult {
    fn id(&self) -> StateId {
        StateId::AuthResult
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn enter(&mut self, stream: &mut Stream) -> Result<Step, XmppError> {
        open_outbound(stream);
        Ok(Step::Stay)
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_peer_header(stream, &header)?;
        Ok(Step::Advance)
    }
}

/// Waits for the final features.
#[derive(Debug)]
pub struct OutboundFinalRestart {
    next: Option<StateId>,
}

impl OutboundFinalRestart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for OutboundFinalRestart {
    fn id(&self) -> StateId {
        StateId::FinalRestart
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, _stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if element.is("features", ns::STREAM) {
            return Ok(Step::Advance);
        }
        Err(XmppError::stream(stream_errors::BAD_FORMAT))
    }
}

/// Announces the stream ready to the router and moves on.
#[derive(Debug)]
pub struct FinalFeatures {
    next: Option<StateId>,
}

impl FinalFeatures {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for FinalFeatures {
    fn id(&self) -> StateId {
        StateId::FinalFeatures
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn enter(&mut self, stream: &mut Stream) -> Result<Step, XmppError> {
        let remote = stream
            .remote_domain()
            .ok_or_else(|| XmppError::internal("outbound stream without a remote domain"))?
            .to_string();
        stream.session().set_domain(remote);
        stream.signal_ready();
        Ok(Step::Advance)
    }

    async fn node(&mut self, _stream: &mut Stream, _event: XmlEvent) -> Result<Step, XmppError> {
        Ok(Step::Advance)
    }
}

/// Established outbound stream. Stanzas only flow out; anything the peer
/// sends on it is dropped.
#[derive(Debug, Default)]
pub struct OutboundReady;

impl OutboundReady {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl State for OutboundReady {
    fn id(&self) -> StateId {
        StateId::Ready
    }

    fn success(&self) -> Option<StateId> {
        None
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        debug!(remote = ?stream.remote_domain(), element = %element.name(), "Dropping element received on outbound stream");
        Ok(Step::Stay)
    }
}
