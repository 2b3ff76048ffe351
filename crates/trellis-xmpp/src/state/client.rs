//! Client graph, also used by BOSH sessions from Auth onward.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, warn, Span};

use super::common::{
    bind_features, check_header, expect_element, expect_header, features, mechanisms_feature,
    reply_header, starttls_feature,
};
use super::{State, StateId, Step};
use crate::error::{sasl_errors, stream_errors, StanzaErrorCondition};
use crate::handler::result_iq;
use crate::metrics;
use crate::parser::{is_stanza, ns, XmlEvent};
use crate::stream::Stream;
use crate::types::StanzaType;
use crate::XmppError;

/// PLAIN attempts allowed before the stream is closed.
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Opens the stream and requires STARTTLS.
#[derive(Debug)]
pub struct Start {
    next: Option<StateId>,
}

impl Start {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for Start {
    fn id(&self) -> StateId {
        StateId::Start
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        reply_header(stream);
        stream.write(&features(vec![starttls_feature(true)]));
        Ok(Step::Advance)
    }
}

/// Stream restart after TLS; offers PLAIN.
#[derive(Debug)]
pub struct AuthRestart {
    next: Option<StateId>,
}

impl AuthRestart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for AuthRestart {
    fn id(&self) -> StateId {
        StateId::AuthRestart
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        reply_header(stream);
        stream.write(&features(vec![mechanisms_feature(&["PLAIN"])]));
        Ok(Step::Advance)
    }
}

/// SASL PLAIN against the storage collaborator.
#[derive(Debug)]
pub struct PlainAuth {
    next: Option<StateId>,
    attempts: u32,
}

impl PlainAuth {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next, attempts: 0 }
    }

    fn failed(&mut self) -> XmppError {
        self.attempts += 1;
        if self.attempts >= MAX_AUTH_ATTEMPTS {
            warn!(attempts = self.attempts, "Too many failed authentication attempts");
            XmppError::stream_with_text(
                stream_errors::POLICY_VIOLATION,
                "too many failed authentication attempts",
            )
        } else {
            XmppError::Sasl(sasl_errors::NOT_AUTHORIZED)
        }
    }
}

/// Split a PLAIN message into `(authzid, authcid, password)`.
pub fn decode_plain(payload: &str) -> Result<(String, String, String), XmppError> {
    let payload = payload.trim();
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|_| XmppError::Sasl(sasl_errors::INCORRECT_ENCODING))?;
    let text =
        String::from_utf8(bytes).map_err(|_| XmppError::Sasl(sasl_errors::MALFORMED_REQUEST))?;
    let mut parts = text.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(authzid), Some(authcid), Some(password), None) if !authcid.is_empty() => Ok((
            authzid.to_string(),
            authcid.to_string(),
            password.to_string(),
        )),
        _ => Err(XmppError::Sasl(sasl_errors::MALFORMED_REQUEST)),
    }
}

#[async_trait]
impl State for PlainAuth {
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
        if element.attr("mechanism") != Some("PLAIN") {
            return Err(XmppError::Sasl(sasl_errors::INVALID_MECHANISM));
        }

        let (_authzid, authcid, password) = decode_plain(&element.text())?;
        let domain = stream
            .requested_to()
            .ok_or_else(|| XmppError::internal("authentication before stream header"))?
            .to_string();
        let username = if authcid.contains('@') {
            authcid
        } else {
            format!("{}@{}", authcid, domain)
        };
        let Ok(username) = BareJid::new(&username) else {
            return Err(self.failed());
        };
        if username.domain().as_str() != domain {
            return Err(self.failed());
        }

        let user = stream.storage().authenticate(&username, &password).await?;
        metrics::record_auth_attempt("PLAIN", user.is_some());
        let Some(user) = user else {
            debug!(user = %username, "PLAIN authentication rejected");
            return Err(self.failed());
        };

        info!(user = %username, "Client authenticated");
        stream.session().set_user(user);
        stream.session().set_domain(domain);
        stream.write(&Element::builder("success", ns::SASL).build());
        Ok(Step::Restart)
    }
}

/// Stream restart after SASL; offers bind and session.
#[derive(Debug)]
pub struct BindRestart {
    next: Option<StateId>,
}

impl BindRestart {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for BindRestart {
    fn id(&self) -> StateId {
        StateId::BindRestart
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        reply_header(stream);
        stream.write(&features(bind_features()));
        Ok(Step::Advance)
    }
}

/// Whether `iq` is a legacy RFC 3921 session request.
fn is_session_request(iq: &Element) -> bool {
    iq.name() == "iq" && iq.attr("type") == Some("set") && iq.has_child("session", ns::SESSION)
}

/// Resource binding.
#[derive(Debug)]
pub struct Bind {
    next: Option<StateId>,
}

impl Bind {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

fn random_resource() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Bind a resource for the authenticated account and register the stream.
///
/// The requested resource is used unless it is missing, invalid or already
/// bound for the same account, in which case a random one is generated.
pub async fn bind_resource(stream: &mut Stream, requested: Option<&str>) -> Result<FullJid, XmppError> {
    if stream.session().jid().is_some() {
        return Err(XmppError::stanza(
            StanzaErrorCondition::NotAllowed,
            Some("a resource is already bound".into()),
        ));
    }
    let bare = stream
        .session()
        .user()
        .map(|u| u.jid)
        .ok_or_else(|| XmppError::not_authorized(None))?;
    let router = Arc::clone(stream.router());
    let guard = router.begin_binding(&bare).await;
    let bound = bind_locked(stream, &bare, requested).await;
    router.finish_binding(&bare, guard);
    let jid = bound?;

    Span::current().record("jid", tracing::field::display(&jid));
    info!(jid = %jid, "Resource bound");
    Ok(jid)
}

async fn bind_locked(
    stream: &mut Stream,
    bare: &BareJid,
    requested: Option<&str>,
) -> Result<FullJid, XmppError> {
    let asking = Jid::from(bare.clone());
    let existing = stream.router().connected_resources(&asking, &asking).await;
    let limit = stream.config().max_resources_per_account(bare.domain().as_str());
    if existing.len() >= limit {
        warn!(user = %bare, limit, "Resource limit reached");
        return Err(XmppError::resource_constraint(Some(format!(
            "at most {} resources per account",
            limit
        ))));
    }

    let taken = |resource: &str| {
        existing
            .iter()
            .any(|r| r.jid().map(|j| j.resource().as_str() == resource).unwrap_or(false))
    };
    let jid = match requested.map(str::trim).filter(|r| !r.is_empty() && !taken(r)) {
        Some(resource) => bare.with_resource_str(resource).ok(),
        None => None,
    };
    let jid = match jid {
        Some(jid) => jid,
        None => bare
            .with_resource_str(&random_resource())
            .map_err(|e| XmppError::internal(format!("generated resource rejected: {}", e)))?,
    };

    stream.session().set_jid(jid.clone());
    stream.attach();
    if let Some(cluster) = stream.router().cluster().cloned() {
        if let Err(e) = cluster.save_session(stream.session()).await {
            warn!(jid = %jid, error = %e, "Failed to publish cluster session");
        }
    }
    Ok(jid)
}

#[async_trait]
impl State for Bind {
    fn id(&self) -> StateId {
        StateId::Bind
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let iq = expect_element(event)?;
        if !is_stanza(&iq) {
            return Err(XmppError::stream(stream_errors::UNSUPPORTED_STANZA_TYPE));
        }
        if is_session_request(&iq) {
            stream.write(&result_iq(&iq).build());
            return Ok(Step::Stay);
        }

        let request = match (iq.name(), iq.attr("type")) {
            ("iq", Some("set")) => iq.get_child("bind", ns::BIND),
            _ => None,
        };
        let Some(request) = request else {
            return Err(XmppError::not_authorized(Some("bind a resource first".into())));
        };

        let requested = request
            .get_child("resource", ns::BIND)
            .map(|r| r.text());
        let jid = bind_resource(stream, requested.as_deref()).await?;

        let reply = result_iq(&iq)
            .append(
                Element::builder("bind", ns::BIND).append(
                    Element::builder("jid", ns::BIND)
                        .append(minidom::Node::Text(jid.to_string())),
                ),
            )
            .build();
        stream.write(&reply);
        Ok(Step::Advance)
    }
}

/// Bound client; stanzas go to the handler.
#[derive(Debug, Default)]
pub struct Ready;

impl Ready {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl State for Ready {
    fn id(&self) -> StateId {
        StateId::Ready
    }

    fn success(&self) -> Option<StateId> {
        None
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let mut stanza = expect_element(event)?;
        if !is_stanza(&stanza) {
            return Err(XmppError::stream(stream_errors::UNSUPPORTED_STANZA_TYPE));
        }
        let jid = stream
            .session()
            .jid()
            .ok_or_else(|| XmppError::internal("ready without a bound resource"))?;
        stanza.set_attr("from", jid.to_string());

        if is_session_request(&stanza) {
            stream.write(&result_iq(&stanza).build());
            return Ok(Step::Stay);
        }
        if stanza.name() == "iq" && stanza.has_child("bind", ns::BIND) {
            return Err(XmppError::stanza(
                StanzaErrorCondition::NotAllowed,
                Some("a resource is already bound".into()),
            ));
        }

        if track_session(stream, &stanza) {
            if let Some(cluster) = stream.router().cluster().cloned() {
                if let Err(e) = cluster.save_session(stream.session()).await {
                    warn!(jid = %jid, error = %e, "Failed to publish cluster session");
                }
            }
        }

        let handler = std::sync::Arc::clone(&stream.services().handler);
        handler.handle(stream, stanza).await?;
        Ok(Step::Stay)
    }
}

/// Update the presence and roster flags. Returns whether anything changed.
fn track_session(stream: &Stream, stanza: &Element) -> bool {
    let session = stream.session();
    match StanzaType::of(stanza) {
        StanzaType::Presence if stanza.attr("to").is_none() => match stanza.attr("type") {
            None => {
                session.set_available(true);
                session.set_last_presence(Some(stanza.clone()));
                true
            }
            Some("unavailable") => {
                session.set_available(false);
                session.set_last_presence(None);
                true
            }
            _ => false,
        },
        StanzaType::Iq
            if stanza.attr("type") == Some("get")
                && stanza.has_child("query", ns::ROSTER)
                && !session.is_interested() =>
        {
            session.set_interested(true);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Machine;
    use crate::storage::Storage;
    use crate::testing::{client_stream, services_with_users, stanza};
    use crate::types::Flavor;

    const HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";

    fn header(raw: &str) -> XmlEvent {
        XmlEvent::StreamOpen(crate::parser::StreamHeader::parse(raw).unwrap())
    }

    fn plain(user: &str, password: &str) -> XmlEvent {
        let payload = BASE64_STANDARD.encode(format!("\0{}\0{}", user, password));
        stanza(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
    }

    fn bind_iq(resource: Option<&str>) -> XmlEvent {
        let resource = resource
            .map(|r| format!("<resource>{}</resource>", r))
            .unwrap_or_default();
        stanza(&format!(
            "<iq xmlns='jabber:client' type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{}</bind></iq>",
            resource
        ))
    }

    /// Walk a client machine up to Bind; TLS is simulated by advancing.
    async fn authenticated(machine: &mut Machine, stream: &mut Stream, user: &str) {
        machine.start(stream).await.unwrap();
        machine.process(stream, header(HEADER)).await.unwrap();
        assert_eq!(machine.current(), StateId::Tls);
        machine.advance(stream).await.unwrap();
        machine.process(stream, header(HEADER)).await.unwrap();
        let step = machine.process(stream, plain(user, "pw")).await.unwrap();
        assert_eq!(step, Step::Restart);
        machine.process(stream, header(HEADER)).await.unwrap();
        assert_eq!(machine.current(), StateId::Bind);
    }

    #[tokio::test]
    async fn test_client_negotiation_visits_every_state() {
        let services = services_with_users(&[("alice@example.com", "pw")]);
        let (mut stream, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();

        authenticated(&mut machine, &mut stream, "alice").await;
        machine.process(&mut stream, bind_iq(Some("phone"))).await.unwrap();

        assert_eq!(
            machine.trail(),
            &[
                StateId::Start,
                StateId::Tls,
                StateId::AuthRestart,
                StateId::Auth,
                StateId::BindRestart,
                StateId::Bind,
                StateId::Ready
            ]
        );
        assert_eq!(
            stream.session().jid().unwrap().to_string(),
            "alice@example.com/phone"
        );
        assert!(stream.is_attached());
    }

    #[tokio::test]
    async fn test_wrong_version_is_fatal() {
        let services = services_with_users(&[]);
        let (mut stream, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();
        machine.start(&mut stream).await.unwrap();

        let err = machine
            .process(
                &mut stream,
                header("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='0.9'>"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stream_condition(), stream_errors::UNSUPPORTED_VERSION);
    }

    #[tokio::test]
    async fn test_unknown_host_and_changed_to() {
        let services = services_with_users(&[]);
        let (mut stream, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();
        let err = machine
            .process(
                &mut stream,
                header("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='nowhere.net' version='1.0'>"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stream_condition(), stream_errors::HOST_UNKNOWN);

        let (mut stream, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();
        machine.process(&mut stream, header(HEADER)).await.unwrap();
        machine.advance(&mut stream).await.unwrap();
        let err = machine
            .process(
                &mut stream,
                header("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.org' version='1.0'>"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stream_condition(), stream_errors::NOT_AUTHORIZED);
    }

    #[tokio::test]
    async fn test_plain_attempts_are_capped() {
        let services = services_with_users(&[("alice@example.com", "pw")]);
        let (mut stream, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();
        machine.process(&mut stream, header(HEADER)).await.unwrap();
        machine.advance(&mut stream).await.unwrap();
        machine.process(&mut stream, header(HEADER)).await.unwrap();
        stream.take_output();

        for _ in 0..2 {
            let step = machine
                .process(&mut stream, plain("alice", "wrong"))
                .await
                .unwrap();
            assert_eq!(step, Step::Stay);
            let out = stream.take_output().join("");
            assert!(out.contains("<failure"));
            assert!(out.contains("not-authorized"));
        }
        let err = machine
            .process(&mut stream, plain("alice", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.stream_condition(), stream_errors::POLICY_VIOLATION);
    }

    #[tokio::test]
    async fn test_resource_limit_is_recoverable() {
        let services = services_with_users(&[("alice@example.com", "pw")]);
        let mut streams = Vec::new();
        for i in 0..5 {
            let (mut stream, rx) = client_stream(&services);
            let mut machine = Machine::new(Flavor::Client).unwrap();
            authenticated(&mut machine, &mut stream, "alice").await;
            machine
                .process(&mut stream, bind_iq(Some(&format!("r{}", i))))
                .await
                .unwrap();
            assert_eq!(machine.current(), StateId::Ready);
            streams.push((stream, rx));
        }

        let (mut sixth, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();
        authenticated(&mut machine, &mut sixth, "alice").await;
        sixth.take_output();
        let step = machine.process(&mut sixth, bind_iq(Some("r5"))).await.unwrap();

        assert_eq!(step, Step::Stay);
        assert_eq!(machine.current(), StateId::Bind);
        let out = sixth.take_output().join("");
        assert!(out.contains("resource-constraint"));
        assert!(sixth.session().jid().is_none());
    }

    #[tokio::test]
    async fn test_taken_resource_gets_random_one() {
        let services = services_with_users(&[("alice@example.com", "pw")]);
        let (mut first, _a) = client_stream(&services);
        let mut m1 = Machine::new(Flavor::Client).unwrap();
        authenticated(&mut m1, &mut first, "alice").await;
        m1.process(&mut first, bind_iq(Some("phone"))).await.unwrap();

        let (mut second, _b) = client_stream(&services);
        let mut m2 = Machine::new(Flavor::Client).unwrap();
        authenticated(&mut m2, &mut second, "alice").await;
        m2.process(&mut second, bind_iq(Some("phone"))).await.unwrap();

        let jid = second.session().jid().unwrap();
        assert_ne!(jid.resource().as_str(), "phone");
        assert_eq!(jid.to_bare().to_string(), "alice@example.com");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_binds_respect_limit_and_uniqueness() {
        let services = services_with_users(&[("alice@example.com", "pw")]);
        let user = services
            .services
            .storage
            .find_user(&"alice@example.com".parse().unwrap())
            .await
            .unwrap()
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let (mut stream, rx) = client_stream(&services);
            stream.session().set_user(user.clone());
            stream.session().set_domain("example.com");
            tasks.push(tokio::spawn(async move {
                let bound = bind_resource(&mut stream, Some("phone")).await;
                (bound, stream, rx)
            }));
        }

        let mut jids = Vec::new();
        let mut refused = 0;
        let mut keep = Vec::new();
        for task in tasks {
            let (bound, stream, rx) = task.await.unwrap();
            match bound {
                Ok(jid) => jids.push(jid.to_string()),
                Err(e) => {
                    assert!(matches!(
                        e,
                        XmppError::Stanza {
                            condition: StanzaErrorCondition::ResourceConstraint,
                            ..
                        }
                    ));
                    refused += 1;
                }
            }
            keep.push((stream, rx));
        }

        assert_eq!(jids.len(), crate::config::DEFAULT_MAX_RESOURCES);
        assert_eq!(refused, 12 - crate::config::DEFAULT_MAX_RESOURCES);
        jids.sort();
        jids.dedup();
        assert_eq!(jids.len(), crate::config::DEFAULT_MAX_RESOURCES);
        assert_eq!(
            jids.iter().filter(|j| j.as_str() == "alice@example.com/phone").count(),
            1
        );
        assert_eq!(
            services.router.count(crate::types::StreamKind::Client),
            crate::config::DEFAULT_MAX_RESOURCES
        );
    }

    #[tokio::test]
    async fn test_ready_tracks_presence_and_roster_interest() {
        let services = services_with_users(&[("alice@example.com", "pw")]);
        let (mut stream, _rx) = client_stream(&services);
        let mut machine = Machine::new(Flavor::Client).unwrap();
        authenticated(&mut machine, &mut stream, "alice").await;
        machine.process(&mut stream, bind_iq(None)).await.unwrap();

        machine
            .process(&mut stream, stanza("<presence xmlns='jabber:client'/>"))
            .await
            .unwrap();
        assert!(stream.session().is_available());
        assert!(stream.session().last_presence().is_some());

        machine
            .process(
                &mut stream,
                stanza("<iq xmlns='jabber:client' type='get' id='r'><query xmlns='jabber:iq:roster'/></iq>"),
            )
            .await
            .unwrap();
        assert!(stream.session().is_interested());

        machine
            .process(&mut stream, stanza("<presence xmlns='jabber:client' type='unavailable'/>"))
            .await
            .unwrap();
        assert!(!stream.session().is_available());
    }

    #[test]
    fn test_decode_plain() {
        let payload = BASE64_STANDARD.encode("\0alice\0secret");
        let (authzid, authcid, password) = decode_plain(&payload).unwrap();
        assert_eq!(authzid, "");
        assert_eq!(authcid, "alice");
        assert_eq!(password, "secret");

        assert!(matches!(
            decode_plain("not base64!"),
            Err(XmppError::Sasl(sasl_errors::INCORRECT_ENCODING))
        ));
        let missing = BASE64_STANDARD.encode("alice");
        assert!(matches!(
            decode_plain(&missing),
            Err(XmppError::Sasl(sasl_errors::MALFORMED_REQUEST))
        ));
    }
}
