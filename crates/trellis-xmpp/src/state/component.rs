//! XEP-0114 external components.

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use super::common::{check_header, expect_element, expect_header, reply_header};
use super::{State, StateId, Step};
use crate::error::stream_errors;
use crate::parser::{is_stanza, ns, XmlEvent};
use crate::stream::Stream;
use crate::XmppError;

/// Expected handshake digest: lowercase hex SHA-1 of stream id and secret.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Accepts the header addressed to a configured component domain.
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
        Ok(Step::Advance)
    }
}

/// Verifies `<handshake/>` against the shared secret.
#[derive(Debug)]
pub struct Handshake {
    next: Option<StateId>,
}

impl Handshake {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for Handshake {
    fn id(&self) -> StateId {
        StateId::Handshake
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if element.name() != "handshake" {
            return Err(XmppError::stream_with_text(
                stream_errors::NOT_AUTHORIZED,
                "handshake required",
            ));
        }

        let domain = stream
            .requested_to()
            .ok_or_else(|| XmppError::internal("handshake before stream header"))?
            .to_string();
        let secret = stream
            .config()
            .component_secret(&domain)
            .ok_or_else(|| XmppError::stream(stream_errors::HOST_UNKNOWN))?;
        let expected = handshake_digest(stream.id(), secret);

        if element.text().trim().to_ascii_lowercase() != expected {
            warn!(component = %domain, "Component handshake mismatch");
            return Err(XmppError::stream(stream_errors::NOT_AUTHORIZED));
        }

        info!(component = %domain, "Component authenticated");
        stream.write(&Element::builder("handshake", ns::JABBER_CLIENT).build());
        stream.session().set_domain(domain);
        stream.attach();
        Ok(Step::Advance)
    }
}

/// Authenticated component; stanzas go to the handler.
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
        let stanza = expect_element(event)?;
        if !is_stanza(&stanza) {
            return Err(XmppError::stream(stream_errors::UNSUPPORTED_STANZA_TYPE));
        }

        let component = stream.session().domain().unwrap_or_default();
        let from = stanza
            .attr("from")
            .and_then(|from| Jid::new(from).ok())
            .map(|jid| jid.domain().to_string());
        if from.as_deref() != Some(component.as_str()) {
            return Err(XmppError::stream_with_text(
                stream_errors::INVALID_FROM,
                format!("stanzas must come from {}", component),
            ));
        }

        let handler = std::sync::Arc::clone(&stream.services().handler);
        handler.handle(stream, stanza).await?;
        Ok(Step::Stay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Machine;
    use crate::testing::{component_stream, services_with_users, stanza};

    const HEADER: &str = "<stream:stream xmlns='jabber:component:accept' xmlns:stream='http://etherx.jabber.org/streams' to='chat.example.com'>";

    fn header(raw: &str) -> XmlEvent {
        XmlEvent::StreamOpen(crate::parser::StreamHeader::parse(raw).unwrap())
    }

    #[test]
    fn test_handshake_digest() {
        assert_eq!(
            handshake_digest("3BF96D75", "sunny"),
            "0cf4caba8fbadc00be929195b6b727d8d24897ef"
        );
    }

    #[tokio::test]
    async fn test_component_handshake() {
        let services = services_with_users(&[]);
        let (mut stream, _rx) = component_stream(&services);
        let mut machine = Machine::new(stream.flavor()).unwrap();
        machine.process(&mut stream, header(HEADER)).await.unwrap();

        let opened = stream.take_output().join("");
        assert!(opened.contains("jabber:component:accept"));
        assert!(opened.contains(&format!("id='{}'", stream.id())));

        let digest = handshake_digest(stream.id(), "secret");
        machine
            .process(
                &mut stream,
                stanza(&format!("<handshake xmlns='jabber:component:accept'>{}</handshake>", digest)),
            )
            .await
            .unwrap();
        assert_eq!(machine.current(), StateId::Ready);
        assert!(stream.is_attached());
        assert_eq!(stream.session().domain().as_deref(), Some("chat.example.com"));
        assert!(stream.take_output().join("").contains("<handshake"));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_fatal() {
        let services = services_with_users(&[]);
        let (mut stream, _rx) = component_stream(&services);
        let mut machine = Machine::new(stream.flavor()).unwrap();
        machine.process(&mut stream, header(HEADER)).await.unwrap();

        let digest = handshake_digest(stream.id(), "wrong");
        let err = machine
            .process(
                &mut stream,
                stanza(&format!("<handshake xmlns='jabber:component:accept'>{}</handshake>", digest)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stream_condition(), stream_errors::NOT_AUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_component_domain() {
        let services = services_with_users(&[]);
        let (mut stream, _rx) = component_stream(&services);
        let mut machine = Machine::new(stream.flavor()).unwrap();
        let err = machine
            .process(
                &mut stream,
                header("<stream:stream xmlns='jabber:component:accept' xmlns:stream='http://etherx.jabber.org/streams' to='other.example.com'>"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stream_condition(), stream_errors::HOST_UNKNOWN);
    }
}
