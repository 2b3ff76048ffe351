//! Rules and states shared by several graphs.

use async_trait::async_trait;
use minidom::Element;
use tracing::debug;

use super::{State, StateId, Step};
use crate::error::stream_errors;
use crate::parser::{ns, StreamHeader, XmlEvent};
use crate::stream::Stream;
use crate::types::Flavor;
use crate::XmppError;

/// Validate a received stream header and record its `to`.
///
/// The element must be `stream` in the streams namespace with the flavor's
/// content namespace as default and `version='1.0'` (components are exempt
/// from the version rule). The first header fixes `to`; later headers on the
/// same connection must repeat it.
pub fn check_header(stream: &mut Stream, header: &StreamHeader) -> Result<(), XmppError> {
    if header.local_name() != "stream" || header.element_ns() != Some(ns::STREAM) {
        return Err(XmppError::stream(stream_errors::INVALID_NAMESPACE));
    }
    if header.default_ns.as_deref() != Some(stream.flavor().content_ns()) {
        return Err(XmppError::stream(stream_errors::INVALID_NAMESPACE));
    }
    if stream.flavor() != Flavor::Component && header.version.as_deref() != Some("1.0") {
        return Err(XmppError::stream(stream_errors::UNSUPPORTED_VERSION));
    }

    let to = header
        .to
        .as_deref()
        .ok_or_else(|| XmppError::stream(stream_errors::HOST_UNKNOWN))?;

    match stream.requested_to() {
        Some(previous) if previous != to => {
            debug!(previous = %previous, to = %to, "Stream restarted with a different host");
            Err(XmppError::stream(stream_errors::NOT_AUTHORIZED))
        }
        Some(_) => Ok(()),
        None => {
            let known = match stream.flavor() {
                Flavor::Component => stream.config().is_component(to),
                _ => stream.config().is_local_domain(to),
            };
            if !known {
                return Err(XmppError::stream_with_text(
                    stream_errors::HOST_UNKNOWN,
                    format!("{} is not served here", to),
                ));
            }
            stream.set_requested_to(to);
            Ok(())
        }
    }
}

/// Validate the header a remote server answers our outbound stream with.
pub fn check_peer_header(stream: &Stream, header: &StreamHeader) -> Result<(), XmppError> {
    if header.local_name() != "stream"
        || header.element_ns() != Some(ns::STREAM)
        || header.default_ns.as_deref() != Some(stream.flavor().content_ns())
    {
        return Err(XmppError::stream(stream_errors::INVALID_NAMESPACE));
    }
    if header.version.as_deref() != Some("1.0") {
        return Err(XmppError::stream(stream_errors::UNSUPPORTED_VERSION));
    }
    Ok(())
}

/// Answer a received header with ours, `from` the host the peer asked for.
pub fn reply_header(stream: &mut Stream) {
    let host = stream.requested_to().map(str::to_string);
    stream.open_stream(host.as_deref(), None);
}

/// The event must be a stream header.
pub fn expect_header(event: XmlEvent) -> Result<StreamHeader, XmppError> {
    match event {
        XmlEvent::StreamOpen(header) => Ok(header),
        XmlEvent::Stanza(element) => {
            debug!(element = %element.name(), "Element where a stream header was expected");
            Err(XmppError::stream(stream_errors::BAD_FORMAT))
        }
        XmlEvent::StreamClose => Err(XmppError::stream(stream_errors::BAD_FORMAT)),
    }
}

/// The event must be a top-level element.
pub fn expect_element(event: XmlEvent) -> Result<Element, XmppError> {
    match event {
        XmlEvent::Stanza(element) => Ok(element),
        XmlEvent::StreamOpen(_) => Err(XmppError::stream_with_text(
            stream_errors::BAD_FORMAT,
            "unexpected stream header",
        )),
        XmlEvent::StreamClose => Err(XmppError::stream(stream_errors::BAD_FORMAT)),
    }
}

/// `<stream:features/>` with the given children.
pub fn features(children: Vec<Element>) -> Element {
    let mut features = Element::builder("features", ns::STREAM).build();
    for child in children {
        features.append_child(child);
    }
    features
}

pub fn starttls_feature(required: bool) -> Element {
    let mut starttls = Element::builder("starttls", ns::TLS).build();
    if required {
        starttls.append_child(Element::builder("required", ns::TLS).build());
    }
    starttls
}

pub fn mechanisms_feature(mechanisms: &[&str]) -> Element {
    let mut list = Element::builder("mechanisms", ns::SASL).build();
    for mechanism in mechanisms {
        list.append_child(
            Element::builder("mechanism", ns::SASL)
                .append(minidom::Node::Text(mechanism.to_string()))
                .build(),
        );
    }
    list
}

pub fn bind_features() -> Vec<Element> {
    vec![
        Element::builder("bind", ns::BIND).build(),
        Element::builder("session", ns::SESSION)
            .append(Element::builder("optional", ns::SESSION).build())
            .build(),
    ]
}

/// Waits for `<starttls/>` and answers `<proceed/>`.
///
/// Used by the receiving side of client and server streams.
#[derive(Debug)]
pub struct StartTls {
    next: Option<StateId>,
}

impl StartTls {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for StartTls {
    fn id(&self) -> StateId {
        StateId::Tls
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let element = expect_element(event)?;
        if !element.is("starttls", ns::TLS) {
            debug!(element = %element.name(), "Negotiation attempted before TLS");
            return Err(XmppError::stream_with_text(
                stream_errors::NOT_AUTHORIZED,
                "TLS is required",
            ));
        }
        if stream.services().tls.is_none() {
            stream.write(&Element::builder("failure", ns::TLS).build());
            return Err(XmppError::internal("STARTTLS requested without TLS configured"));
        }
        stream.write(&Element::builder("proceed", ns::TLS).build());
        Ok(Step::StartTls)
    }
}
