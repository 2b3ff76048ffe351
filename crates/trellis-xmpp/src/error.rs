//! Error types for the XMPP server.
//!
//! Errors fall into three classes:
//!
//! - **stream-fatal** (`StreamError`, `XmlParse`, `Io`, `Tls`): the connection
//!   writes a `<stream:error/>` and closes.
//! - **stanza/SASL-recoverable** (`Stanza`, `Sasl`): an error response is
//!   written back to the sender and the connection keeps processing.
//! - **background** (`Cluster`, `Storage`, `Config`, `Internal`): logged by
//!   whoever owns the task; a connection that hits one closes with
//!   `internal-server-error`.

use minidom::Element;
use thiserror::Error;

use crate::parser::ns;

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Fatal stream-level protocol error.
    #[error("Stream error: {condition}")]
    StreamError {
        /// Condition element name, see [`stream_errors`]
        condition: &'static str,
        /// Optional human readable text
        text: Option<String>,
    },

    /// SASL failure, answered with `<failure/>`.
    #[error("SASL failure: {0}")]
    Sasl(&'static str),

    /// Stanza error, answered with a `type='error'` reply.
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cluster transport or directory failure
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a fatal stream error with a condition from [`stream_errors`].
    pub fn stream(condition: &'static str) -> Self {
        Self::StreamError {
            condition,
            text: None,
        }
    }

    /// Create a fatal stream error carrying explanatory text.
    pub fn stream_with_text(condition: &'static str, text: impl Into<String>) -> Self {
        Self::StreamError {
            condition,
            text: Some(text.into()),
        }
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new cluster error.
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error with the conventional type for `condition`.
    pub fn stanza(condition: StanzaErrorCondition, text: Option<String>) -> Self {
        Self::Stanza {
            condition,
            error_type: condition.default_type(),
            text,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, text)
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAuthorized, text)
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::FeatureNotImplemented, text)
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ServiceUnavailable, text)
    }

    /// Create a stanza error for 'remote-server-not-found'.
    pub fn remote_server_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::RemoteServerNotFound, text)
    }

    /// Create a stanza error for 'resource-constraint'.
    pub fn resource_constraint(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ResourceConstraint, text)
    }

    /// Whether this error must terminate the stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Stanza { .. } | Self::Sasl(_))
    }

    /// The stream error condition written before closing on a fatal error.
    pub fn stream_condition(&self) -> &'static str {
        match self {
            Self::StreamError { condition, .. } => condition,
            Self::XmlParse(_) => stream_errors::NOT_WELL_FORMED,
            Self::Stanza { .. } | Self::Sasl(_) => stream_errors::UNDEFINED_CONDITION,
            Self::Io(_)
            | Self::Tls(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Cluster(_)
            | Self::Internal(_) => stream_errors::INTERNAL_SERVER_ERROR,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The error type RFC 6120 suggests for this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::PolicyViolation => {
                StanzaErrorType::Modify
            }
            Self::Forbidden | Self::NotAuthorized => StanzaErrorType::Auth,
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable
            | Self::UndefinedCondition => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the error reply for a stanza that could not be handled.
///
/// `to` and `from` are swapped, `type` becomes `error` and the original
/// children are kept so the sender can correlate the failure.
pub fn stanza_error_reply(
    stanza: &Element,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> Element {
    let mut error = Element::builder("error", stanza.ns())
        .attr("type", error_type.as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build();
    if let Some(text) = text {
        error.append_child(
            Element::builder("text", ns::STANZAS)
                .attr("xml:lang", "en")
                .append(minidom::Node::Text(text.to_string()))
                .build(),
        );
    }

    let mut reply = Element::builder(stanza.name(), stanza.ns()).attr("type", "error");
    if let Some(id) = stanza.attr("id") {
        reply = reply.attr("id", id);
    }
    if let Some(from) = stanza.attr("from") {
        reply = reply.attr("to", from);
    }
    if let Some(to) = stanza.attr("to") {
        reply = reply.attr("from", to);
    }
    let mut reply = reply.build();
    for child in stanza.children() {
        if !child.is("error", stanza.ns().as_str()) {
            reply.append_child(child.clone());
        }
    }
    reply.append_child(error);
    reply
}

/// Whether a stanza must never be answered with an error (RFC 6120 8.3.1).
pub fn is_error_stanza(stanza: &Element) -> bool {
    stanza.attr("type") == Some("error")
}

/// Generate a stream error and close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!(
        "<stream:error><{} xmlns='{}'/>",
        condition,
        ns::STREAMS_ERRORS
    );

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAMS_ERRORS,
            escape(t)
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Generate a SASL `<failure/>` element.
pub fn generate_sasl_failure(condition: &str) -> String {
    format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, condition)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Common stream error conditions.
pub mod stream_errors {
    pub const BAD_FORMAT: &str = "bad-format";
    pub const HOST_UNKNOWN: &str = "host-unknown";
    pub const IMPROPER_ADDRESSING: &str = "improper-addressing";
    pub const INTERNAL_SERVER_ERROR: &str = "internal-server-error";
    pub const INVALID_FROM: &str = "invalid-from";
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    pub const POLICY_VIOLATION: &str = "policy-violation";
    pub const REMOTE_CONNECTION_FAILED: &str = "remote-connection-failed";
    pub const RESTRICTED_XML: &str = "restricted-xml";
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    pub const UNDEFINED_CONDITION: &str = "undefined-condition";
    pub const UNSUPPORTED_STANZA_TYPE: &str = "unsupported-stanza-type";
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
}

/// SASL failure conditions (RFC 6120 Section 6.5).
pub mod sasl_errors {
    /// The receiving entity acknowledges that the exchange was aborted
    pub const ABORTED: &str = "aborted";
    /// The data provided is not valid base64
    pub const INCORRECT_ENCODING: &str = "incorrect-encoding";
    /// The mechanism is not offered
    pub const INVALID_MECHANISM: &str = "invalid-mechanism";
    /// The request is malformed
    pub const MALFORMED_REQUEST: &str = "malformed-request";
    /// The credentials were rejected
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Temporary failure in the authentication backend
    pub const TEMPORARY_AUTH_FAILURE: &str = "temporary-auth-failure";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_error_reply_swaps_addresses() {
        let message: Element =
            "<message xmlns='jabber:client' id='m1' from='alice@example.com/phone' to='bob@remote.org' type='chat'><body>hi</body></message>"
                .parse()
                .unwrap();

        let reply = stanza_error_reply(
            &message,
            StanzaErrorCondition::RemoteServerNotFound,
            StanzaErrorType::Cancel,
            None,
        );

        assert_eq!(reply.name(), "message");
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("id"), Some("m1"));
        assert_eq!(reply.attr("to"), Some("alice@example.com/phone"));
        assert_eq!(reply.attr("from"), Some("bob@remote.org"));
        let error = reply.get_child("error", "jabber:client").unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("remote-server-not-found", ns::STANZAS));
        assert!(reply.has_child("body", "jabber:client"));
    }

    #[test]
    fn test_stream_error_generation() {
        let error = generate_stream_error(
            stream_errors::NOT_AUTHORIZED,
            Some("Invalid <credentials>"),
        );

        assert!(error.contains("<stream:error>"));
        assert!(error.contains("<not-authorized"));
        assert!(error.contains("Invalid &lt;credentials&gt;"));
        assert!(error.ends_with("</stream:stream>"));
    }

    #[test]
    fn test_error_classes() {
        assert!(XmppError::stream(stream_errors::POLICY_VIOLATION).is_fatal());
        assert!(XmppError::xml_parse("bad").is_fatal());
        assert!(!XmppError::resource_constraint(None).is_fatal());
        assert!(!XmppError::Sasl(sasl_errors::NOT_AUTHORIZED).is_fatal());
        assert_eq!(
            XmppError::xml_parse("bad").stream_condition(),
            stream_errors::NOT_WELL_FORMED
        );
    }

    #[test]
    fn test_default_error_types() {
        assert_eq!(
            StanzaErrorCondition::ResourceConstraint.default_type(),
            StanzaErrorType::Wait
        );
        assert_eq!(
            StanzaErrorCondition::RemoteServerNotFound.default_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(StanzaErrorCondition::BadRequest.as_str(), "bad-request");
    }
}
