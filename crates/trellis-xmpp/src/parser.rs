//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses a single long-lived XML document per stream, so the parser
//! accumulates bytes across reads and emits an event whenever the stream
//! header, a complete top-level element, or the closing tag is available.
//!
//! Boundaries are found with a small lexical scanner; each complete stanza is
//! then handed to minidom. Stanzas that rely on the stream's default
//! namespace are placed in the canonical content namespace
//! (`jabber:client`) so handlers never special-case server or component
//! streams. [`to_stream_xml`] stamps the target stream's namespace back on
//! when writing.

use minidom::{Element, Node};

use crate::error::stream_errors;
use crate::XmppError;

/// Default upper bound for a single stanza, in bytes.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 128 * 1024;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XEP-0114 external component namespace
    pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error conditions namespace
    pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// XEP-0124 BOSH body namespace
    pub const HTTP_BIND: &str = "http://jabber.org/protocol/httpbind";
    /// XEP-0206 XMPP-over-BOSH namespace
    pub const XBOSH: &str = "urn:xmpp:xbosh";
}

/// Whether `namespace` is one of the stream content namespaces that are
/// implied on top-level stanzas.
pub fn is_content_ns(namespace: &str) -> bool {
    matches!(
        namespace,
        ns::JABBER_CLIENT | ns::JABBER_SERVER | ns::COMPONENT_ACCEPT
    )
}

/// Whether an element is a routable `<message/>`, `<presence/>` or `<iq/>`.
pub fn is_stanza(element: &Element) -> bool {
    matches!(element.name(), "message" | "presence" | "iq") && is_content_ns(&element.ns())
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// Qualified element name, normally `stream:stream`
    pub name: String,
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by the receiving entity)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// Default namespace declared on the header
    pub default_ns: Option<String>,
    /// Prefixed namespace declarations (`xmlns:stream`, `xmlns:db`, ...)
    pub prefixes: Vec<(String, String)>,
}

impl StreamHeader {
    /// Parse a stream header from its start tag.
    ///
    /// The tag is intentionally unclosed; its end tag arrives when the
    /// stream is torn down.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        let (name, attributes) = parse_start_tag(tag)?;
        let mut header = StreamHeader {
            name,
            ..Default::default()
        };

        for (attr, value) in attributes {
            match attr.as_str() {
                "to" => header.to = Some(value),
                "from" => header.from = Some(value),
                "id" => header.id = Some(value),
                "version" => header.version = Some(value),
                "xml:lang" => header.lang = Some(value),
                "xmlns" => header.default_ns = Some(value),
                other => {
                    if let Some(prefix) = other.strip_prefix("xmlns:") {
                        header.prefixes.push((prefix.to_string(), value));
                    }
                }
            }
        }

        Ok(header)
    }

    /// Namespace bound to the prefix of the header's element name.
    pub fn element_ns(&self) -> Option<&str> {
        match self.name.split_once(':') {
            Some((prefix, _)) => self.prefix_ns(prefix),
            None => self.default_ns.as_deref(),
        }
    }

    /// Local part of the header's element name.
    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    /// Look up a prefixed namespace declaration.
    pub fn prefix_ns(&self, prefix: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }
}

/// Render the opening `<stream:stream>` tag we send to a peer.
pub fn open_stream_xml(
    content_ns: &str,
    id: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> String {
    let mut header = format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' xml:lang='en' version='1.0'",
        content_ns,
        ns::STREAM
    );
    for (name, value) in [("id", id), ("from", from), ("to", to)] {
        if let Some(value) = value {
            header.push_str(&format!(" {}='{}'", name, escape_attr(value)));
        }
    }
    header.push('>');
    header
}

/// Events produced by [`XmlParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    /// The `<stream:stream>` start tag.
    StreamOpen(StreamHeader),
    /// A complete top-level element.
    Stanza(Element),
    /// The `</stream:stream>` end tag.
    StreamClose,
}

/// Incremental XML parser for XMPP streams.
///
/// Feed arbitrary chunks with [`XmlParser::feed`] and drain events with
/// [`XmlParser::next_event`]. Chunks may split anywhere, including inside a
/// multi-byte UTF-8 sequence; nothing is decoded until an element is complete.
pub struct XmlParser {
    /// Accumulated data buffer
    buffer: Vec<u8>,
    /// Scan position within `buffer`
    pos: usize,
    /// Element depth, the stream element counts as 1
    depth: usize,
    /// Start of the stanza being scanned
    stanza_start: Option<usize>,
    /// Header of the current stream document
    header: Option<StreamHeader>,
    /// Upper bound for a single stanza
    max_stanza_size: usize,
}

impl XmlParser {
    /// Create a new XML parser.
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            pos: 0,
            depth: 0,
            stanza_start: None,
            header: None,
            max_stanza_size,
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Header of the stream document currently being parsed.
    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }

    /// Begin a new stream document, keeping any bytes already buffered.
    ///
    /// Used after SASL success, where the peer may pipeline its new header.
    pub fn restart(&mut self) {
        self.compact();
        self.depth = 0;
        self.stanza_start = None;
        self.header = None;
    }

    /// Begin a new stream document and discard buffered bytes.
    ///
    /// Used after a TLS upgrade: plaintext read before the handshake must
    /// never be interpreted as part of the secured stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.restart();
    }

    /// Parse and return the next event, or `None` when more data is needed.
    pub fn next_event(&mut self) -> Result<Option<XmlEvent>, XmppError> {
        loop {
            if self.pos >= self.buffer.len() {
                self.compact();
                return Ok(None);
            }

            if self.header.is_none() {
                match self.scan_prolog()? {
                    Scan::More => return self.need_more(),
                    Scan::Continue => continue,
                    Scan::Event(event) => return Ok(Some(event)),
                }
            }

            match self.scan_content()? {
                Scan::More => return self.need_more(),
                Scan::Continue => continue,
                Scan::Event(event) => {
                    self.compact();
                    return Ok(Some(event));
                }
            }
        }
    }

    fn need_more(&mut self) -> Result<Option<XmlEvent>, XmppError> {
        let pending = match self.stanza_start {
            Some(start) => self.buffer.len() - start,
            None => self.buffer.len() - self.pos,
        };
        if pending > self.max_stanza_size {
            return Err(XmppError::stream_with_text(
                stream_errors::POLICY_VIOLATION,
                format!("stanza exceeds {} bytes", self.max_stanza_size),
            ));
        }
        self.compact();
        Ok(None)
    }

    /// Drop consumed bytes from the front of the buffer.
    fn compact(&mut self) {
        let keep_from = self.stanza_start.unwrap_or(self.pos);
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.pos -= keep_from;
        if let Some(start) = self.stanza_start.as_mut() {
            *start = 0;
        }
    }

    /// Scan up to and including the stream header.
    fn scan_prolog(&mut self) -> Result<Scan, XmppError> {
        let rest = &self.buffer[self.pos..];
        let skipped = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
        if skipped > 0 {
            self.pos += skipped;
            return Ok(Scan::Continue);
        }
        if rest[0] != b'<' {
            return Err(XmppError::xml_parse("text before stream header"));
        }
        if rest.len() < 2 {
            return Ok(Scan::More);
        }
        match rest[1] {
            b'?' => match find(rest, b"?>") {
                Some(end) => {
                    self.pos += end + 2;
                    Ok(Scan::Continue)
                }
                None => Ok(Scan::More),
            },
            b'!' | b'/' => Err(XmppError::stream(stream_errors::RESTRICTED_XML)),
            _ => {
                let Some((end, self_closing)) = scan_tag(rest) else {
                    return Ok(Scan::More);
                };
                if self_closing {
                    return Err(XmppError::xml_parse("stream header must not be empty"));
                }
                let tag = std::str::from_utf8(&rest[..end])
                    .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))?;
                let header = StreamHeader::parse(tag)?;
                self.pos += end;
                self.depth = 1;
                self.header = Some(header.clone());
                Ok(Scan::Event(XmlEvent::StreamOpen(header)))
            }
        }
    }

    /// Scan one token inside the stream element.
    fn scan_content(&mut self) -> Result<Scan, XmppError> {
        let rest = &self.buffer[self.pos..];

        if self.depth == 1 {
            let skipped = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
            if skipped > 0 {
                self.pos += skipped;
                return Ok(Scan::Continue);
            }
            if rest[0] != b'<' {
                return Err(XmppError::xml_parse("text at stream level"));
            }
        }

        if rest[0] != b'<' {
            // character data inside a stanza
            match rest.iter().position(|&b| b == b'<') {
                Some(offset) => self.pos += offset,
                None => self.pos = self.buffer.len(),
            }
            return Ok(Scan::Continue);
        }

        if rest.len() < 2 {
            return Ok(Scan::More);
        }

        match rest[1] {
            b'?' => Err(XmppError::stream(stream_errors::RESTRICTED_XML)),
            b'!' => {
                const CDATA: &[u8] = b"<![CDATA[";
                if rest.len() < CDATA.len() && CDATA.starts_with(rest) {
                    return Ok(Scan::More);
                }
                if !rest.starts_with(CDATA) || self.depth == 1 {
                    return Err(XmppError::stream(stream_errors::RESTRICTED_XML));
                }
                match find(rest, b"]]>") {
                    Some(end) => {
                        self.pos += end + 3;
                        Ok(Scan::Continue)
                    }
                    None => Ok(Scan::More),
                }
            }
            b'/' => {
                let Some(end) = rest.iter().position(|&b| b == b'>') else {
                    return Ok(Scan::More);
                };
                if self.depth == 1 {
                    let name = String::from_utf8_lossy(&rest[2..end]);
                    let expected = self
                        .header
                        .as_ref()
                        .map(|h| h.name.as_str())
                        .unwrap_or("stream:stream");
                    if name.trim_end() != expected {
                        return Err(XmppError::xml_parse(format!(
                            "unexpected end tag </{}> at stream level",
                            name.trim_end()
                        )));
                    }
                }
                self.pos += end + 1;
                self.depth -= 1;
                match self.depth {
                    0 => {
                        self.header = None;
                        Ok(Scan::Event(XmlEvent::StreamClose))
                    }
                    1 => self.finish_stanza(),
                    _ => Ok(Scan::Continue),
                }
            }
            _ => {
                let Some((end, self_closing)) = scan_tag(rest) else {
                    return Ok(Scan::More);
                };
                if self.depth == 1 {
                    if rest.starts_with(b"<stream:stream") {
                        return Err(XmppError::xml_parse("nested stream header"));
                    }
                    self.stanza_start = Some(self.pos);
                }
                self.pos += end;
                if self_closing {
                    if self.depth == 1 {
                        return self.finish_stanza();
                    }
                } else {
                    self.depth += 1;
                }
                Ok(Scan::Continue)
            }
        }
    }

    fn finish_stanza(&mut self) -> Result<Scan, XmppError> {
        let start = self
            .stanza_start
            .take()
            .ok_or_else(|| XmppError::xml_parse("unbalanced end tag"))?;
        let raw = &self.buffer[start..self.pos];
        if raw.len() > self.max_stanza_size {
            return Err(XmppError::stream_with_text(
                stream_errors::POLICY_VIOLATION,
                format!("stanza exceeds {} bytes", self.max_stanza_size),
            ));
        }
        let raw = std::str::from_utf8(raw)
            .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))?;
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| XmppError::xml_parse("stanza outside of stream"))?;
        let element = parse_stanza(raw, header)?;
        Ok(Scan::Event(XmlEvent::Stanza(element)))
    }
}

enum Scan {
    /// Token incomplete, wait for more bytes
    More,
    /// Token consumed, keep scanning
    Continue,
    /// Token completed an event
    Event(XmlEvent),
}

/// Find the end of a start tag, skipping quoted attribute values.
///
/// Returns the offset just past `>` and whether the tag is self-closing.
fn scan_tag(data: &[u8]) -> Option<(usize, bool)> {
    let mut quote: Option<u8> = None;
    for (i, &b) in data.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'>' => return Some((i + 1, data[i - 1] == b'/')),
                _ => {}
            },
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a start tag into its qualified name and unescaped attributes.
fn parse_start_tag(tag: &str) -> Result<(String, Vec<(String, String)>), XmppError> {
    let body = tag
        .strip_prefix('<')
        .ok_or_else(|| XmppError::xml_parse("start tag must begin with '<'"))?;
    let body = body.trim_end_matches('>').trim_end_matches('/');

    let name_end = body
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(body.len());
    let name = body[..name_end].to_string();
    if name.is_empty() {
        return Err(XmppError::xml_parse("missing element name"));
    }

    let mut attributes = Vec::new();
    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| XmppError::xml_parse("attribute without value"))?;
        let attr = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| XmppError::xml_parse("unquoted attribute value"))?;
        let value_end = after[1..]
            .find(quote)
            .ok_or_else(|| XmppError::xml_parse("unterminated attribute value"))?;
        attributes.push((attr, unescape(&after[1..1 + value_end])?));
        rest = after[value_end + 2..].trim_start();
    }

    Ok((name, attributes))
}

fn unescape(value: &str) -> Result<String, XmppError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let semi = rest[amp..]
            .find(';')
            .ok_or_else(|| XmppError::xml_parse("unterminated entity"))?;
        let entity = &rest[amp + 1..amp + semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                    .and_then(|r| r.ok())
                    .and_then(char::from_u32)
                    .ok_or_else(|| XmppError::xml_parse(format!("unknown entity &{};", entity)))?;
                out.push(code);
            }
        }
        rest = &rest[amp + semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('\'', "&apos;")
        .replace('<', "&lt;")
}

/// Parse one complete top-level element in the context of its stream.
///
/// Namespace declarations the element inherits from the stream header are
/// injected into its start tag before parsing.
pub fn parse_stanza(raw: &str, header: &StreamHeader) -> Result<Element, XmppError> {
    let (tag_end, _) = scan_tag(raw.as_bytes())
        .ok_or_else(|| XmppError::xml_parse("incomplete start tag"))?;
    let (name, attributes) = parse_start_tag(&raw[..tag_end])?;
    let declares = |attr: &str| attributes.iter().any(|(a, _)| a == attr);

    let mut inject = String::new();
    if !declares("xmlns") {
        let default_ns = match header.default_ns.as_deref() {
            Some(stream_ns) if !is_content_ns(stream_ns) => stream_ns,
            _ => ns::JABBER_CLIENT,
        };
        inject.push_str(&format!(" xmlns='{}'", default_ns));
    }
    for (prefix, uri) in &header.prefixes {
        let decl = format!("xmlns:{}", prefix);
        if !declares(&decl) && raw.contains(&format!("{}:", prefix)) {
            inject.push_str(&format!(" {}='{}'", decl, escape_attr(uri)));
        }
    }

    let element = if inject.is_empty() {
        raw.parse::<Element>()
    } else {
        let split = 1 + name.len();
        format!("{}{}{}", &raw[..split], inject, &raw[split..]).parse::<Element>()
    }
    .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))?;

    let element_ns = element.ns();
    if is_content_ns(&element_ns) && element_ns != ns::JABBER_CLIENT {
        Ok(restamp(&element, &element_ns, ns::JABBER_CLIENT))
    } else {
        Ok(element)
    }
}

/// Rebuild `element`, moving every node in namespace `from` into `to`.
pub fn restamp(element: &Element, from: &str, to: &str) -> Element {
    let element_ns = element.ns();
    let target = if element_ns == from {
        to.to_string()
    } else {
        element_ns
    };

    let mut builder = Element::builder(element.name(), target);
    for (name, value) in element.attrs() {
        builder = builder.attr(name, value);
    }
    let mut out = builder.build();

    for node in element.nodes() {
        match node {
            Node::Element(child) => {
                out.append_child(restamp(child, from, to));
            }
            Node::Text(text) => out.append_text_node(text.clone()),
        }
    }
    out
}

/// Serialize an element for a stream whose content namespace is `content_ns`.
pub fn to_stream_xml(element: &Element, content_ns: &str) -> String {
    if content_ns != ns::JABBER_CLIENT && element.ns() == ns::JABBER_CLIENT {
        String::from(&restamp(element, ns::JABBER_CLIENT, content_ns))
    } else {
        String::from(element)
    }
}

/// A BOSH `<body/>` wrapper and the elements it carries.
#[derive(Debug, Clone, Default)]
pub struct Body {
    /// Attributes of the wrapper, qualified names as written
    pub attributes: Vec<(String, String)>,
    /// Top-level payload elements, canonicalized like stream stanzas
    pub children: Vec<Element>,
}

impl Body {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Parse a complete BOSH request body.
///
/// Payload elements go through the stream parser under a synthetic
/// `jabber:client` header, so they obey the same size and restricted-XML
/// rules as elements on a TCP stream.
pub fn parse_body(raw: &str, max_stanza_size: usize) -> Result<Body, XmppError> {
    let mut raw = raw.trim_start();
    if raw.starts_with("<?") {
        let end = raw
            .find("?>")
            .ok_or_else(|| XmppError::xml_parse("unterminated XML declaration"))?;
        raw = raw[end + 2..].trim_start();
    }

    let (tag_end, self_closing) =
        scan_tag(raw.as_bytes()).ok_or_else(|| XmppError::xml_parse("incomplete body tag"))?;
    let (name, attributes) = parse_start_tag(&raw[..tag_end])?;
    if name.rsplit(':').next() != Some("body") {
        return Err(XmppError::xml_parse(format!("expected body, got {}", name)));
    }
    if self_closing {
        return Ok(Body {
            attributes,
            children: Vec::new(),
        });
    }

    let close = raw
        .rfind("</")
        .filter(|close| *close >= tag_end)
        .ok_or_else(|| XmppError::xml_parse("unterminated body"))?;
    let inner = &raw[tag_end..close];

    let mut parser = XmlParser::new(max_stanza_size);
    parser.feed(open_stream_xml(ns::JABBER_CLIENT, None, None, None).as_bytes());
    parser.feed(inner.as_bytes());

    let mut children = Vec::new();
    while let Some(event) = parser.next_event()? {
        if let XmlEvent::Stanza(element) = event {
            children.push(element);
        }
    }
    if parser.depth > 1 {
        return Err(XmppError::xml_parse("unterminated element in body"));
    }

    Ok(Body {
        attributes,
        children,
    })
}
