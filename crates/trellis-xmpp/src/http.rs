//! BOSH (XEP-0124/XEP-0206) endpoint.
//!
//! Every BOSH session is an actor task owning a [`Stream`] and a
//! [`Machine`] of the BOSH flavor, exactly like a TCP connection owns its
//! own. HTTP requests are forwarded to the actor over a channel and answered
//! through a oneshot. A request with nothing to return is held until routed
//! stanzas arrive or `wait` expires; at most one request is held at a time.
//! Requests inside the rid window are processed in rid order, whatever order
//! they arrive in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::config::HttpConfig;
use crate::error::{generate_stream_error, stream_errors};
use crate::metrics;
use crate::parser::{is_stanza, ns, parse_body, Body, StreamHeader, XmlEvent};
use crate::router::{Outbound, Router};
use crate::state::{Machine, Step};
use crate::stream::{Services, Stream};
use crate::token_bucket::TokenBucket;
use crate::types::Flavor;
use crate::XmppError;

/// Requests a client may have outstanding.
const REQUESTS: u64 = 2;

/// Protocol version we speak.
const BOSH_VERSION: &str = "1.6";

/// One HTTP request handed to a session actor.
struct Request {
    body: Body,
    reply: oneshot::Sender<String>,
}

/// An empty `<body/>` with the given extra attributes.
fn empty_body(attributes: &[(&str, &str)]) -> String {
    wrap(attributes, "")
}

fn wrap(attributes: &[(&str, &str)], payload: &str) -> String {
    let mut xml = format!(
        "<body xmlns='{}' xmlns:xmpp='{}' xmlns:stream='{}'",
        ns::HTTP_BIND,
        ns::XBOSH,
        ns::STREAM
    );
    for (name, value) in attributes {
        xml.push_str(&format!(" {}='{}'", name, value));
    }
    if payload.is_empty() {
        xml.push_str("/>");
    } else {
        xml.push('>');
        xml.push_str(payload);
        xml.push_str("</body>");
    }
    xml
}

/// A terminal binding error.
fn terminate(condition: &str) -> String {
    empty_body(&[("type", "terminate"), ("condition", condition)])
}

/// The BOSH endpoint and its live sessions.
pub struct BoshService {
    services: Arc<Services>,
    router: Arc<Router>,
    config: HttpConfig,
    sessions: DashMap<String, mpsc::Sender<Request>>,
    shutdown: CancellationToken,
}

impl BoshService {
    pub fn new(
        services: Arc<Services>,
        router: Arc<Router>,
        config: HttpConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            services,
            router,
            config,
            sessions: DashMap::new(),
            shutdown,
        }
    }

    /// HTTP routes serving this endpoint.
    pub fn routes(self: Arc<Self>) -> axum::Router {
        let path = self.config.path.clone();
        axum::Router::new()
            .route(&path, post(handle_request))
            .with_state(self)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Process one request body and return the response body.
    #[instrument(name = "xmpp.bosh.request", skip(self, raw))]
    pub async fn handle_body(self: &Arc<Self>, raw: &str) -> (StatusCode, String) {
        let body = match parse_body(raw, self.services.config.limits.max_stanza_size) {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "Unparseable BOSH request");
                return (StatusCode::BAD_REQUEST, terminate("bad-request"));
            }
        };

        match body.attr("sid").map(str::to_string) {
            None => self.create(body).await,
            Some(sid) => self.forward(&sid, body).await,
        }
    }

    async fn create(self: &Arc<Self>, body: Body) -> (StatusCode, String) {
        if body.attr("to").is_none() || rid_of(&body).is_none() {
            return (StatusCode::BAD_REQUEST, terminate("bad-request"));
        }
        let wait = body
            .attr("wait")
            .and_then(|w| w.parse::<u64>().ok())
            .unwrap_or(self.config.max_wait)
            .min(self.config.max_wait);

        let sid = hex::encode(rand::random::<[u8; 16]>());
        let session = match BoshSession::new(self, sid.clone(), wait) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not create BOSH session");
                return (StatusCode::INTERNAL_SERVER_ERROR, terminate("internal-server-error"));
            }
        };

        let (tx, rx) = mpsc::channel(REQUESTS as usize + 1);
        self.sessions.insert(sid.clone(), tx.clone());
        tokio::spawn(session.run(rx).instrument(info_span!(
            "xmpp.connection.lifecycle",
            transport = "bosh",
            sid = %sid,
            jid = tracing::field::Empty
        )));
        info!(sid = %sid, "BOSH session created");

        self.submit(tx, body).await
    }

    async fn forward(&self, sid: &str, body: Body) -> (StatusCode, String) {
        let sender = self.sessions.get(sid).map(|entry| entry.value().clone());
        let Some(sender) = sender else {
            debug!(sid = %sid, "Request for unknown BOSH session");
            return (StatusCode::NOT_FOUND, terminate("item-not-found"));
        };
        self.submit(sender, body).await
    }

    async fn submit(&self, sender: mpsc::Sender<Request>, body: Body) -> (StatusCode, String) {
        let (reply, response) = oneshot::channel();
        if sender.send(Request { body, reply }).await.is_err() {
            return (StatusCode::NOT_FOUND, terminate("item-not-found"));
        }
        match response.await {
            Ok(xml) => (StatusCode::OK, xml),
            Err(_) => (StatusCode::NOT_FOUND, terminate("item-not-found")),
        }
    }
}

async fn handle_request(State(service): State<Arc<BoshService>>, raw: String) -> Response {
    let (status, xml) = service.handle_body(&raw).await;
    (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        xml,
    )
        .into_response()
}

fn rid_of(body: &Body) -> Option<u64> {
    body.attr("rid").and_then(|rid| rid.parse().ok())
}

/// Stream header synthesized from a creation or restart request.
fn synthetic_header(to: Option<&str>, body: &Body) -> StreamHeader {
    StreamHeader {
        name: "stream:stream".to_string(),
        to: to.map(str::to_string),
        version: Some(body.attr("xmpp:version").unwrap_or("1.0").to_string()),
        lang: body.attr("xml:lang").map(str::to_string),
        default_ns: Some(ns::JABBER_CLIENT.to_string()),
        prefixes: vec![("stream".to_string(), ns::STREAM.to_string())],
        ..Default::default()
    }
}

/// Actor state of one BOSH session.
struct BoshSession {
    service: Arc<BoshService>,
    sid: String,
    stream: Stream,
    machine: Machine,
    bucket: TokenBucket,
    rx: mpsc::Receiver<Outbound>,
    wait: Duration,
    inactivity: Duration,
    /// Highest rid processed; every lower rid has been processed too
    last_rid: Option<u64>,
    /// Recent responses by rid, for retransmission
    responses: BTreeMap<u64, String>,
    /// Requests that arrived ahead of a missing rid
    waiting: BTreeMap<u64, Request>,
    held: Option<(u64, oneshot::Sender<String>, Instant)>,
    last_activity: Instant,
    closed: bool,
}

impl BoshSession {
    fn new(service: &Arc<BoshService>, sid: String, wait: u64) -> Result<Self, XmppError> {
        let limits = &service.services.config.limits;
        let (tx, rx) = mpsc::channel(limits.outbound_queue.max(1));
        let stream = Stream::new(
            Flavor::Http,
            Arc::clone(&service.services),
            Arc::clone(&service.router),
            tx,
            None,
        );
        Ok(Self {
            service: Arc::clone(service),
            sid,
            stream,
            machine: Machine::new(Flavor::Http)?,
            bucket: TokenBucket::new(limits.rate_capacity, limits.rate_per_second)?,
            rx,
            wait: Duration::from_secs(wait),
            inactivity: Duration::from_secs(service.config.inactivity),
            last_rid: None,
            responses: BTreeMap::new(),
            waiting: BTreeMap::new(),
            held: None,
            last_activity: Instant::now(),
            closed: false,
        })
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let shutdown = self.service.shutdown.clone();
        while !self.closed {
            let deadline = match &self.held {
                Some((_, _, deadline)) => *deadline,
                None => self.last_activity + self.inactivity,
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.fail(&XmppError::stream(stream_errors::SYSTEM_SHUTDOWN));
                }
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                message = self.rx.recv() => {
                    if let Some(message) = message {
                        self.on_routed(message).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if self.held.is_some() {
                        self.release();
                    } else {
                        info!(sid = %self.sid, "BOSH session inactive");
                        self.closed = true;
                    }
                }
            }
        }

        self.service.sessions.remove(&self.sid);
        self.stream.teardown().await;
        info!(sid = %self.sid, jid = ?self.stream.session().jid(), "BOSH session closed");
    }

    async fn on_request(&mut self, request: Request) {
        self.last_activity = Instant::now();
        let Some(rid) = rid_of(&request.body) else {
            self.close_with(request.reply, terminate("bad-request"));
            return;
        };

        let Some(last) = self.last_rid else {
            self.last_rid = Some(rid);
            self.on_create(request.body, rid, request.reply).await;
            return;
        };

        if rid <= last {
            self.retransmit(rid, request.reply);
            return;
        }
        if rid > last + REQUESTS {
            debug!(rid, last, "Request id outside the window");
            self.close_with(request.reply, terminate("item-not-found"));
            return;
        }
        if rid > last + 1 {
            debug!(rid, last, "Request arrived early, waiting for the gap");
            self.waiting.insert(rid, request);
            return;
        }

        self.process_request(rid, request).await;
        while !self.closed {
            let next = self.last_rid.map(|last| last + 1).unwrap_or_default();
            match self.waiting.remove(&next) {
                Some(request) => self.process_request(next, request).await,
                None => break,
            }
        }
    }

    /// Answer a repeated rid from the cache, or take over a held one.
    fn retransmit(&mut self, rid: u64, reply: oneshot::Sender<String>) {
        if let Some((held_rid, held_reply, _)) = self.held.as_mut() {
            if *held_rid == rid {
                debug!(rid, "Client repeated the held request");
                *held_reply = reply;
                return;
            }
        }
        match self.responses.get(&rid).cloned() {
            Some(xml) => {
                debug!(rid, "Retransmitting response");
                let _ = reply.send(xml);
            }
            None => self.close_with(reply, terminate("item-not-found")),
        }
    }

    /// Process the next request in rid order.
    async fn process_request(&mut self, rid: u64, request: Request) {
        let Request { body, reply } = request;
        self.last_rid = Some(rid);
        self.release();

        if let Err(e) = self.process_body(&body).await {
            self.fail(&e);
            let _ = reply.send(self.terminal_response(&e));
            return;
        }

        if body.attr("type") == Some("terminate") {
            let payload = self.stream.take_output().join("");
            let _ = reply.send(wrap(&[("type", "terminate")], &payload));
            self.closed = true;
            return;
        }

        let output = self.stream.take_output();
        if output.is_empty() {
            self.held = Some((rid, reply, Instant::now() + self.wait));
        } else {
            self.respond(reply, rid, &output.join(""));
        }
    }

    async fn on_create(&mut self, body: Body, rid: u64, reply: oneshot::Sender<String>) {
        let header = synthetic_header(body.attr("to"), &body);
        let result = async {
            self.machine.start(&mut self.stream).await?;
            self.machine
                .process(&mut self.stream, XmlEvent::StreamOpen(header))
                .await
        }
        .await;

        if let Err(e) = result {
            let condition = match e.stream_condition() {
                stream_errors::HOST_UNKNOWN => "host-unknown",
                _ => "remote-stream-error",
            };
            self.close_with(reply, terminate(condition));
            return;
        }

        let wait = self.wait.as_secs().to_string();
        let inactivity = self.inactivity.as_secs().to_string();
        let requests = REQUESTS.to_string();
        let from = self.stream.requested_to().unwrap_or_default().to_string();
        let payload = self.stream.take_output().join("");
        let xml = wrap(
            &[
                ("sid", &self.sid),
                ("wait", &wait),
                ("requests", &requests),
                ("inactivity", &inactivity),
                ("polling", "1"),
                ("hold", "1"),
                ("ver", BOSH_VERSION),
                ("from", &from),
                ("authid", self.stream.id()),
                ("xmpp:version", "1.0"),
                ("xmpp:restartlogic", "true"),
            ],
            &payload,
        );
        self.respond(reply, rid, &xml);
    }

    /// Feed a request's restart flag and payload to the machine.
    async fn process_body(&mut self, body: &Body) -> Result<(), XmppError> {
        if body.attr("xmpp:restart") == Some("true") {
            let to = self.stream.requested_to().map(str::to_string);
            let header = synthetic_header(to.as_deref(), body);
            self.machine
                .process(&mut self.stream, XmlEvent::StreamOpen(header))
                .await?;
        }
        for child in &body.children {
            if is_stanza(child) && !self.bucket.take(1) {
                metrics::record_rate_limit_violation(self.stream.flavor().kind());
                return Err(XmppError::stream_with_text(
                    stream_errors::POLICY_VIOLATION,
                    "rate limit exceeded",
                ));
            }
            let step = self
                .machine
                .process(&mut self.stream, XmlEvent::Stanza(child.clone()))
                .await?;
            if step == Step::Close {
                self.closed = true;
                break;
            }
        }
        Ok(())
    }

    async fn on_routed(&mut self, message: Outbound) {
        match message {
            Outbound::Stanza(stanza) => self.stream.write(&stanza),
            Outbound::UserUpdated(jid) => {
                let handler = Arc::clone(&self.stream.services().handler);
                if let Err(e) = handler.user_updated(&mut self.stream, &jid).await {
                    warn!(jid = %jid, error = %e, "Failed to apply account update");
                }
            }
            Outbound::Close(condition) => {
                let error = XmppError::stream(condition);
                self.fail(&error);
                if let Some((_, reply, _)) = self.held.take() {
                    let _ = reply.send(self.terminal_response(&error));
                }
                return;
            }
        }
        if self.held.is_some() {
            let output = self.stream.take_output();
            if !output.is_empty() {
                if let Some((rid, reply, _)) = self.held.take() {
                    self.respond(reply, rid, &output.join(""));
                }
            }
        }
    }

    /// Answer the held request with whatever is queued.
    fn release(&mut self) {
        if let Some((rid, reply, _)) = self.held.take() {
            let payload = self.stream.take_output().join("");
            self.respond(reply, rid, &payload);
        }
    }

    fn respond(&mut self, reply: oneshot::Sender<String>, rid: u64, payload: &str) {
        let xml = if payload.starts_with("<body") {
            payload.to_string()
        } else {
            wrap(&[], payload)
        };
        self.responses.insert(rid, xml.clone());
        let oldest = rid.saturating_sub(REQUESTS);
        self.responses.retain(|cached, _| *cached >= oldest);
        if reply.send(xml).is_err() {
            debug!(rid, "Client went away before the response");
        }
    }

    fn close_with(&mut self, reply: oneshot::Sender<String>, xml: String) {
        self.release();
        let _ = reply.send(xml);
        self.closed = true;
    }

    fn fail(&mut self, error: &XmppError) {
        info!(sid = %self.sid, error = %error, "Terminating BOSH session");
        self.release();
        self.closed = true;
    }

    /// `remote-stream-error` carrying the stream error.
    fn terminal_response(&self, error: &XmppError) -> String {
        let text = match error {
            XmppError::StreamError { text, .. } => text.as_deref(),
            _ => None,
        };
        let stream_error = generate_stream_error(error.stream_condition(), text);
        let stream_error = stream_error.trim_end_matches("</stream:stream>");
        wrap(
            &[("type", "terminate"), ("condition", "remote-stream-error")],
            stream_error,
        )
    }
}
