//! Socket actor for TCP streams.
//!
//! One task per connection owns the socket, the parser, the rate limiter and
//! the state machine. It reacts to three sources: bytes from the peer,
//! messages routed to it, and server shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::certs::der_to_pem;
use crate::error::{generate_stream_error, stream_errors};
use crate::metrics;
use crate::parser::{is_stanza, XmlEvent, XmlParser};
use crate::router::{ConnectionHandle, Outbound, Router};
use crate::state::{Machine, Step};
use crate::stream::{Services, Stream};
use crate::token_bucket::TokenBucket;
use crate::types::Flavor;
use crate::XmppError;

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 8192;

/// Transport under a connection, plain until STARTTLS completes.
#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

async fn read(inner: &mut StreamInner, buf: &mut [u8]) -> Result<usize, XmppError> {
    match inner {
        StreamInner::None => Err(XmppError::internal("Stream not initialized")),
        StreamInner::Tcp(s) => Ok(s.read(buf).await?),
        StreamInner::Tls(s) => Ok(s.read(buf).await?),
    }
}

async fn write_all(inner: &mut StreamInner, buf: &[u8]) -> Result<(), XmppError> {
    match inner {
        StreamInner::None => Err(XmppError::internal("Stream not initialized")),
        StreamInner::Tcp(s) => Ok(s.write_all(buf).await?),
        StreamInner::Tls(s) => Ok(s.write_all(buf).await?),
    }
}

async fn flush(inner: &mut StreamInner) -> Result<(), XmppError> {
    match inner {
        StreamInner::None => Err(XmppError::internal("Stream not initialized")),
        StreamInner::Tcp(s) => Ok(s.flush().await?),
        StreamInner::Tls(s) => Ok(s.flush().await?),
    }
}

async fn shutdown(inner: &mut StreamInner) {
    let result = match inner {
        StreamInner::None => Ok(()),
        StreamInner::Tcp(s) => s.shutdown().await,
        StreamInner::Tls(s) => s.shutdown().await,
    };
    if let Err(e) = result {
        debug!(error = %e, "Transport shutdown failed");
    }
}

/// Actor for one TCP stream of any flavor.
pub struct Connection {
    inner: StreamInner,
    parser: XmlParser,
    bucket: TokenBucket,
    machine: Machine,
    stream: Stream,
    rx: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
}

impl Connection {
    fn new(
        tcp: TcpStream,
        peer: Option<SocketAddr>,
        flavor: Flavor,
        services: Arc<Services>,
        router: Arc<Router>,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        let limits = &services.config.limits;
        let (tx, rx) = mpsc::channel(limits.outbound_queue.max(1));
        let parser = XmlParser::new(limits.max_stanza_size);
        let bucket = TokenBucket::new(limits.rate_capacity, limits.rate_per_second)?;
        let stream = Stream::new(flavor, services, router, tx, peer);

        Ok(Self {
            inner: StreamInner::Tcp(tcp),
            parser,
            bucket,
            machine: Machine::new(flavor)?,
            stream,
            rx,
            shutdown,
        })
    }

    /// Wrap a socket accepted by a listener.
    pub fn accept(
        tcp: TcpStream,
        peer: SocketAddr,
        flavor: Flavor,
        services: Arc<Services>,
        router: Arc<Router>,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        Self::new(tcp, Some(peer), flavor, services, router, shutdown)
    }

    /// Wrap a socket we opened to `remote` on behalf of `local`. `ready`
    /// fires once the stream can carry stanzas.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        tcp: TcpStream,
        peer: Option<SocketAddr>,
        services: Arc<Services>,
        router: Arc<Router>,
        local: &str,
        remote: &str,
        ready: oneshot::Sender<()>,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        let mut connection =
            Self::new(tcp, peer, Flavor::ServerOutbound, services, router, shutdown)?;
        connection.stream.set_local_domain(local);
        connection.stream.set_remote_domain(remote);
        connection.stream.set_ready_signal(ready);
        Ok(connection)
    }

    /// Handle the router uses to reach this connection.
    pub fn handle(&self) -> ConnectionHandle {
        self.stream.handle()
    }

    /// Serve the connection until either side closes it.
    #[instrument(name = "xmpp.connection.run", skip(self), fields(flavor = %self.stream.flavor(), stream_id = %self.stream.id()))]
    pub async fn run(mut self) {
        debug!(peer = ?self.stream.peer(), "Connection opened");

        match self.serve().await {
            Ok(()) => debug!("Stream closed"),
            Err(XmppError::Io(e)) => debug!(error = %e, "Connection lost"),
            Err(e) => {
                info!(error = %e, condition = e.stream_condition(), "Closing stream on error");
                self.fail(&e).await;
            }
        }

        self.stream.teardown().await;
        shutdown(&mut self.inner).await;
        info!(jid = ?self.stream.session().jid(), domain = ?self.stream.session().domain(), "Connection closed");
    }

    async fn serve(&mut self) -> Result<(), XmppError> {
        self.machine.start(&mut self.stream).await?;
        self.flush_output().await?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(XmppError::stream(stream_errors::SYSTEM_SHUTDOWN));
                }
                n = read(&mut self.inner, &mut buf) => {
                    let n = n?;
                    if n == 0 {
                        debug!("Peer closed the connection");
                        return Ok(());
                    }
                    self.parser.feed(&buf[..n]);
                    if !self.drain().await? {
                        return Ok(());
                    }
                }
                message = self.rx.recv() => {
                    // the stream holds a sender, so the channel never closes here
                    if let Some(message) = message {
                        self.deliver(message).await?;
                    }
                }
            }
        }
    }

    /// Process every buffered event. Returns `false` once the stream closed.
    async fn drain(&mut self) -> Result<bool, XmppError> {
        while let Some(event) = self.parser.next_event()? {
            if let XmlEvent::Stanza(element) = &event {
                if is_stanza(element) && !self.bucket.take(1) {
                    metrics::record_rate_limit_violation(self.stream.flavor().kind());
                    warn!(jid = ?self.stream.session().jid(), "Rate limit exceeded");
                    return Err(XmppError::stream_with_text(
                        stream_errors::POLICY_VIOLATION,
                        "rate limit exceeded",
                    ));
                }
            }

            let step = self.machine.process(&mut self.stream, event).await?;
            self.flush_output().await?;
            match step {
                Step::StartTls => {
                    self.upgrade().await?;
                    self.machine.advance(&mut self.stream).await?;
                    self.flush_output().await?;
                }
                Step::Restart => self.parser.restart(),
                Step::Close => {
                    if self.stream.header_sent() {
                        write_all(&mut self.inner, b"</stream:stream>").await?;
                        flush(&mut self.inner).await?;
                    }
                    return Ok(false);
                }
                _ => {}
            }
        }
        Ok(true)
    }

    async fn deliver(&mut self, message: Outbound) -> Result<(), XmppError> {
        match message {
            Outbound::Stanza(stanza) => self.stream.write(&stanza),
            Outbound::UserUpdated(jid) => {
                let handler = Arc::clone(&self.stream.services().handler);
                if let Err(e) = handler.user_updated(&mut self.stream, &jid).await {
                    warn!(jid = %jid, error = %e, "Failed to apply account update");
                }
            }
            Outbound::Close(condition) => return Err(XmppError::stream(condition)),
        }
        self.flush_output().await
    }

    async fn flush_output(&mut self) -> Result<(), XmppError> {
        let output = self.stream.take_output();
        if output.is_empty() {
            return Ok(());
        }
        for chunk in output {
            write_all(&mut self.inner, chunk.as_bytes()).await?;
        }
        flush(&mut self.inner).await
    }

    /// Switch the transport to TLS in the role the flavor dictates and start
    /// a fresh parser document.
    #[instrument(name = "xmpp.connection.starttls", skip(self))]
    async fn upgrade(&mut self) -> Result<(), XmppError> {
        let tls = self
            .stream
            .services()
            .tls
            .clone()
            .ok_or_else(|| XmppError::internal("TLS not configured"))?;
        let tcp = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(_) => {
                return Err(XmppError::stream_with_text(
                    stream_errors::POLICY_VIOLATION,
                    "Already using TLS",
                ))
            }
            StreamInner::None => return Err(XmppError::internal("Stream already taken")),
        };

        let secured: TlsStream<TcpStream> = if self.stream.flavor().is_initiator() {
            let local = self.stream.local_domain().unwrap_or_default().to_string();
            let remote = self.stream.remote_domain().unwrap_or_default().to_string();
            let name = ServerName::try_from(remote.clone())
                .map_err(|e| XmppError::internal(format!("invalid server name {}: {}", remote, e)))?;
            tls.connector(&local)?.connect(name, tcp).await?.into()
        } else {
            tls.acceptor().accept(tcp).await?.into()
        };

        let peer_cert = secured
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| der_to_pem(cert.as_ref()));
        debug!(peer_cert = peer_cert.is_some(), "TLS established");

        self.inner = StreamInner::Tls(Box::new(secured));
        self.stream.set_secured(peer_cert);
        self.parser.reset();
        Ok(())
    }

    /// Report a fatal error to the peer and close our side of the stream.
    async fn fail(&mut self, error: &XmppError) {
        if !self.stream.header_sent() {
            let host = self.stream.requested_to().map(str::to_string);
            self.stream.open_stream(host.as_deref(), None);
        }
        let text = match error {
            XmppError::StreamError { text, .. } => text.as_deref(),
            _ => None,
        };
        self.stream
            .write_raw(generate_stream_error(error.stream_condition(), text));
        if let Err(e) = self.flush_output().await {
            debug!(error = %e, "Could not deliver stream error");
        }
    }
}
