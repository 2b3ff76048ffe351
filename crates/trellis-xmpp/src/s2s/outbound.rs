//! On-demand outbound server connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::dns::TargetResolver;
use crate::connection::Connection;
use crate::error::stream_errors;
use crate::router::{ConnectionHandle, Connector, Outbound, Router};
use crate::stream::Services;
use crate::XmppError;

/// Longest a TCP connect to one address may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the whole negotiation of a new stream.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens outbound server streams for the router.
///
/// Targets come from SRV resolution and are tried in order until a TCP
/// connection succeeds. The stream is then negotiated on its own task; the
/// router receives its handle once negotiation reaches the ready state.
pub struct S2sConnector {
    services: Arc<Services>,
    resolver: Arc<dyn TargetResolver>,
    shutdown: CancellationToken,
    timeout: Duration,
}

impl S2sConnector {
    pub fn new(
        services: Arc<Services>,
        resolver: Arc<dyn TargetResolver>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            services,
            resolver,
            shutdown,
            timeout: NEGOTIATION_TIMEOUT,
        }
    }

    /// Override the negotiation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TCP connect to the first reachable address of `remote`.
    async fn open(&self, remote: &str) -> Result<(TcpStream, SocketAddr), XmppError> {
        let targets = self
            .resolver
            .resolve_xmpp_server(remote)
            .await
            .map_err(|e| XmppError::remote_server_not_found(Some(e.to_string())))?;

        for target in targets {
            let addrs = match self.resolver.resolve_host(&target.host, target.port).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!(host = %target.host, error = %e, "Target did not resolve");
                    continue;
                }
            };
            for addr in addrs {
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(tcp)) => {
                        debug!(host = %target.host, addr = %addr, "Connected");
                        return Ok((tcp, addr));
                    }
                    Ok(Err(e)) => debug!(addr = %addr, error = %e, "Connect failed"),
                    Err(_) => debug!(addr = %addr, "Connect timed out"),
                }
            }
        }

        warn!(remote = %remote, "No reachable target");
        Err(XmppError::remote_server_not_found(Some(format!(
            "could not connect to {}",
            remote
        ))))
    }
}

#[async_trait]
impl Connector for S2sConnector {
    #[instrument(name = "xmpp.s2s.connect", skip(self, router))]
    async fn connect(
        &self,
        router: Arc<Router>,
        local: String,
        remote: String,
    ) -> Result<ConnectionHandle, XmppError> {
        let (tcp, addr) = self.open(&remote).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let connection = Connection::outbound(
            tcp,
            Some(addr),
            Arc::clone(&self.services),
            router,
            &local,
            &remote,
            ready_tx,
            self.shutdown.child_token(),
        )?;
        let handle = connection.handle();

        tokio::spawn(connection.run().instrument(info_span!(
            "xmpp.connection.lifecycle",
            client_ip = %addr,
            transport = "s2s-out",
            jid = tracing::field::Empty
        )));

        match tokio::time::timeout(self.timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!(remote = %remote, "Outbound stream negotiated");
                Ok(handle)
            }
            Ok(Err(_)) => Err(XmppError::remote_server_not_found(Some(format!(
                "negotiation with {} failed",
                remote
            )))),
            Err(_) => {
                warn!(remote = %remote, "Outbound negotiation timed out");
                handle.send(Outbound::Close(stream_errors::REMOTE_CONNECTION_FAILED));
                Err(XmppError::remote_server_not_found(Some(format!(
                    "negotiation with {} timed out",
                    remote
                ))))
            }
        }
    }
}
