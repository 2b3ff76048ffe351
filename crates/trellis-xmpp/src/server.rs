//! Server assembly.
//!
//! Binds the configured listeners (client, server, component and BOSH),
//! wires the shared services, router, S2S connector and cluster node
//! together, and shuts everything down through one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::certs::{CertStore, DirCertStore};
use crate::cluster::{Cluster, MemoryBackplane};
use crate::config::Config;
use crate::connection::Connection;
use crate::handler::{DefaultHandler, StanzaHandler};
use crate::http::BoshService;
use crate::router::Router;
use crate::s2s::{S2sConnector, SrvResolver, TargetResolver};
use crate::storage::Storage;
use crate::stream::Services;
use crate::tls::TlsContext;
use crate::types::Flavor;
use crate::XmppError;

/// How long [`RunningServer::shutdown`] waits for tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// XMPP server builder.
pub struct XmppServer {
    config: Config,
    storage: Arc<dyn Storage>,
    certs: Option<Arc<dyn CertStore>>,
    handler: Arc<dyn StanzaHandler>,
    resolver: Option<Arc<dyn TargetResolver>>,
    backplane: Option<Arc<MemoryBackplane>>,
}

impl XmppServer {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            certs: None,
            handler: Arc::new(DefaultHandler::new()),
            resolver: None,
            backplane: None,
        }
    }

    /// Use `certs` instead of a [`DirCertStore`] over `certs_dir`.
    pub fn with_certs(mut self, certs: Arc<dyn CertStore>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn StanzaHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Resolve S2S targets with `resolver` instead of system DNS.
    pub fn with_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Join the cluster over `backplane`. Nodes sharing a backplane see
    /// each other.
    pub fn with_backplane(mut self, backplane: Arc<MemoryBackplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Bind every configured listener and start serving.
    pub async fn start(self) -> Result<RunningServer, XmppError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let certs = match self.certs {
            Some(certs) => certs,
            None => Arc::new(DirCertStore::open(&config.certs_dir)?),
        };
        let tls = TlsContext::load(config.local_domains(), certs.as_ref())?;
        if config.client.is_some() && tls.is_none() {
            return Err(XmppError::config(
                "client listener requires a certificate for at least one host",
            ));
        }

        let services = Arc::new(Services {
            config: Arc::clone(&config),
            storage: self.storage,
            certs,
            handler: self.handler,
            tls,
        });

        let shutdown = CancellationToken::new();
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SrvResolver::new()));
        let connector = Arc::new(S2sConnector::new(
            Arc::clone(&services),
            resolver,
            shutdown.clone(),
        ));

        let mut router = Router::new(Arc::clone(&config), connector);
        let enabled = config.cluster.as_ref().map(|c| c.enabled).unwrap_or(false);
        let cluster = if enabled || self.backplane.is_some() {
            let backplane = self
                .backplane
                .unwrap_or_else(|| Arc::new(MemoryBackplane::new()));
            let cluster = Arc::new(Cluster::in_memory(backplane));
            router = router.with_cluster(Arc::clone(&cluster));
            Some(cluster)
        } else {
            None
        };
        let router = Arc::new(router);

        let mut tasks = Vec::new();
        let mut addresses = ServerAddresses::default();

        if let Some(cluster) = &cluster {
            tasks.push(
                cluster
                    .start(Arc::clone(&router), shutdown.child_token())
                    .await?,
            );
        }

        let listeners = [
            (Flavor::Client, config.client.as_ref().map(|l| l.bind)),
            (Flavor::ServerInbound, config.server.as_ref().map(|s| s.bind)),
            (Flavor::Component, config.component.as_ref().map(|l| l.bind)),
        ];
        for (flavor, bind) in listeners {
            let Some(bind) = bind else {
                continue;
            };
            let listener = TcpListener::bind(bind).await?;
            let local = listener.local_addr()?;
            info!(addr = %local, flavor = %flavor, "XMPP listener bound");
            match flavor {
                Flavor::Client => addresses.client = Some(local),
                Flavor::ServerInbound => addresses.server = Some(local),
                _ => addresses.component = Some(local),
            }
            tasks.push(tokio::spawn(accept_loop(
                listener,
                flavor,
                Arc::clone(&services),
                Arc::clone(&router),
                shutdown.clone(),
            )));
        }

        if let Some(http) = &config.http {
            let listener = TcpListener::bind(http.bind).await?;
            let local = listener.local_addr()?;
            addresses.http = Some(local);
            let bosh = Arc::new(BoshService::new(
                Arc::clone(&services),
                Arc::clone(&router),
                http.clone(),
                shutdown.clone(),
            ));
            info!(addr = %local, path = %http.path, "BOSH endpoint bound");
            let app = bosh.routes();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
                if let Err(e) = served {
                    warn!(error = %e, "BOSH endpoint failed");
                }
            }));
        }

        Ok(RunningServer {
            services,
            router,
            cluster,
            addresses,
            shutdown,
            tasks,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    flavor: Flavor,
    services: Arc<Services>,
    router: Arc<Router>,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(flavor = %flavor, "Listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, flavor = %flavor, "Failed to accept connection");
                    continue;
                }
            },
        };

        let connection = match Connection::accept(
            tcp,
            peer,
            flavor,
            Arc::clone(&services),
            Arc::clone(&router),
            shutdown.child_token(),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Failed to set up connection");
                continue;
            }
        };

        tokio::spawn(connection.run().instrument(info_span!(
            "xmpp.connection.lifecycle",
            client_ip = %peer,
            transport = %flavor,
            jid = tracing::field::Empty,
        )));
    }
}

/// Bound addresses, useful when listeners were configured on port 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerAddresses {
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub component: Option<SocketAddr>,
    pub http: Option<SocketAddr>,
}

/// A started server.
pub struct RunningServer {
    services: Arc<Services>,
    router: Arc<Router>,
    cluster: Option<Arc<Cluster>>,
    addresses: ServerAddresses,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn addresses(&self) -> ServerAddresses {
        self.addresses
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every stream with `system-shutdown`, leave the cluster and
    /// stop the listeners.
    pub async fn shutdown(self) {
        info!(connections = self.router.size(), "Shutting down");
        self.shutdown.cancel();
        let stopping = self
            .tasks
            .into_iter()
            .map(|task| tokio::time::timeout(SHUTDOWN_GRACE, task));
        for result in futures::future::join_all(stopping).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Server task failed"),
                Err(_) => warn!("Server task did not stop in time"),
            }
        }
    }
}
