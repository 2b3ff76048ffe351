//! Test utilities for end-to-end server tests.
//!
//! Provides certificate generation, server startup over real sockets and a
//! raw XMPP client that can upgrade to TLS mid-stream.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use jid::BareJid;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use trellis_xmpp::certs::DirCertStore;
use trellis_xmpp::cluster::MemoryBackplane;
use trellis_xmpp::config::{HostConfig, ListenerConfig};
use trellis_xmpp::s2s::{DnsError, ResolvedTarget, TargetResolver};
use trellis_xmpp::storage::{Deferred, MemoryStorage};
use trellis_xmpp::{Config, RunningServer, XmppServer};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Self-signed certificates for a set of domains, written to one directory.
///
/// Every certificate in the directory is also a trust anchor, so servers
/// sharing it trust each other for S2S.
pub struct TestCerts {
    pub dir: tempfile::TempDir,
    ders: Vec<(String, CertificateDer<'static>)>,
}

impl TestCerts {
    pub fn generate(domains: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create cert dir");
        let mut ders = Vec::new();
        for domain in domains {
            let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec![domain.to_string()])
                .expect("Failed to generate test certificate");
            std::fs::write(dir.path().join(format!("{}.crt", domain)), cert.pem()).unwrap();
            std::fs::write(
                dir.path().join(format!("{}.key", domain)),
                key_pair.serialize_pem(),
            )
            .unwrap();
            ders.push((domain.to_string(), CertificateDer::from(cert.der().to_vec())));
        }
        Self { dir, ders }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A TLS connector trusting every generated certificate.
    pub fn connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for (_, der) in &self.ders {
            roots.add(der.clone()).expect("Failed to add cert");
        }
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("Failed to select protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

/// Resolves fixed domains to fixed addresses.
pub struct StaticResolver {
    targets: Vec<(String, SocketAddr)>,
}

impl StaticResolver {
    pub fn new(targets: Vec<(String, SocketAddr)>) -> Self {
        Self { targets }
    }

    fn lookup(&self, domain: &str) -> Option<SocketAddr> {
        self.targets
            .iter()
            .find(|(name, _)| name == domain)
            .map(|(_, addr)| *addr)
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve_xmpp_server(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        match self.lookup(domain) {
            Some(addr) => Ok(vec![ResolvedTarget::new(domain, addr.port(), 0, 0)]),
            None => Err(DnsError::NoRecords(domain.to_string())),
        }
    }

    async fn resolve_host(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DnsError> {
        match self.lookup(host) {
            Some(addr) => Ok(vec![SocketAddr::new(addr.ip(), port)]),
            None => Err(DnsError::NoRecords(host.to_string())),
        }
    }
}

/// A config for `domain` with a client listener on an ephemeral port.
pub fn client_config(domain: &str, certs: &TestCerts) -> Config {
    Config {
        hosts: vec![HostConfig::new(domain)],
        client: Some(ListenerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
        }),
        certs_dir: certs.path().to_path_buf(),
        ..Default::default()
    }
}

/// Storage holding `users` as `(jid, password)` pairs.
pub fn storage(users: &[(&str, &str)]) -> Arc<Deferred<MemoryStorage>> {
    let storage = MemoryStorage::new();
    for (jid, password) in users {
        storage
            .add_user(BareJid::new(jid).unwrap(), password)
            .expect("Failed to add user");
    }
    Arc::new(Deferred::new(storage))
}

/// Start a server over the certificates in `certs`.
pub async fn start(config: Config, users: &[(&str, &str)], certs: &TestCerts) -> RunningServer {
    start_with(XmppServer::new(config, storage(users)), certs).await
}

pub async fn start_with(server: XmppServer, certs: &TestCerts) -> RunningServer {
    let store = DirCertStore::open(certs.path()).expect("Failed to open cert store");
    server
        .with_certs(Arc::new(store))
        .start()
        .await
        .expect("Failed to start server")
}

/// Start a server that joins the cluster over `backplane`.
pub async fn start_node(
    config: Config,
    users: &[(&str, &str)],
    certs: &TestCerts,
    backplane: Arc<MemoryBackplane>,
) -> RunningServer {
    start_with(
        XmppServer::new(config, storage(users)).with_backplane(backplane),
        certs,
    )
    .await
}

/// A raw client that operates directly on the socket.
pub struct RawXmppClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
}

impl RawXmppClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
        })
    }

    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read until `pattern` appears, returning and consuming everything up
    /// to and including it.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            if let Some(pos) = self.buffer.find(pattern) {
                let end = pos + pattern.len();
                let consumed: String = self.buffer.drain(..end).collect();
                return Ok(consumed);
            }

            let mut buf = [0u8; 8192];
            let read = async {
                if let Some(ref mut tls) = self.tls {
                    tls.read(&mut buf).await
                } else if let Some(ref mut tcp) = self.tcp {
                    tcp.read(&mut buf).await
                } else {
                    Ok(0)
                }
            };
            let n = match timeout(deadline - tokio::time::Instant::now(), read).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Timeout waiting for {:?}; have {:?}", pattern, self.buffer),
                    ))
                }
            };
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed waiting for {:?}; have {:?}", pattern, self.buffer),
                ));
            }
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Everything read so far and not yet consumed.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub async fn upgrade_to_tls(&mut self, connector: TlsConnector, domain: &str) -> std::io::Result<()> {
        let tcp = self
            .tcp
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "No TCP stream"))?;
        let name = ServerName::try_from(domain.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        self.tls = Some(connector.connect(name, tcp).await?);
        self.buffer.clear();
        Ok(())
    }

    pub async fn open_stream(&mut self, domain: &str) -> std::io::Result<String> {
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='{}' version='1.0'>",
            domain
        ))
        .await?;
        self.read_until("</features>", DEFAULT_TIMEOUT).await
    }

    /// STARTTLS and SASL PLAIN, leaving the stream at resource binding.
    /// Returns the SASL outcome element.
    pub async fn authenticate(
        &mut self,
        domain: &str,
        connector: TlsConnector,
        username: &str,
        password: &str,
    ) -> std::io::Result<String> {
        let features = self.open_stream(domain).await?;
        assert!(features.contains("urn:ietf:params:xml:ns:xmpp-tls"));
        self.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await?;
        self.read_until("<proceed", DEFAULT_TIMEOUT).await?;
        self.upgrade_to_tls(connector, domain).await?;

        let features = self.open_stream(domain).await?;
        assert!(features.contains("PLAIN"), "no PLAIN offered: {}", features);
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encode_sasl_plain(username, password)
        ))
        .await?;

        let mut outcome = self.read_until("xmpp-sasl", DEFAULT_TIMEOUT).await?;
        outcome.push_str(&self.read_until(">", DEFAULT_TIMEOUT).await?);
        Ok(outcome)
    }

    /// Full login: returns the bound JID.
    pub async fn login(
        addr: SocketAddr,
        domain: &str,
        connector: TlsConnector,
        username: &str,
        password: &str,
        resource: &str,
    ) -> std::io::Result<(Self, String)> {
        let mut client = Self::connect(addr).await?;
        let outcome = client.authenticate(domain, connector, username, password).await?;
        assert!(outcome.contains("<success"), "login failed: {}", outcome);

        let features = client.open_stream(domain).await?;
        assert!(features.contains("urn:ietf:params:xml:ns:xmpp-bind"));
        let reply = client.bind(resource).await?;
        let jid = extract_bound_jid(&reply).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bind failed: {}", reply))
        })?;
        Ok((client, jid))
    }

    /// Send a bind request and return the reply.
    pub async fn bind(&mut self, resource: &str) -> std::io::Result<String> {
        self.send(&format!(
            "<iq type='set' id='bind_1' xmlns='jabber:client'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{}</resource></bind></iq>",
            resource
        ))
        .await?;
        self.read_until("</iq>", DEFAULT_TIMEOUT).await
    }
}

/// Encode SASL PLAIN credentials.
pub fn encode_sasl_plain(username: &str, password: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{}\0{}", username, password))
}

/// Extract the JID from a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")? + 5;
    let end = response[start..].find("</jid>")? + start;
    Some(response[start..end].to_string())
}
