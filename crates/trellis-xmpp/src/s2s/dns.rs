//! SRV resolution for outbound server streams (RFC 6120 Section 3.2).
//!
//! `_xmpp-server._tcp.<domain>` is queried first; targets are ordered by
//! priority ascending, then weight descending. Without usable SRV records
//! the bare domain is tried on port 5269.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default XMPP S2S port as per RFC 6120.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No records found for the name.
    #[error("no DNS records found for {0}")]
    NoRecords(String),

    /// The lookup itself failed.
    #[error("DNS resolution failed for {domain}: {message}")]
    ResolutionFailed { domain: String, message: String },
}

/// One place to try connecting to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    /// Lower is tried first
    pub priority: u16,
    /// Higher is tried first within a priority
    pub weight: u16,
}

impl ResolvedTarget {
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }

    /// The bare domain on the default port.
    pub fn fallback(domain: impl Into<String>) -> Self {
        Self::new(domain, DEFAULT_S2S_PORT, 0, 0)
    }
}

/// Order targets: priority ascending, weight descending.
pub fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
}

/// Name resolution used by the outbound connector.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Ordered targets for a remote XMPP domain.
    async fn resolve_xmpp_server(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError>;

    /// Addresses of one target host.
    async fn resolve_host(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DnsError>;
}

type TokioResolver = Resolver<TokioConnectionProvider>;

/// System DNS resolver.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
}

impl SrvResolver {
    /// Use the system configuration, falling back to public defaults.
    pub fn new() -> Self {
        let builder = Resolver::builder(TokioConnectionProvider::default()).unwrap_or_else(|e| {
            warn!(error = %e, "System DNS configuration unavailable, using defaults");
            Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
        });
        Self {
            resolver: Arc::new(builder.build()),
        }
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetResolver for SrvResolver {
    #[instrument(skip(self), name = "dns.resolve_xmpp_server")]
    async fn resolve_xmpp_server(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        let srv_name = format!("_xmpp-server._tcp.{}", domain);

        let mut targets = match self.resolver.srv_lookup(&srv_name).await {
            Ok(response) => srv_targets(response.iter()),
            Err(e) if is_no_records_error(&e) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "SRV lookup failed, falling back to domain");
                Vec::new()
            }
        };

        if targets.is_empty() {
            debug!(domain = %domain, "No SRV targets, using domain on default port");
            return Ok(vec![ResolvedTarget::fallback(domain)]);
        }

        sort_targets(&mut targets);
        debug!(count = targets.len(), "Resolved SRV targets");
        Ok(targets)
    }

    #[instrument(skip(self), name = "dns.resolve_host")]
    async fn resolve_host(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DnsError> {
        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| DnsError::ResolutionFailed {
                domain: host.to_string(),
                message: e.to_string(),
            })?;
        let addrs: Vec<SocketAddr> = response.iter().map(|ip| SocketAddr::new(ip, port)).collect();
        if addrs.is_empty() {
            return Err(DnsError::NoRecords(host.to_string()));
        }
        Ok(addrs)
    }
}

fn srv_targets<'a>(records: impl Iterator<Item = &'a SRV>) -> Vec<ResolvedTarget> {
    records
        .filter_map(|srv| {
            let target = srv.target().to_utf8();
            // "." means the service is explicitly unavailable
            let host = target.trim_end_matches('.');
            (!host.is_empty()).then(|| {
                ResolvedTarget::new(host, srv.port(), srv.priority(), srv.weight())
            })
        })
        .collect()
}

/// NoRecordsFound lives in the inner proto error in hickory 0.25.
fn is_no_records_error(error: &ResolveError) -> bool {
    match error.kind() {
        ResolveErrorKind::Proto(proto) => {
            matches!(proto.kind(), ProtoErrorKind::NoRecordsFound { .. })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_priority_then_weight() {
        let mut targets = vec![
            ResolvedTarget::new("c.example.com", 5269, 20, 50),
            ResolvedTarget::new("a.example.com", 5269, 10, 30),
            ResolvedTarget::new("b.example.com", 5270, 10, 70),
            ResolvedTarget::new("d.example.com", 5269, 30, 100),
        ];
        sort_targets(&mut targets);

        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(
            hosts,
            vec!["b.example.com", "a.example.com", "c.example.com", "d.example.com"]
        );
    }

    #[test]
    fn test_fallback_uses_default_port() {
        let target = ResolvedTarget::fallback("remote.org");
        assert_eq!(target.host, "remote.org");
        assert_eq!(target.port, DEFAULT_S2S_PORT);
    }
}
