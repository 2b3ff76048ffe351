//! Server configuration.
//!
//! Plain serde structs; the binary decides where they are loaded from. One
//! `Config` is built at startup and shared as `Arc<Config>` by every
//! listener, connection and the router.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use jid::Jid;
use serde::{Deserialize, Serialize};

use crate::parser::DEFAULT_MAX_STANZA_SIZE;
use crate::XmppError;

/// Default concurrent resources per account.
pub const DEFAULT_MAX_RESOURCES: usize = 5;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Virtual hosts served by this process
    pub hosts: Vec<HostConfig>,
    /// C2S listener
    pub client: Option<ListenerConfig>,
    /// S2S listener and federation allow-list
    pub server: Option<ServerConfig>,
    /// External component listener
    pub component: Option<ListenerConfig>,
    /// BOSH endpoint
    pub http: Option<HttpConfig>,
    /// Multi-node operation
    pub cluster: Option<ClusterConfig>,
    /// Per-connection limits
    pub limits: LimitsConfig,
    /// Directory holding `<domain>.crt`/`<domain>.key` pairs and trusted peer certificates
    pub certs_dir: PathBuf,
    /// Accounts seeded into the in-memory store
    pub users: Vec<UserConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: vec![HostConfig::new("localhost")],
            client: Some(ListenerConfig {
                bind: SocketAddr::from(([0, 0, 0, 0], 5222)),
            }),
            server: None,
            component: None,
            http: None,
            cluster: None,
            limits: LimitsConfig::default(),
            certs_dir: PathBuf::from("certs"),
            users: Vec::new(),
        }
    }
}

/// A virtual host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Domain served, e.g. `example.com`
    pub domain: String,
    /// Whether users may exchange stanzas with other local hosts
    #[serde(default)]
    pub cross_domain_messages: bool,
    /// Concurrent resources allowed per bare JID
    #[serde(default = "default_max_resources")]
    pub max_resources_per_account: usize,
    /// Component subdomain to shared secret
    #[serde(default)]
    pub components: HashMap<String, String>,
}

fn default_max_resources() -> usize {
    DEFAULT_MAX_RESOURCES
}

impl HostConfig {
    /// Create a host with default settings.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            cross_domain_messages: false,
            max_resources_per_account: DEFAULT_MAX_RESOURCES,
            components: HashMap::new(),
        }
    }

    /// Enable or disable cross-domain messaging.
    pub fn with_cross_domain_messages(mut self, enabled: bool) -> Self {
        self.cross_domain_messages = enabled;
        self
    }

    /// Set the per-account resource limit.
    pub fn with_max_resources(mut self, max: usize) -> Self {
        self.max_resources_per_account = max;
        self
    }

    /// Register a component subdomain with its shared secret.
    pub fn with_component(mut self, domain: impl Into<String>, secret: impl Into<String>) -> Self {
        self.components.insert(domain.into(), secret.into());
        self
    }
}

/// A plain TCP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to bind
    pub bind: SocketAddr,
}

/// S2S listener and federation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind for inbound S2S (usually port 5269)
    pub bind: SocketAddr,
    /// Remote domains we federate with
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// BOSH endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to bind
    pub bind: SocketAddr,
    /// Request path
    #[serde(default = "default_bosh_path")]
    pub path: String,
    /// Longest a request is held open, in seconds
    #[serde(default = "default_bosh_wait")]
    pub max_wait: u64,
    /// Seconds without a request before a session is dropped
    #[serde(default = "default_bosh_inactivity")]
    pub inactivity: u64,
}

fn default_bosh_path() -> String {
    "/http-bind".to_string()
}

fn default_bosh_wait() -> u64 {
    60
}

fn default_bosh_inactivity() -> u64 {
    30
}

/// Cluster membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether this process joins the cluster
    #[serde(default)]
    pub enabled: bool,
}

/// Per-connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted stanza, in bytes
    pub max_stanza_size: usize,
    /// Token bucket capacity, in stanzas
    pub rate_capacity: u32,
    /// Token bucket refill rate, in stanzas per second
    pub rate_per_second: f64,
    /// Outbound queue depth per connection
    pub outbound_queue: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            rate_capacity: 50,
            rate_per_second: 10.0,
            outbound_queue: 256,
        }
    }
}

/// An account seeded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Bare JID
    pub jid: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Argon2 PHC string
    pub password_hash: String,
}

impl Config {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), XmppError> {
        if self.hosts.is_empty() {
            return Err(XmppError::config("at least one host is required"));
        }
        for host in &self.hosts {
            if host.max_resources_per_account == 0 {
                return Err(XmppError::config(format!(
                    "{}: max_resources_per_account must be positive",
                    host.domain
                )));
            }
            for component in host.components.keys() {
                if !component.ends_with(&format!(".{}", host.domain)) {
                    return Err(XmppError::config(format!(
                        "component {} is not a subdomain of {}",
                        component, host.domain
                    )));
                }
            }
        }
        if self.limits.rate_capacity == 0 || self.limits.rate_per_second <= 0.0 {
            return Err(XmppError::config("rate limits must be positive"));
        }
        Ok(())
    }

    /// Host settings for a locally served domain.
    pub fn vhost(&self, domain: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.domain == domain)
    }

    /// Whether `domain` is a virtual host of this server.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.vhost(domain).is_some()
    }

    /// Shared secret for a component domain.
    pub fn component_secret(&self, domain: &str) -> Option<&str> {
        self.hosts
            .iter()
            .find_map(|h| h.components.get(domain))
            .map(String::as_str)
    }

    /// Whether `domain` is a component of one of our hosts.
    pub fn is_component(&self, domain: &str) -> bool {
        self.component_secret(domain).is_some()
    }

    /// Whether we federate with the remote `domain`.
    pub fn s2s_allowed(&self, domain: &str) -> bool {
        self.server
            .as_ref()
            .map(|s| s.hosts.iter().any(|h| h == domain))
            .unwrap_or(false)
    }

    /// Resource limit for accounts on `domain`.
    pub fn max_resources_per_account(&self, domain: &str) -> usize {
        self.vhost(domain)
            .map(|h| h.max_resources_per_account)
            .unwrap_or(DEFAULT_MAX_RESOURCES)
    }

    /// Domains we accept as `to` on a stream of the given flavor.
    pub fn local_domains(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.domain.as_str())
    }

    /// Cross-domain visibility: may `from` see or address `to`?
    ///
    /// Traffic within one domain is always allowed. Between two local hosts
    /// both must enable `cross_domain_messages`. A component may talk to its
    /// parent host. Anything involving a remote domain passes here whatever
    /// `cross_domain_messages` says; a remote peer is vetted by S2S
    /// authentication instead.
    pub fn allowed(&self, to: &Jid, from: &Jid) -> bool {
        let to = to.domain().as_str();
        let from = from.domain().as_str();
        if to.is_empty() || from.is_empty() {
            return false;
        }
        if to == from {
            return true;
        }

        match (self.vhost(to), self.vhost(from)) {
            (Some(a), Some(b)) => a.cross_domain_messages && b.cross_domain_messages,
            _ => {
                let parent_of = |component: &str| {
                    self.hosts
                        .iter()
                        .find(|h| h.components.contains_key(component))
                        .map(|h| h.domain.as_str())
                };
                match (parent_of(to), parent_of(from)) {
                    (Some(parent), _) if parent == from => true,
                    (_, Some(parent)) if parent == to => true,
                    (Some(a), Some(b)) => {
                        a == b
                            || self.vhost(a).map(|h| h.cross_domain_messages).unwrap_or(false)
                    }
                    (Some(parent), None) | (None, Some(parent)) => {
                        let other = if parent_of(to).is_some() { from } else { to };
                        if self.is_local_domain(other) {
                            self.vhost(parent)
                                .map(|h| h.cross_domain_messages)
                                .unwrap_or(false)
                        } else {
                            true
                        }
                    }
                    (None, None) => true,
                }
            }
        }
    }
}
