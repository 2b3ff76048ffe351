//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use jid::{BareJid, FullJid};
use minidom::Element;
use tokio::sync::mpsc;

use crate::certs::{CertStore, DirCertStore};
use crate::config::{Config, HostConfig, ServerConfig};
use crate::handler::DefaultHandler;
use crate::parser::{is_content_ns, ns, restamp, XmlEvent};
use crate::router::{NullConnector, Outbound, Router};
use crate::storage::{Deferred, MemoryStorage};
use crate::stream::{Services, Stream};
use crate::tls::TlsContext;
use crate::types::Flavor;

/// Services and the router they share.
pub struct TestEnv {
    pub services: Arc<Services>,
    pub router: Arc<Router>,
}

/// Self-signed certificates for a set of domains in a temporary directory.
pub struct TestCerts {
    _dir: tempfile::TempDir,
    pub store: Arc<DirCertStore>,
    pems: HashMap<String, String>,
}

impl TestCerts {
    pub fn new(domains: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut pems = HashMap::new();
        for domain in domains {
            let certified = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
            let pem = certified.cert.pem();
            std::fs::write(dir.path().join(format!("{}.crt", domain)), &pem).unwrap();
            std::fs::write(
                dir.path().join(format!("{}.key", domain)),
                certified.key_pair.serialize_pem(),
            )
            .unwrap();
            pems.insert(domain.to_string(), pem);
        }
        let store = Arc::new(DirCertStore::open(dir.path()).unwrap());
        Self {
            _dir: dir,
            store,
            pems,
        }
    }

    pub fn pem(&self, domain: &str) -> String {
        self.pems[domain].clone()
    }
}

pub fn test_config() -> Config {
    Config {
        hosts: vec![HostConfig::new("example.com").with_component("chat.example.com", "secret")],
        server: Some(ServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            hosts: vec!["remote.org".to_string()],
        }),
        ..Default::default()
    }
}

fn env(config: Config, storage: MemoryStorage, certs: Arc<dyn CertStore>, tls: Option<TlsContext>) -> TestEnv {
    let config = Arc::new(config);
    let router = Arc::new(Router::new(Arc::clone(&config), Arc::new(NullConnector)));
    let services = Arc::new(Services {
        config,
        storage: Arc::new(Deferred::new(storage)),
        certs,
        handler: Arc::new(DefaultHandler::new()),
        tls,
    });
    TestEnv { services, router }
}

/// A server for `example.com` with the given accounts and no TLS.
pub fn services_with_users(users: &[(&str, &str)]) -> TestEnv {
    let storage = MemoryStorage::new();
    for (jid, password) in users {
        storage.add_user(BareJid::new(jid).unwrap(), password).unwrap();
    }
    let dir = std::env::temp_dir().join("trellis-no-certs");
    let certs: Arc<dyn CertStore> = Arc::new(DirCertStore::open(dir.join("absent")).unwrap());
    env(test_config(), storage, certs, None)
}

fn stream(env: &TestEnv, flavor: Flavor) -> (Stream, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(64);
    let stream = Stream::new(
        flavor,
        Arc::clone(&env.services),
        Arc::clone(&env.router),
        tx,
        None,
    );
    (stream, rx)
}

pub fn client_stream(env: &TestEnv) -> (Stream, mpsc::Receiver<Outbound>) {
    stream(env, Flavor::Client)
}

pub fn component_stream(env: &TestEnv) -> (Stream, mpsc::Receiver<Outbound>) {
    stream(env, Flavor::Component)
}

pub fn http_stream(env: &TestEnv) -> (Stream, mpsc::Receiver<Outbound>) {
    stream(env, Flavor::Http)
}

/// A server stream of `flavor` whose services trust `certs`.
pub fn server_stream(certs: &TestCerts, flavor: Flavor) -> (Stream, mpsc::Receiver<Outbound>) {
    let store: Arc<dyn CertStore> = certs.store.clone();
    let tls = TlsContext::load(["example.com"], store.as_ref()).unwrap();
    let env = env(test_config(), MemoryStorage::new(), store, tls);
    stream(&env, flavor)
}

/// Mark a client stream authenticated and bound to `jid`, skipping
/// negotiation.
pub async fn bind(stream: &mut Stream, jid: &str) {
    let jid: FullJid = jid.parse().unwrap();
    let user = stream
        .storage()
        .find_user(&jid.to_bare())
        .await
        .unwrap()
        .unwrap();
    stream.session().set_user(user);
    stream.session().set_domain(jid.domain().as_str());
    stream.session().set_jid(jid);
    stream.attach();
}

/// A top-level element event as the parser would produce it.
pub fn stanza(raw: &str) -> XmlEvent {
    let element: Element = raw.parse().unwrap();
    let element_ns = element.ns();
    if is_content_ns(&element_ns) && element_ns != ns::JABBER_CLIENT {
        XmlEvent::Stanza(restamp(&element, &element_ns, ns::JABBER_CLIENT))
    } else {
        XmlEvent::Stanza(element)
    }
}
