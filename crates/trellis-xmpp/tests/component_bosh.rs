//! External components and BOSH sessions against a running server.
//!
//! Run with: `cargo test -p trellis-xmpp --test component_bosh`

mod common;

use std::net::SocketAddr;

use common::{client_config, init_tracing, start, RawXmppClient, TestCerts, DEFAULT_TIMEOUT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use trellis_xmpp::config::{HostConfig, HttpConfig, ListenerConfig};
use trellis_xmpp::state::component::handshake_digest;
use trellis_xmpp::Config;

const DOMAIN: &str = "example.com";
const COMPONENT: &str = "chat.example.com";
const USERS: &[(&str, &str)] = &[("alice@example.com", "wonderland")];

fn attribute(xml: &str, name: &str) -> Option<String> {
    let start = xml.find(&format!("{}='", name))? + name.len() + 2;
    let end = xml[start..].find('\'')? + start;
    Some(xml[start..end].to_string())
}

async fn connect_component(addr: SocketAddr, secret: &str) -> (RawXmppClient, String) {
    let mut component = RawXmppClient::connect(addr).await.unwrap();
    component
        .send(&format!(
            "<stream:stream xmlns='jabber:component:accept' xmlns:stream='http://etherx.jabber.org/streams' to='{}'>",
            COMPONENT
        ))
        .await
        .unwrap();
    let header = component.read_until(">", DEFAULT_TIMEOUT).await.unwrap();
    let header = if header.starts_with("<?xml") {
        component.read_until(">", DEFAULT_TIMEOUT).await.unwrap()
    } else {
        header
    };
    assert!(header.contains("jabber:component:accept"));
    let id = attribute(&header, "id").expect("stream id");

    component
        .send(&format!("<handshake>{}</handshake>", handshake_digest(&id, secret)))
        .await
        .unwrap();
    let reply = component.read_until(">", DEFAULT_TIMEOUT).await.unwrap();
    (component, reply)
}

#[tokio::test]
async fn test_component_exchanges_stanzas_with_clients() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let config = Config {
        hosts: vec![HostConfig::new(DOMAIN).with_component(COMPONENT, "s3cret")],
        component: Some(ListenerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
        }),
        ..client_config(DOMAIN, &certs)
    };
    let server = start(config, USERS, &certs).await;

    let (mut component, reply) =
        connect_component(server.addresses().component.unwrap(), "s3cret").await;
    assert!(reply.contains("<handshake"));

    let (mut alice, _) = RawXmppClient::login(
        server.addresses().client.unwrap(),
        DOMAIN,
        certs.connector(),
        "alice",
        "wonderland",
        "laptop",
    )
    .await
    .unwrap();

    alice
        .send("<message xmlns='jabber:client' to='room@chat.example.com' id='r1'><body>join</body></message>")
        .await
        .unwrap();
    let received = component.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("jabber:component:accept"));
    assert!(received.contains("alice@example.com/laptop"));

    component
        .send("<message xmlns='jabber:component:accept' from='room@chat.example.com' to='alice@example.com/laptop' id='r2'><body>welcome</body></message>")
        .await
        .unwrap();
    let received = alice.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("welcome"));
    assert!(received.contains("room@chat.example.com"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_component_wrong_secret() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let config = Config {
        hosts: vec![HostConfig::new(DOMAIN).with_component(COMPONENT, "s3cret")],
        client: None,
        component: Some(ListenerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
        }),
        certs_dir: certs.path().to_path_buf(),
        ..Default::default()
    };
    let server = start(config, USERS, &certs).await;

    let (mut component, reply) =
        connect_component(server.addresses().component.unwrap(), "guess").await;
    let rest = component
        .read_until("</stream:stream>", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert!(format!("{}{}", reply, rest).contains("not-authorized"));

    server.shutdown().await;
}

/// One HTTP/1.1 POST; returns the status code and body.
async fn post(addr: SocketAddr, path: &str, body: &str) -> (u16, String) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/xml; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(DEFAULT_TIMEOUT * 2, socket.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response).to_string();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_bosh_session_over_http() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let config = Config {
        hosts: vec![HostConfig::new(DOMAIN)],
        client: None,
        http: Some(HttpConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            path: "/http-bind".to_string(),
            max_wait: 2,
            inactivity: 30,
        }),
        certs_dir: certs.path().to_path_buf(),
        ..Default::default()
    };
    let server = start(config, USERS, &certs).await;
    let addr = server.addresses().http.unwrap();

    let (status, created) = post(
        addr,
        "/http-bind",
        "<body xmlns='http://jabber.org/protocol/httpbind' xmlns:xmpp='urn:xmpp:xbosh' rid='1000' to='example.com' wait='2' hold='1' xmpp:version='1.0'/>",
    )
    .await;
    assert_eq!(status, 200);
    assert!(created.contains("PLAIN"));
    let sid = attribute(&created, "sid").unwrap();

    let (_, auth) = post(
        addr,
        "/http-bind",
        &format!(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='{}' rid='1001'><auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth></body>",
            sid,
            common::encode_sasl_plain("alice", "wonderland")
        ),
    )
    .await;
    assert!(auth.contains("success"));

    let (_, restarted) = post(
        addr,
        "/http-bind",
        &format!(
            "<body xmlns='http://jabber.org/protocol/httpbind' xmlns:xmpp='urn:xmpp:xbosh' sid='{}' rid='1002' xmpp:restart='true'/>",
            sid
        ),
    )
    .await;
    assert!(restarted.contains("urn:ietf:params:xml:ns:xmpp-bind"));

    let (_, bound) = post(
        addr,
        "/http-bind",
        &format!(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='{}' rid='1003'><iq xmlns='jabber:client' type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>web</resource></bind></iq></body>",
            sid
        ),
    )
    .await;
    assert!(bound.contains("alice@example.com/web"));
    assert_eq!(server.router().size(), 1);

    let (status, missing) = post(
        addr,
        "/http-bind",
        "<body xmlns='http://jabber.org/protocol/httpbind' sid='unknown' rid='1'/>",
    )
    .await;
    assert_eq!(status, 404);
    assert!(missing.contains("item-not-found"));

    server.shutdown().await;
}
