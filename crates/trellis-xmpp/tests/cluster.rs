//! Two nodes serving the same domain over one in-memory backplane.
//!
//! Run with: `cargo test -p trellis-xmpp --test cluster`

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client_config, init_tracing, start_node, RawXmppClient, TestCerts, DEFAULT_TIMEOUT};
use trellis_xmpp::cluster::MemoryBackplane;

const DOMAIN: &str = "example.com";
const USERS: &[(&str, &str)] = &[("alice@example.com", "wonderland"), ("bob@example.com", "builder")];

#[tokio::test]
async fn test_stanza_routed_to_other_node() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let backplane = Arc::new(MemoryBackplane::new());

    let first = start_node(client_config(DOMAIN, &certs), USERS, &certs, Arc::clone(&backplane)).await;
    let second = start_node(client_config(DOMAIN, &certs), USERS, &certs, Arc::clone(&backplane)).await;
    assert_ne!(
        first.cluster().unwrap().id(),
        second.cluster().unwrap().id()
    );

    let (mut alice, _) = RawXmppClient::login(
        first.addresses().client.unwrap(),
        DOMAIN,
        certs.connector(),
        "alice",
        "wonderland",
        "laptop",
    )
    .await
    .unwrap();
    let (mut bob, _) = RawXmppClient::login(
        second.addresses().client.unwrap(),
        DOMAIN,
        certs.connector(),
        "bob",
        "builder",
        "phone",
    )
    .await
    .unwrap();
    assert_eq!(backplane.session_count(), 2);

    alice
        .send("<message xmlns='jabber:client' to='bob@example.com/phone' id='c1'><body>across nodes</body></message>")
        .await
        .unwrap();
    let received = bob.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("across nodes"));
    assert!(received.contains("alice@example.com/laptop"));

    bob.send("<message xmlns='jabber:client' to='alice@example.com/laptop' id='c2'><body>and back</body></message>")
        .await
        .unwrap();
    let received = alice.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(received.contains("and back"));

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_bare_jid_message_reaches_each_remote_resource_once() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let backplane = Arc::new(MemoryBackplane::new());

    let first = start_node(client_config(DOMAIN, &certs), USERS, &certs, Arc::clone(&backplane)).await;
    let second = start_node(client_config(DOMAIN, &certs), USERS, &certs, Arc::clone(&backplane)).await;

    let (mut alice, _) = RawXmppClient::login(
        first.addresses().client.unwrap(),
        DOMAIN,
        certs.connector(),
        "alice",
        "wonderland",
        "laptop",
    )
    .await
    .unwrap();

    let mut bobs = Vec::new();
    for resource in ["desk", "phone"] {
        let (mut bob, _) = RawXmppClient::login(
            second.addresses().client.unwrap(),
            DOMAIN,
            certs.connector(),
            "bob",
            "builder",
            resource,
        )
        .await
        .unwrap();
        bob.send("<presence xmlns='jabber:client'/>").await.unwrap();
        bobs.push((resource, bob));
    }
    // let both availability updates reach the first node
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backplane.session_count(), 3);

    alice
        .send("<message xmlns='jabber:client' to='bob@example.com' id='b1'><body>to every resource</body></message>")
        .await
        .unwrap();
    for (resource, _) in &bobs {
        alice
            .send(&format!(
                "<message xmlns='jabber:client' to='bob@example.com/{resource}' id='m-{resource}'><body>marker</body></message>"
            ))
            .await
            .unwrap();
    }

    for (resource, bob) in &mut bobs {
        let received = bob.read_until("marker", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(
            received.matches("to every resource").count(),
            1,
            "{resource} got: {received}"
        );
    }

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_resource_limit_spans_nodes() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let backplane = Arc::new(MemoryBackplane::new());

    let mut limited = client_config(DOMAIN, &certs);
    limited.hosts = vec![trellis_xmpp::config::HostConfig::new(DOMAIN).with_max_resources(1)];
    let first = start_node(limited.clone(), USERS, &certs, Arc::clone(&backplane)).await;
    let second = start_node(limited, USERS, &certs, Arc::clone(&backplane)).await;

    let (_laptop, _) = RawXmppClient::login(
        first.addresses().client.unwrap(),
        DOMAIN,
        certs.connector(),
        "alice",
        "wonderland",
        "laptop",
    )
    .await
    .unwrap();

    let mut phone = RawXmppClient::connect(second.addresses().client.unwrap())
        .await
        .unwrap();
    let outcome = phone
        .authenticate(DOMAIN, certs.connector(), "alice", "wonderland")
        .await
        .unwrap();
    assert!(outcome.contains("<success"));
    phone.open_stream(DOMAIN).await.unwrap();
    let reply = phone.bind("phone").await.unwrap();
    assert!(reply.contains("resource-constraint"));

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_departed_node_sessions_removed() {
    init_tracing();
    let certs = TestCerts::generate(&[DOMAIN]);
    let backplane = Arc::new(MemoryBackplane::new());

    let first = start_node(client_config(DOMAIN, &certs), USERS, &certs, Arc::clone(&backplane)).await;
    let (_alice, _) = RawXmppClient::login(
        first.addresses().client.unwrap(),
        DOMAIN,
        certs.connector(),
        "alice",
        "wonderland",
        "laptop",
    )
    .await
    .unwrap();
    assert_eq!(backplane.session_count(), 1);

    first.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backplane.session_count(), 0);
}
