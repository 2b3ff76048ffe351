//! Server metrics.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application (trellis-server). Without one every instrument
//! is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::types::StreamKind;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("trellis-xmpp"))
}

// ============================================================================
// Counters
// ============================================================================

/// Counter for stanzas handed to a destination.
pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.routed")
        .with_description("Total stanzas routed, by destination")
        .with_unit("stanza")
        .build()
}

/// Counter for streams closed because they exceeded their rate limit.
pub fn rate_limit_violations() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.rate_limit.violations")
        .with_description("Streams closed for exceeding their stanza rate")
        .with_unit("stream")
        .build()
}

/// Counter for authentication attempts.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.auth.attempts")
        .with_description("Total authentication attempts")
        .with_unit("attempt")
        .build()
}

/// Counter for S2S connection attempts.
pub fn s2s_connection_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.connection.attempts")
        .with_description("Total outbound S2S connection attempts")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Gauges
// ============================================================================

/// Gauge for attached connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.connections.active")
        .with_description("Current number of attached connections")
        .with_unit("connection")
        .build()
}

/// Gauge for live cluster nodes, this one included.
pub fn cluster_nodes() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.cluster.nodes")
        .with_description("Current number of live cluster nodes")
        .with_unit("node")
        .build()
}

// ============================================================================
// Recording helpers
// ============================================================================

/// Record a stanza routed to `destination` (local, s2s, component, cluster, queued).
pub fn record_stanza_routed(destination: &str) {
    stanzas_routed().add(1, &[KeyValue::new("destination", destination.to_string())]);
}

/// Record a stream closed by its rate limiter.
pub fn record_rate_limit_violation(kind: StreamKind) {
    rate_limit_violations().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record an authentication attempt.
pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record an outbound S2S connection attempt.
pub fn record_s2s_connection_attempt() {
    s2s_connection_attempts().add(1, &[]);
}

/// Record the number of attached connections of one kind.
pub fn record_connection_count(count: i64, kind: StreamKind) {
    connections_active().record(count, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record the number of live cluster nodes.
pub fn record_cluster_nodes(count: i64) {
    cluster_nodes().record(count, &[]);
}
