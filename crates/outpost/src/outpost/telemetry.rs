use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::outpost::tunnel::protocol::Protocol;

/// Installs the `metrics` recorder and serves the Prometheus exposition format on `addr`.
///
/// The exporter runs on its own background runtime; the relay loop never touches it.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("metrics: install Prometheus exporter")
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

pub fn session_started() {
    metrics::counter!("outpost_sessions_total").increment(1);
}

pub fn frame_relayed(protocol: Protocol, payload_len: usize) {
    metrics::counter!("outpost_frames_total", "protocol" => protocol.as_str()).increment(1);
    metrics::counter!("outpost_bytes_relayed_total", "protocol" => protocol.as_str())
        .increment(payload_len as u64);
}

pub fn peer_accepted() {
    metrics::counter!("outpost_peers_accepted_total").increment(1);
}

pub fn bind_failed() {
    metrics::counter!("outpost_bind_failures_total").increment(1);
}

pub fn listener_opened() {
    metrics::gauge!("outpost_listeners").increment(1.0);
}

pub fn listener_closed() {
    metrics::gauge!("outpost_listeners").decrement(1.0);
}
