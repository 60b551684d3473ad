use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

pub const METRIC_HANDSHAKE_TOTAL: &str = "handshake_total";
pub const METRIC_ACTIVE_BACKENDS: &str = "active_backends";
pub const METRIC_CONNECTED_CLIENTS: &str = "connected_clients";
pub const METRIC_CONNECTIONS_TOTAL: &str = "connections_total";
pub const METRIC_ACTIVE_CONNECTIONS: &str = "active_connections";
pub const METRIC_BYTES_INGRESS: &str = "bytes_ingress_total";
pub const METRIC_BYTES_EGRESS: &str = "bytes_egress_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// One routed handshake, labelled by request kind (`status`/`login`) and host.
pub fn record_handshake(kind: &'static str, host: &str) {
    metrics::counter!(METRIC_HANDSHAKE_TOTAL, "type" => kind, "host" => host.to_string())
        .increment(1);
}

pub fn set_active_backends(n: usize) {
    metrics::gauge!(METRIC_ACTIVE_BACKENDS).set(n as f64);
}

pub fn record_bytes(ingress: u64, egress: u64) {
    metrics::counter!(METRIC_BYTES_INGRESS).increment(ingress);
    metrics::counter!(METRIC_BYTES_EGRESS).increment(egress);
}

/// Counts an accepted connection for as long as it lives.
pub struct ActiveConnGuard;

impl ActiveConnGuard {
    pub fn new() -> Self {
        metrics::counter!(METRIC_CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(METRIC_ACTIVE_CONNECTIONS).increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_CONNECTIONS).decrement(1.0);
    }
}

/// Tracks a player relayed to a backend in `connected_clients{host}`.
pub struct ConnectedClientGuard {
    host: String,
}

impl ConnectedClientGuard {
    pub fn new(host: &str) -> Self {
        metrics::gauge!(METRIC_CONNECTED_CLIENTS, "host" => host.to_string()).increment(1.0);
        Self {
            host: host.to_string(),
        }
    }
}

impl Drop for ConnectedClientGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_CONNECTED_CLIENTS, "host" => self.host.clone()).decrement(1.0);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub host: String,
    pub backend: String,
    pub upstream: String,
    pub username: Option<String>,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.sessions.iter().map(|s| s.value().clone()).collect();
        out.sort_by_key(|s| s.started_at_unix_ms);
        out
    }
}

/// Removes a session from the registry when the relay ends.
pub struct SessionGuard {
    sessions: SharedSessions,
    id: String,
}

impl SessionGuard {
    pub fn register(sessions: SharedSessions, info: SessionInfo) -> Self {
        let id = info.id.clone();
        sessions.add(info);
        Self { sessions, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    // Monotonic counter; increment indicates a reload request.
    pub seq: u64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
