use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::infragate::{gateway::Gateway, telemetry};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub sessions: telemetry::SharedSessions,
    pub gateway: Arc<Gateway>,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<telemetry::ReloadSignal>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/backends", get(backends))
        .route("/listeners", get(listeners))
        .route("/reload", post(reload))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API on `addr` until `shutdown` turns true.
pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    closed: bool,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let closed = st.gateway.is_closed();
    let code = if closed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(HealthResponse { ok: !closed, closed }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

#[derive(Debug, Serialize)]
struct BackendView {
    id: String,
    domains: Vec<String>,
    listen_addr: String,
    address: String,
    routing_keys: Vec<String>,
}

async fn backends(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let out: Vec<BackendView> = st
        .gateway
        .table()
        .snapshot()
        .into_iter()
        .map(|(b, keys)| BackendView {
            id: b.id.clone(),
            domains: b.domains.clone(),
            listen_addr: b.listen_addr.clone(),
            address: b.address.clone(),
            routing_keys: keys.iter().map(|k| k.to_string()).collect(),
        })
        .collect();
    (StatusCode::OK, Json(out))
}

async fn listeners(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.gateway.listeners()))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut next = (*st.reload_tx.borrow()).clone();
    next.next();
    let seq = next.seq;

    // Nobody listening means reload is off; the request still succeeds.
    let _ = st.reload_tx.send(next);

    (StatusCode::OK, Json(ReloadResponse { seq }))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::net::TcpStream;

    use super::*;
    use crate::infragate::{
        backend::Backend,
        conn::PacketConn,
        error::GatewayError,
        events::NoopSink,
        gateway::GatewayOptions,
        listener::ListenerState,
        session::{BackendSession, ClientInfo},
        telemetry::{ReloadSignal, SessionRegistry},
    };

    struct Idle;

    #[async_trait]
    impl BackendSession for Idle {
        async fn serve(
            &self,
            _conn: PacketConn<TcpStream>,
            _client: ClientInfo,
            _backend: Arc<Backend>,
        ) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn admin_endpoints_report_gateway_state() {
        let gw = Gateway::new(GatewayOptions::default(), Arc::new(Idle), Arc::new(NoopSink));
        gw.register_backend(Backend::new(
            "lobby",
            &["Play.Example.com"],
            "127.0.0.1:0",
            "127.0.0.1:1",
        ))
        .await
        .unwrap();
        gw.listener_state("127.0.0.1:0")
            .unwrap()
            .wait_for(|s| *s == ListenerState::Accepting)
            .await
            .unwrap();

        let (reload_tx, mut reload_rx) = watch::channel(ReloadSignal::new());
        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            sessions: Arc::new(SessionRegistry::new()),
            gateway: gw.clone(),
            config_path: PathBuf::from("/tmp/infragate.toml"),
            reload_tx,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["ok"], true);

        let backends: serde_json::Value = client
            .get(format!("{base}/backends"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(backends[0]["id"], "lobby");
        assert_eq!(
            backends[0]["routing_keys"][0],
            "play.example.com@127.0.0.1:0"
        );

        let listeners: serde_json::Value = client
            .get(format!("{base}/listeners"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listeners[0]["state"], "accepting");

        let res = client.post(format!("{base}/reload")).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        reload_rx.changed().await.unwrap();
        assert_eq!(reload_rx.borrow().seq, 1);

        gw.close().await;
        let res = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }
}
