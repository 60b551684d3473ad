use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};

use crate::infragate::{
    admin, config,
    events::{self, SharedEventSink, WebhookDispatcher},
    gateway::Gateway,
    logging, net,
    reload::{self, Reloader},
    session::TcpBackendSession,
    telemetry,
};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        admin_addr = %cfg.admin_addr,
        servers = cfg.servers.len(),
        webhooks = cfg.webhooks.len(),
        reload = cfg.reload.enabled,
        "infragate: starting"
    );

    // Shared state for admin endpoints.
    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let (webhooks, _webhook_task) =
        WebhookDispatcher::spawn(cfg.webhooks.clone(), events::DEFAULT_QUEUE_CAPACITY)?;
    let webhooks = Arc::new(webhooks);
    let sink: SharedEventSink = webhooks.clone();

    let session = Arc::new(TcpBackendSession::new(sessions.clone(), sink.clone()));
    let gateway = Gateway::new(cfg.gateway.clone(), session, sink);
    gateway
        .start(cfg.servers.clone())
        .await
        .context("gateway: start")?;

    let (reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Routing changes are applied by a single consumer so they never interleave.
    {
        let gateway = gateway.clone();
        tasks.spawn(async move {
            reload::command_loop(gateway, cmd_rx).await;
            Ok(())
        });
    }

    // Config reload loop (polling + admin-triggered). Owns the only command sender.
    {
        let reloader = Reloader::new(
            resolved.path.clone(),
            gateway.clone(),
            webhooks.clone(),
            cmd_tx,
            cfg.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            reloader.run(reload_rx, shutdown).await;
            Ok(())
        });
    }

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            gateway: gateway.clone(),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Err(err))) => failure = Some(err),
                Some(Err(join_err)) => failure = Some(join_err.into()),
                Some(Ok(Ok(()))) | None => {}
            }
        }
    }

    let _ = shutdown_tx.send(true);
    gateway.close().await;

    // Exit as soon as everything stops; the timeout only matters if something hangs.
    let drain = async {
        while tasks.join_next().await.is_some() {}
        gateway.wait().await;
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = ?SHUTDOWN_DRAIN_TIMEOUT, "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("infragate: stopped");
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
