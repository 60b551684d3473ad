use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::{
    net::TcpStream,
    sync::{Mutex, watch},
    time,
};

pub use crate::infragate::backend::Backend;
use crate::infragate::{
    conn::PacketConn,
    error::GatewayError,
    events::{Event, SharedEventSink},
    listener::{self, Dispatch, ListenerHandle, ListenerState},
    protocol::{self, DEFAULT_MAX_HANDSHAKE_BYTES, DEFAULT_MAX_PACKET_BYTES},
    proxy_protocol,
    router::{self, RouteRequest, RoutingKey},
    routing::RoutingTable,
    session::{ClientInfo, SharedBackendSession},
    status,
    telemetry::{self, ActiveConnGuard},
};

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(5000);

/// How a listen address treats client-supplied address metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressOptions {
    /// Require a PROXY protocol header before the handshake.
    pub receive_proxy_protocol: bool,
    /// Trust a real-IP client address embedded in the handshake.
    pub receive_real_ip: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOptions {
    pub defaults: IngressOptions,
    /// Per listen address overrides of `defaults`.
    pub listeners: HashMap<String, IngressOptions>,
    /// Bounds proxy-protocol parsing, the handshake peek and the placeholder status exchange.
    /// Zero disables the bound.
    pub client_timeout: Duration,
    pub max_handshake_bytes: usize,
    /// Sent as a login disconnect reason to clients whose host has no backend.
    pub unknown_host_disconnect: Option<String>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            defaults: IngressOptions::default(),
            listeners: HashMap::new(),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            max_handshake_bytes: DEFAULT_MAX_HANDSHAKE_BYTES,
            unknown_host_disconnect: None,
        }
    }
}

impl GatewayOptions {
    pub fn ingress_for(&self, listen_addr: &str) -> &IngressOptions {
        self.listeners.get(listen_addr).unwrap_or(&self.defaults)
    }
}

/// Listener status as reported to operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ListenerInfo {
    pub listen_addr: String,
    pub local_addr: String,
    pub state: &'static str,
}

/// Routing registry plus the listeners it keeps open.
///
/// Lookups go straight to the sharded routing table. Register, deregister,
/// replace and close are serialized by `writer`, so the listener set only
/// changes together with the backends that reference it.
pub struct Gateway {
    table: RoutingTable,
    listeners: DashMap<String, ListenerHandle>,
    writer: Mutex<()>,
    closed: AtomicBool,
    running: Arc<watch::Sender<usize>>,
    opts: ArcSwap<GatewayOptions>,
    session: SharedBackendSession,
    events: SharedEventSink,
    me: Weak<Gateway>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("backends", &self.table.len())
            .field("listeners", &self.listeners.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        opts: GatewayOptions,
        session: SharedBackendSession,
        events: SharedEventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            table: RoutingTable::new(),
            listeners: DashMap::new(),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
            running: Arc::new(watch::channel(0).0),
            opts: ArcSwap::from_pointee(opts),
            session,
            events,
            me: me.clone(),
        })
    }

    /// Register the initial backend set. Any failure closes the gateway.
    pub async fn start(&self, backends: Vec<Backend>) -> Result<(), GatewayError> {
        if backends.is_empty() {
            return Err(GatewayError::InvalidBackend("no backends configured".into()));
        }
        for b in backends {
            if let Err(err) = self.register_backend(b).await {
                self.close().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Register `backends` and block until every listener has stopped.
    pub async fn listen_and_serve(&self, backends: Vec<Backend>) -> Result<(), GatewayError> {
        self.start(backends).await?;
        self.wait().await;
        Ok(())
    }

    pub async fn register_backend(&self, backend: Backend) -> Result<(), GatewayError> {
        backend.validate()?;
        let _w = self.writer.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        let backend = Arc::new(backend);
        self.ensure_listener(&backend.listen_addr).await?;
        let previous = self.table.remove(&backend.id);
        self.insert(backend.clone());
        if let Some(prev) = previous {
            self.close_listener_if_unused(&prev.listen_addr).await;
        }
        telemetry::set_active_backends(self.table.len());
        tracing::info!(
            backend = %backend.id,
            listen_addr = %backend.listen_addr,
            domains = ?backend.domains,
            upstream = %backend.address,
            "gateway: backend registered"
        );
        Ok(())
    }

    /// Remove `id`; unknown ids are ignored. Returns once an orphaned listener has
    /// released its socket.
    pub async fn deregister_backend(&self, id: &str) {
        let _w = self.writer.lock().await;
        let Some(prev) = self.table.remove(id) else {
            return;
        };
        self.close_listener_if_unused(&prev.listen_addr).await;
        telemetry::set_active_backends(self.table.len());
        tracing::info!(backend = %id, listen_addr = %prev.listen_addr, "gateway: backend deregistered");
    }

    /// Swap `old_id` for `backend` in one writer critical section. Listeners still
    /// referenced afterwards are left running.
    pub async fn replace_backend(&self, old_id: &str, backend: Backend) -> Result<(), GatewayError> {
        backend.validate()?;
        let _w = self.writer.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        let backend = Arc::new(backend);
        self.ensure_listener(&backend.listen_addr).await?;

        let mut dropped = Vec::new();
        dropped.extend(self.table.remove(old_id));
        if backend.id != old_id {
            dropped.extend(self.table.remove(&backend.id));
        }
        self.insert(backend.clone());
        for prev in dropped {
            self.close_listener_if_unused(&prev.listen_addr).await;
        }
        telemetry::set_active_backends(self.table.len());
        tracing::info!(
            old = %old_id,
            backend = %backend.id,
            listen_addr = %backend.listen_addr,
            domains = ?backend.domains,
            "gateway: backend replaced"
        );
        Ok(())
    }

    pub fn lookup(&self, key: &RoutingKey) -> Option<Arc<Backend>> {
        self.table.lookup(key)
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn options(&self) -> Arc<GatewayOptions> {
        self.opts.load_full()
    }

    /// Applies to connections accepted from now on.
    pub fn update_options(&self, opts: GatewayOptions) {
        self.opts.store(Arc::new(opts));
    }

    /// Stop every listener. Idempotent; later registrations fail with `Closed`.
    pub async fn close(&self) {
        let _w = self.writer.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let addrs: Vec<String> = self.listeners.iter().map(|l| l.key().clone()).collect();
        for addr in addrs {
            if let Some((_, h)) = self.listeners.remove(&addr) {
                h.close().await;
            }
        }
        tracing::info!("gateway: closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once no accept loop is running.
    pub async fn wait(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn listener_local_addr(&self, listen_addr: &str) -> Option<SocketAddr> {
        self.listeners.get(listen_addr).map(|l| l.local_addr())
    }

    pub fn listener_state(&self, listen_addr: &str) -> Option<watch::Receiver<ListenerState>> {
        self.listeners.get(listen_addr).map(|l| l.subscribe_state())
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let mut out: Vec<ListenerInfo> = self
            .listeners
            .iter()
            .map(|l| ListenerInfo {
                listen_addr: l.listen_addr().to_string(),
                local_addr: l.local_addr().to_string(),
                state: l.state().as_str(),
            })
            .collect();
        out.sort_by(|a, b| a.listen_addr.cmp(&b.listen_addr));
        out
    }

    fn insert(&self, backend: Arc<Backend>) {
        for c in self.table.insert(backend) {
            tracing::warn!(
                routing_key = %c.key,
                previous = %c.previous,
                backend = %c.next,
                "gateway: routing key reassigned"
            );
            self.events.emit(Event::RoutingConflict {
                routing_key: c.key.to_string(),
                previous_backend: c.previous,
                backend: c.next,
            });
        }
    }

    // Caller holds `writer`.
    async fn ensure_listener(&self, listen_addr: &str) -> Result<(), GatewayError> {
        if self.listeners.contains_key(listen_addr) {
            return Ok(());
        }
        let dispatch: Weak<dyn Dispatch> = self.me.clone();
        let handle = listener::bind(listen_addr, dispatch, self.running.clone()).await?;
        self.listeners.insert(listen_addr.to_string(), handle);
        Ok(())
    }

    // Caller holds `writer`.
    async fn close_listener_if_unused(&self, listen_addr: &str) {
        if self.table.uses_listen_addr(listen_addr) {
            return;
        }
        if let Some((_, h)) = self.listeners.remove(listen_addr) {
            h.close().await;
        }
    }

    async fn serve_conn(&self, stream: TcpStream, peer: SocketAddr, listen_addr: Arc<str>) {
        let _active = ActiveConnGuard::new();
        let opts = self.opts.load_full();
        let routed = match self.accept_prelude(stream, peer, &listen_addr, &opts).await {
            Ok(r) => r,
            Err(err) => return self.report(&err, peer, &listen_addr, None),
        };
        let key = routed.request.key.clone();
        if let Err(err) = self.forward(routed, listen_addr.clone(), &opts).await {
            self.report(&err, peer, &listen_addr, Some(&key));
        }
    }

    /// Proxy header, handshake peek and real-IP ingress, bounded by the client timeout.
    async fn accept_prelude(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listen_addr: &str,
        opts: &GatewayOptions,
    ) -> Result<Routed, GatewayError> {
        let local_addr = stream.local_addr()?;
        let _ = stream.set_nodelay(true);
        let ingress = opts.ingress_for(listen_addr);
        let mut conn = PacketConn::with_max_packet_bytes(stream, opts.max_handshake_bytes);

        let prelude = async {
            let mut addr = peer;
            if ingress.receive_proxy_protocol {
                let header = proxy_protocol::read_header(&mut conn).await?;
                if let Some(src) = header.source {
                    addr = src;
                }
            }
            let request = router::route(&mut conn, listen_addr).await?;
            Ok::<_, GatewayError>((addr, request))
        };
        let (mut addr, request) = bounded(opts.client_timeout, prelude).await?;

        if ingress.receive_real_ip
            && let Some(real) = request.handshake.real_ip()
        {
            addr = real;
        }
        conn.set_max_packet_bytes(DEFAULT_MAX_PACKET_BYTES);
        Ok(Routed {
            conn,
            addr,
            local_addr,
            request,
        })
    }

    async fn forward(
        &self,
        routed: Routed,
        listen_addr: Arc<str>,
        opts: &GatewayOptions,
    ) -> Result<(), GatewayError> {
        let Routed {
            conn,
            addr,
            local_addr,
            request,
        } = routed;
        telemetry::record_handshake(request.handshake.next_state.label(), &request.host);

        let Some(backend) = self.lookup(&request.key) else {
            return self.handle_miss(conn, addr, request, opts).await;
        };

        let client = ClientInfo {
            addr,
            local_addr,
            listen_addr,
            request,
        };
        self.session.serve(conn, client, backend).await
    }

    async fn handle_miss(
        &self,
        mut conn: PacketConn<TcpStream>,
        client: SocketAddr,
        request: RouteRequest,
        opts: &GatewayOptions,
    ) -> Result<(), GatewayError> {
        if request.handshake.next_state.is_status() {
            tracing::debug!(
                client = %client,
                routing_key = %request.key,
                "gateway: no backend, answering placeholder status"
            );
            let exchange = async {
                status::answer_status(&mut conn, |_| status::fallback_response_packet().clone())
                    .await?;
                Ok::<_, GatewayError>(())
            };
            return bounded(opts.client_timeout, exchange).await;
        }

        if let Some(reason) = &opts.unknown_host_disconnect {
            conn.read_packet().await?;
            conn.write_packet(&protocol::login_disconnect_packet(reason))
                .await?;
        }
        Err(GatewayError::RoutingMiss(request.key.to_string()))
    }

    fn report(
        &self,
        err: &GatewayError,
        client: SocketAddr,
        listen_addr: &str,
        routing_key: Option<&RoutingKey>,
    ) {
        match err {
            GatewayError::RoutingMiss(key) => {
                tracing::info!(client = %client, routing_key = %key, "gateway: no backend for routing key");
            }
            GatewayError::Decode(_) | GatewayError::Transport(_) => {
                tracing::debug!(client = %client, listen_addr = %listen_addr, routing_key = ?routing_key.map(RoutingKey::as_str), err = %err, "gateway: connection failed");
            }
            _ => {
                tracing::warn!(client = %client, listen_addr = %listen_addr, routing_key = ?routing_key.map(RoutingKey::as_str), err = %err, "gateway: connection failed");
            }
        }
        self.events.emit(Event::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            routing_key: routing_key.map(|k| k.to_string()),
        });
    }
}

impl Dispatch for Gateway {
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, listen_addr: Arc<str>) {
        let Some(gw) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            gw.serve_conn(stream, peer, listen_addr).await;
        });
    }
}

/// A connection whose handshake has been peeked and routed.
struct Routed {
    conn: PacketConn<TcpStream>,
    addr: SocketAddr,
    local_addr: SocketAddr,
    request: RouteRequest,
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    if limit.is_zero() {
        return fut.await;
    }
    time::timeout(limit, fut).await.map_err(|_| {
        GatewayError::Transport(io::Error::new(io::ErrorKind::TimedOut, "client timeout"))
    })?
}
