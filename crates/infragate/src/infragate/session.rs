use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpSocket, TcpStream},
    time,
};

use crate::infragate::{
    backend::Backend,
    conn::PacketConn,
    error::GatewayError,
    events::{Event, SharedEventSink},
    protocol::{self, DEFAULT_MAX_PACKET_BYTES, Handshake},
    proxy_protocol,
    router::RouteRequest,
    status::{self, ServerStatus},
    telemetry::{self, ConnectedClientGuard, SessionGuard, SessionInfo, SharedSessions},
};

/// How long to wait for a login start packet when only a disconnect is left to send.
const LOGIN_START_WAIT: Duration = Duration::from_secs(2);

pub const USERNAME_PLACEHOLDER: &str = "{{username}}";

/// What the gateway knows about a routed client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client address, taken from a proxy-protocol header or real-IP handshake when present.
    pub addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub listen_addr: Arc<str>,
    pub request: RouteRequest,
}

/// Takes over a routed connection. The handshake is still unconsumed in `conn`.
#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn serve(
        &self,
        conn: PacketConn<TcpStream>,
        client: ClientInfo,
        backend: Arc<Backend>,
    ) -> Result<(), GatewayError>;
}

pub type SharedBackendSession = Arc<dyn BackendSession>;

/// Relays to the backend over TCP.
pub struct TcpBackendSession {
    sessions: SharedSessions,
    events: SharedEventSink,
}

impl TcpBackendSession {
    pub fn new(sessions: SharedSessions, events: SharedEventSink) -> Self {
        Self { sessions, events }
    }

    async fn dial_failed(
        &self,
        mut conn: PacketConn<TcpStream>,
        client: &ClientInfo,
        backend: &Backend,
        err: io::Error,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            client = %client.addr,
            backend = %backend.id,
            upstream = %backend.address,
            err = %err,
            "session: backend unreachable"
        );
        let hs = &client.request.handshake;
        if hs.next_state.is_status() {
            if let Some(offline) = &backend.offline_status {
                reply_status(&mut conn, offline).await?;
            }
        } else if let Some(msg) = &backend.disconnect_message {
            conn.read_packet().await?;
            let username = match time::timeout(LOGIN_START_WAIT, conn.read_packet()).await {
                Ok(Ok(pk)) => protocol::login_start_name(&pk).unwrap_or_default(),
                _ => String::new(),
            };
            let reason = msg.replace(USERNAME_PLACEHOLDER, &username);
            conn.write_packet(&protocol::login_disconnect_packet(&reason))
                .await?;
        }
        Err(GatewayError::Transport(err))
    }
}

#[async_trait]
impl BackendSession for TcpBackendSession {
    async fn serve(
        &self,
        mut conn: PacketConn<TcpStream>,
        client: ClientInfo,
        backend: Arc<Backend>,
    ) -> Result<(), GatewayError> {
        let is_login = client.request.handshake.next_state.is_login();
        if !is_login && let Some(online) = &backend.online_status {
            reply_status(&mut conn, online).await?;
            return Ok(());
        }

        let mut upstream = match dial(&backend).await {
            Ok(s) => s,
            Err(err) => return self.dial_failed(conn, &client, &backend, err).await,
        };

        if backend.send_proxy_protocol {
            upstream
                .write_all(&proxy_protocol::encode_v2(client.addr, client.local_addr))
                .await?;
        }
        if backend.send_real_ip {
            // Replace the peeked handshake frame with the rewritten one.
            conn.read_packet().await?;
            let mut hs = client.request.handshake.clone();
            hs.upgrade_to_real_ip(client.addr, unix_secs());
            upstream.write_all(&hs.to_packet().encode()).await?;
        }

        let (mut stream, pending) = conn.into_parts();
        let username = if is_login {
            buffered_login_name(&pending, !backend.send_real_ip)
        } else {
            None
        };
        upstream.write_all(&pending).await?;

        let _accounting = is_login.then(|| {
            LoginAccounting::start(
                self.sessions.clone(),
                self.events.clone(),
                &client,
                &backend,
                username,
            )
        });

        tracing::debug!(
            client = %client.addr,
            routing_key = %client.request.key,
            backend = %backend.id,
            upstream = %backend.address,
            "session: relaying"
        );
        let (ingress, egress) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        telemetry::record_bytes(ingress + pending.len() as u64, egress);
        let _ = upstream.shutdown().await;
        Ok(())
    }
}

/// Registry entry, `connected_clients` gauge and join/leave events for one relayed login.
struct LoginAccounting {
    _client: ConnectedClientGuard,
    _session: SessionGuard,
    events: SharedEventSink,
    leave: Option<Event>,
}

impl LoginAccounting {
    fn start(
        sessions: SharedSessions,
        events: SharedEventSink,
        client: &ClientInfo,
        backend: &Backend,
        username: Option<String>,
    ) -> Self {
        let host = client.request.host.clone();
        let routing_key = client.request.key.to_string();
        let session = SessionGuard::register(
            sessions,
            SessionInfo {
                id: telemetry::new_session_id(),
                client: client.addr.to_string(),
                host: host.clone(),
                backend: backend.id.clone(),
                upstream: backend.address.clone(),
                username: username.clone(),
                started_at_unix_ms: telemetry::now_unix_ms(),
            },
        );
        tracing::info!(
            client = %client.addr,
            username = username.as_deref().unwrap_or(""),
            routing_key = %routing_key,
            backend = %backend.id,
            "session: player joined"
        );
        events.emit(Event::PlayerJoin {
            client: client.addr.to_string(),
            username: username.clone(),
            routing_key: routing_key.clone(),
            backend: backend.id.clone(),
        });
        Self {
            _client: ConnectedClientGuard::new(&host),
            _session: session,
            events,
            leave: Some(Event::PlayerLeave {
                client: client.addr.to_string(),
                username,
                routing_key,
                backend: backend.id.clone(),
            }),
        }
    }
}

impl Drop for LoginAccounting {
    fn drop(&mut self) {
        if let Some(ev) = self.leave.take() {
            self.events.emit(ev);
        }
    }
}

async fn reply_status(
    conn: &mut PacketConn<TcpStream>,
    status: &ServerStatus,
) -> Result<(), GatewayError> {
    status::answer_status(conn, |hs: &Handshake| status.to_packet(hs.protocol_version)).await?;
    Ok(())
}

/// Player name from a login start already sitting in `buf`, if any.
/// `skip_handshake` is set when `buf` still begins with the handshake frame.
fn buffered_login_name(buf: &[u8], skip_handshake: bool) -> Option<String> {
    let mut rest = buf;
    if skip_handshake {
        let (_, n) = protocol::decode_frame(rest, DEFAULT_MAX_PACKET_BYTES).ok()??;
        rest = &rest[n..];
    }
    let (pk, _) = protocol::decode_frame(rest, DEFAULT_MAX_PACKET_BYTES).ok()??;
    protocol::login_start_name(&pk).ok()
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Connect to `backend.address`, binding `proxy_bind` when set, within `dial_timeout`.
pub async fn dial(backend: &Backend) -> io::Result<TcpStream> {
    let connect = async {
        let mut last_err = None;
        for addr in tokio::net::lookup_host(backend.address.as_str()).await? {
            if let Some(ip) = backend.proxy_bind
                && ip.is_ipv4() != addr.is_ipv4()
            {
                continue;
            }
            let sock = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(ip) = backend.proxy_bind {
                sock.bind(SocketAddr::new(ip, 0))?;
            }
            match sock.connect(addr).await {
                Ok(s) => {
                    let _ = s.set_nodelay(true);
                    return Ok(s);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {}", backend.address),
            )
        }))
    };

    if backend.dial_timeout.is_zero() {
        return connect.await;
    }
    time::timeout(backend.dial_timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timeout"))?
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::{BufMut, BytesMut};
    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;
    use crate::infragate::{
        events::EventSink,
        protocol::{Packet, tests::handshake_bytes},
        router,
        status::tests::finish_status_probe,
        telemetry::SessionRegistry,
    };

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    impl EventSink for Collect {
        fn emit(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn login_start(name: &str) -> Vec<u8> {
        let mut data = BytesMut::new();
        protocol::put_varint(&mut data, name.len() as i32);
        data.put_slice(name.as_bytes());
        Packet::new(protocol::LOGIN_START_PACKET_ID, data.freeze())
            .encode()
            .to_vec()
    }

    /// Loopback client plus the routed gateway side, as the gateway hands it over.
    async fn routed_pair(first_bytes: &[u8]) -> (TcpStream, PacketConn<TcpStream>, ClientInfo) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = ln.accept().await.unwrap();
        client.write_all(first_bytes).await.unwrap();

        let mut conn = PacketConn::new(server);
        let request = router::route(&mut conn, ":25565").await.unwrap();
        let info = ClientInfo {
            addr: peer,
            local_addr: addr,
            listen_addr: Arc::from(":25565"),
            request,
        };
        (client, conn, info)
    }

    fn session() -> (TcpBackendSession, SharedSessions, Arc<Collect>) {
        let sessions: SharedSessions = Arc::new(SessionRegistry::new());
        let events = Arc::new(Collect::default());
        (
            TcpBackendSession::new(sessions.clone(), events.clone()),
            sessions,
            events,
        )
    }

    /// An address nothing listens on.
    async fn closed_port() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn online_status_is_answered_without_dialing() {
        let mut backend = Backend::new("lobby", ["lobby.test"], ":25565", closed_port().await);
        backend.online_status = Some(ServerStatus {
            version_name: "Lobby".into(),
            motd: "welcome".into(),
            max_players: 100,
            ..Default::default()
        });
        let (s, _, _) = session();

        let (mut client, conn, info) =
            routed_pair(&handshake_bytes("lobby.test", 25565, 763, 1)).await;
        let task = tokio::spawn(async move { s.serve(conn, info, Arc::new(backend)).await });
        let (json, pong) = finish_status_probe(&mut client).await;
        assert!(json.contains("welcome"));
        assert!(json.contains(r#""protocol":763"#));
        assert_eq!(pong.id, protocol::PING_PACKET_ID);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn offline_status_answers_when_dial_fails() {
        let mut backend = Backend::new("lobby", ["lobby.test"], ":25565", closed_port().await);
        backend.offline_status = Some(ServerStatus {
            motd: "sleeping".into(),
            ..Default::default()
        });
        let (s, _, _) = session();

        let (mut client, conn, info) =
            routed_pair(&handshake_bytes("lobby.test", 25565, 763, 1)).await;
        let task = tokio::spawn(async move { s.serve(conn, info, Arc::new(backend)).await });
        let (json, _) = finish_status_probe(&mut client).await;
        assert!(json.contains("sleeping"));
        assert!(matches!(
            task.await.unwrap(),
            Err(GatewayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn dial_failure_disconnects_login_with_username() {
        let mut backend = Backend::new("lobby", ["lobby.test"], ":25565", closed_port().await);
        backend.disconnect_message = Some("Sorry {{username}}, lobby is down".into());
        let (s, sessions, events) = session();

        let mut first = handshake_bytes("lobby.test", 25565, 763, 2);
        first.extend_from_slice(&login_start("Alex"));
        let (mut client, conn, info) = routed_pair(&first).await;
        let res = s.serve(conn, info, Arc::new(backend)).await;
        assert!(matches!(res, Err(GatewayError::Transport(_))));

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let (pk, _) = protocol::decode_frame(&buf, 1 << 16).unwrap().unwrap();
        assert_eq!(pk.id, protocol::LOGIN_DISCONNECT_PACKET_ID);
        let text = String::from_utf8_lossy(&pk.data);
        assert!(text.contains("Sorry Alex, lobby is down"));

        assert_eq!(sessions.len(), 0);
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn relay_forwards_proxy_header_and_real_ip_handshake() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut backend = Backend::new(
            "lobby",
            ["lobby.test"],
            ":25565",
            upstream.local_addr().unwrap().to_string(),
        );
        backend.send_proxy_protocol = true;
        backend.send_real_ip = true;
        let (s, sessions, events) = session();

        let mut first = handshake_bytes("Lobby.test", 25565, 763, 2);
        first.extend_from_slice(&login_start("Steve"));
        let (mut client, conn, info) = routed_pair(&first).await;
        let client_addr = info.addr;
        let task = tokio::spawn(async move { s.serve(conn, info, Arc::new(backend)).await });

        let (mut up, _) = upstream.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let header = loop {
            up.read_buf(&mut buf).await.unwrap();
            if let Some((h, n)) = proxy_protocol::parse(&buf).unwrap() {
                let _ = buf.split_to(n);
                break h;
            }
        };
        assert_eq!(header.source, Some(client_addr));

        let (hs_pk, n) = loop {
            if let Some(frame) = protocol::decode_frame(&buf, 1 << 16).unwrap() {
                break frame;
            }
            up.read_buf(&mut buf).await.unwrap();
        };
        let _ = buf.split_to(n);
        let hs = Handshake::decode(&hs_pk).unwrap();
        assert_eq!(hs.real_ip(), Some(client_addr));
        assert_eq!(hs.routing_host(), "lobby.test");

        let (login, _) = loop {
            if let Some(frame) = protocol::decode_frame(&buf, 1 << 16).unwrap() {
                break frame;
            }
            up.read_buf(&mut buf).await.unwrap();
        };
        assert_eq!(protocol::login_start_name(&login).unwrap(), "Steve");

        // Relay in both directions, then hang up from the backend.
        up.write_all(b"pong").await.unwrap();
        let mut got = [0u8; 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.snapshot()[0].username.as_deref(), Some("Steve"));

        drop(up);
        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(sessions.len(), 0);

        let seen: Vec<&'static str> = events.0.lock().unwrap().iter().map(|e| e.type_name()).collect();
        assert_eq!(seen, vec!["player_join", "player_leave"]);
    }

    #[test]
    fn login_name_is_read_from_buffered_bytes() {
        let mut buf = handshake_bytes("a.test", 25565, 763, 2);
        assert_eq!(buffered_login_name(&buf, true), None);
        buf.extend_from_slice(&login_start("Notch"));
        assert_eq!(buffered_login_name(&buf, true).as_deref(), Some("Notch"));
    }
}
