use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::infragate::{
    conn::PacketConn,
    error::GatewayError,
    protocol::{Handshake, normalize_host},
};

/// Identity of a route: normalized virtual host plus the listen address it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(host: &str, listen_addr: &str) -> Self {
        Self(format!("{}@{}", normalize_host(host), listen_addr.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of inspecting the first packet of a connection.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub handshake: Handshake,
    pub host: String,
    pub key: RoutingKey,
}

/// Peek the handshake (without consuming it) and derive the routing key.
pub async fn route<S>(conn: &mut PacketConn<S>, listen_addr: &str) -> Result<RouteRequest, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pk = conn.peek_packet().await?;
    let handshake = Handshake::decode(&pk)?;
    let host = handshake.routing_host();
    if host.is_empty() {
        return Err(GatewayError::Decode("handshake: empty server address".into()));
    }
    let key = RoutingKey::new(&host, listen_addr);
    Ok(RouteRequest {
        handshake,
        host,
        key,
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::infragate::protocol::{NextState, tests::handshake_bytes};

    #[test]
    fn key_is_lowercased_host_at_listen_addr() {
        let key = RoutingKey::new("Play.Example.COM", ":25565");
        assert_eq!(key.as_str(), "play.example.com@:25565");
        assert_eq!(key, RoutingKey::new("play.example.com.", ":25565"));
        assert_ne!(key, RoutingKey::new("play.example.com", ":25566"));
    }

    #[tokio::test]
    async fn route_peeks_without_consuming() {
        let (mut client, server) = tokio::io::duplex(1024);
        let hs = handshake_bytes("Lobby.Example.com\0FML\0", 25565, 763, 2);
        client.write_all(&hs).await.unwrap();

        let mut conn = PacketConn::new(server);
        let req = route(&mut conn, ":25565").await.unwrap();
        assert_eq!(req.host, "lobby.example.com");
        assert_eq!(req.key.as_str(), "lobby.example.com@:25565");
        assert_eq!(req.handshake.server_address, "Lobby.Example.com\0FML\0");
        assert_eq!(req.handshake.next_state, NextState::Login);
        assert_eq!(conn.buffered(), &hs[..]);
    }

    #[tokio::test]
    async fn route_rejects_non_handshake_and_empty_host() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0x02, 0x05, 0x00]).await.unwrap();
        let mut conn = PacketConn::new(server);
        assert!(matches!(
            route(&mut conn, ":25565").await,
            Err(GatewayError::Decode(_))
        ));

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(&handshake_bytes("###", 25565, 763, 1))
            .await
            .unwrap();
        let mut conn = PacketConn::new(server);
        assert!(matches!(
            route(&mut conn, ":25565").await,
            Err(GatewayError::Decode(_))
        ));
    }
}
