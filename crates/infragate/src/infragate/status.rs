use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::infragate::{
    conn::PacketConn,
    protocol::{
        self, Handshake, PING_PACKET_ID, Packet, ProtocolError, STATUS_REQUEST_PACKET_ID,
    },
};

pub const FALLBACK_VERSION_NAME: &str = "unknown";
pub const FALLBACK_MESSAGE: &str =
    "There is no proxy associated with this domain. Please check your configuration.";

/// JSON body of a status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    pub description: StatusDescription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: i32,
    pub online: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDescription {
    pub text: String,
}

/// Locally answered status (per-backend online/offline override).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerStatus {
    pub version_name: String,
    /// `0` echoes the protocol version the client announced.
    pub protocol_number: i32,
    pub max_players: i32,
    pub players_online: i32,
    pub player_sample: Vec<PlayerSample>,
    /// `data:image/png;base64,...`
    pub icon: Option<String>,
    pub motd: String,
}

impl ServerStatus {
    pub fn response(&self, client_protocol: i32) -> StatusResponse {
        let protocol = if self.protocol_number == 0 {
            client_protocol
        } else {
            self.protocol_number
        };
        StatusResponse {
            version: StatusVersion {
                name: self.version_name.clone(),
                protocol,
            },
            players: StatusPlayers {
                max: self.max_players,
                online: self.players_online,
                sample: self.player_sample.clone(),
            },
            description: StatusDescription {
                text: self.motd.clone(),
            },
            favicon: self.icon.clone(),
        }
    }

    pub fn to_packet(&self, client_protocol: i32) -> Packet {
        let json = serde_json::to_string(&self.response(client_protocol)).unwrap_or_default();
        protocol::status_response_packet(&json)
    }
}

/// Placeholder answered for status probes that match no backend. Serialized once.
pub fn fallback_response_packet() -> &'static Packet {
    static PACKET: OnceLock<Packet> = OnceLock::new();
    PACKET.get_or_init(|| {
        let resp = StatusResponse {
            version: StatusVersion {
                name: FALLBACK_VERSION_NAME.to_string(),
                protocol: 0,
            },
            players: StatusPlayers {
                max: 0,
                online: 0,
                sample: Vec::new(),
            },
            description: StatusDescription {
                text: FALLBACK_MESSAGE.to_string(),
            },
            favicon: None,
        };
        let json = serde_json::to_string(&resp).unwrap_or_default();
        protocol::status_response_packet(&json)
    })
}

/// Run the status exchange on `conn` with a prepared response.
///
/// `response` is built from the handshake once it has been consumed. A client that
/// hangs up instead of pinging is not an error.
pub async fn answer_status<S, F>(conn: &mut PacketConn<S>, response: F) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&Handshake) -> Packet,
{
    let hs = Handshake::decode(&conn.read_packet().await?)?;

    let req = conn.read_packet().await?;
    if req.id != STATUS_REQUEST_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacket {
            want: STATUS_REQUEST_PACKET_ID,
            got: req.id,
        });
    }
    conn.write_packet(&response(&hs)).await?;

    let ping = match conn.read_packet().await {
        Ok(pk) => pk,
        Err(ProtocolError::UnexpectedEof) => return Ok(()),
        Err(e) => return Err(e),
    };
    if ping.id != PING_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacket {
            want: PING_PACKET_ID,
            got: ping.id,
        });
    }
    conn.write_packet(&ping).await
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::infragate::protocol::{self, tests::handshake_bytes};

    /// Client side of a status exchange; returns the response JSON and the ping echo.
    pub(crate) async fn status_probe<S>(stream: &mut S, host: &str) -> (String, Packet)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&handshake_bytes(host, 25565, 763, 1))
            .await
            .unwrap();
        finish_status_probe(stream).await
    }

    /// Status request and ping for a client whose handshake is already sent.
    pub(crate) async fn finish_status_probe<S>(stream: &mut S) -> (String, Packet)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&Packet::new(0x00, Bytes::new()).encode())
            .await
            .unwrap();
        stream
            .write_all(&Packet::new(0x01, Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 42])).encode())
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let mut frames = Vec::new();
        while frames.len() < 2 {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "server closed early");
            buf.extend_from_slice(&tmp[..n]);
            while let Some((pk, used)) = protocol::decode_frame(&buf, 1 << 20).unwrap() {
                buf.drain(..used);
                frames.push(pk);
            }
        }
        let resp = frames.remove(0);
        let json_len = protocol::read_varint(&resp.data).unwrap().unwrap();
        let json = String::from_utf8(resp.data[json_len.1..].to_vec()).unwrap();
        (json, frames.remove(0))
    }

    #[test]
    fn fallback_is_cached_and_carries_placeholder() {
        let a = fallback_response_packet();
        let b = fallback_response_packet();
        assert!(std::ptr::eq(a, b));

        let (len, n) = protocol::read_varint(&a.data).unwrap().unwrap();
        let body: StatusResponse = serde_json::from_slice(&a.data[n..]).unwrap();
        assert_eq!(len as usize, a.data.len() - n);
        assert_eq!(body.version.name, "unknown");
        assert_eq!(body.version.protocol, 0);
        assert_eq!(body.players.max, 0);
        assert_eq!(body.players.online, 0);
        assert_eq!(body.description.text, FALLBACK_MESSAGE);
    }

    #[test]
    fn protocol_zero_echoes_client_version() {
        let s = ServerStatus {
            version_name: "Infragate".into(),
            motd: "hello".into(),
            max_players: 20,
            ..Default::default()
        };
        assert_eq!(s.response(763).version.protocol, 763);
        let s = ServerStatus {
            protocol_number: 47,
            ..s
        };
        assert_eq!(s.response(763).version.protocol, 47);
    }

    #[tokio::test]
    async fn answer_status_echoes_ping() {
        let (mut client, server) = tokio::io::duplex(8192);
        let task = tokio::spawn(async move {
            let mut conn = PacketConn::new(server);
            answer_status(&mut conn, |_| fallback_response_packet().clone()).await
        });

        let (json, pong) = status_probe(&mut client, "nowhere.test").await;
        assert!(json.contains(FALLBACK_MESSAGE));
        assert_eq!(pong.id, PING_PACKET_ID);
        assert_eq!(&pong.data[..], &[0, 0, 0, 0, 0, 0, 0, 42]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn answer_status_tolerates_missing_ping() {
        let (mut client, server) = tokio::io::duplex(8192);
        client
            .write_all(&handshake_bytes("a.test", 25565, 763, 1))
            .await
            .unwrap();
        client
            .write_all(&Packet::new(0x00, Bytes::new()).encode())
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut conn = PacketConn::new(server);
        answer_status(&mut conn, |hs| {
            ServerStatus::default().to_packet(hs.protocol_version)
        })
        .await
        .unwrap();
    }
}
