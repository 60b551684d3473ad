use std::{io, net::SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound for a single frame once a connection has been routed.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 2 * 1024 * 1024;

/// Upper bound for the very first frame (the handshake).
pub const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
pub const PING_PACKET_ID: i32 = 0x01;
pub const LOGIN_START_PACKET_ID: i32 = 0x00;
pub const LOGIN_DISCONNECT_PACKET_ID: i32 = 0x00;

/// Appended by some modded clients to carry auxiliary data after the host.
pub const SEPARATOR_MODDED: &str = "###";
/// Forge marks its clients with a NUL-delimited suffix (`\0FML\0`).
pub const SEPARATOR_FORGE: &str = "\0";
/// Real-IP forwarding format: `host///client_ip:port///unix_ts`.
pub const SEPARATOR_REAL_IP: &str = "///";

const MAX_STRING_BYTES: usize = 32767 * 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol: varint too long")]
    VarIntTooLong,
    #[error("protocol: negative length {0}")]
    NegativeLength(i32),
    #[error("protocol: packet too large ({len} > {max})")]
    PacketTooLarge { len: usize, max: usize },
    #[error("protocol: unexpected eof")]
    UnexpectedEof,
    #[error("protocol: unexpected packet id {got:#04x} (want {want:#04x})")]
    UnexpectedPacket { want: i32, got: i32 },
    #[error("protocol: malformed packet: {0}")]
    Malformed(&'static str),
    #[error("protocol: invalid next state {0}")]
    InvalidNextState(i32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One decoded frame: packet id plus the remaining payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Bytes,
}

impl Packet {
    pub fn new(id: i32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Length-prefixed wire form.
    pub fn encode(&self) -> BytesMut {
        let body_len = varint_len(self.id) + self.data.len();
        let mut out = BytesMut::with_capacity(varint_len(body_len as i32) + body_len);
        put_varint(&mut out, body_len as i32);
        put_varint(&mut out, self.id);
        out.put_slice(&self.data);
        out
    }
}

/// Decode a VarInt from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the VarInt does.
pub fn read_varint(buf: &[u8]) -> Result<Option<(i32, usize)>, ProtocolError> {
    let mut result: i32 = 0;
    for (i, &b) in buf.iter().enumerate() {
        if i >= 5 {
            return Err(ProtocolError::VarIntTooLong);
        }
        result |= ((b & 0x7f) as i32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((result, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(ProtocolError::VarIntTooLong);
    }
    Ok(None)
}

pub fn put_varint(out: &mut BytesMut, v: i32) {
    let mut v = v as u32;
    loop {
        let mut b = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.put_u8(b);
        if v == 0 {
            break;
        }
    }
}

pub fn varint_len(v: i32) -> usize {
    let mut v = v as u32;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_string(out: &mut BytesMut, s: &str) {
    put_varint(out, s.len() as i32);
    out.put_slice(s.as_bytes());
}

/// Try to decode one complete frame from the start of `buf`.
///
/// Returns the packet and the number of bytes the frame occupies (prefix included),
/// or `Ok(None)` if more bytes are needed.
pub fn decode_frame(buf: &[u8], max_len: usize) -> Result<Option<(Packet, usize)>, ProtocolError> {
    let Some((len, len_n)) = read_varint(buf)? else {
        return Ok(None);
    };
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len));
    }
    let len = len as usize;
    if len > max_len {
        return Err(ProtocolError::PacketTooLarge { len, max: max_len });
    }
    let total = len_n + len;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[len_n..total];
    let (id, id_n) = read_varint(body)?.ok_or(ProtocolError::Malformed("missing packet id"))?;
    Ok(Some((
        Packet::new(id, Bytes::copy_from_slice(&body[id_n..])),
        total,
    )))
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<i32, ProtocolError> {
        let (v, n) = read_varint(&self.buf[self.pos..])?
            .ok_or(ProtocolError::Malformed("truncated varint"))?;
        self.pos += n;
        Ok(v)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.varint()?;
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if len > MAX_STRING_BYTES {
            return Err(ProtocolError::Malformed("string too long"));
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::Malformed("truncated string"))?;
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| ProtocolError::Malformed("string is not utf-8"))?
            .to_string();
        self.pos = end;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        if self.pos + 2 > self.buf.len() {
            return Err(ProtocolError::Malformed("truncated u16"));
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextState {
    Status,
    Login,
    /// 1.20.5+ transfer intent; routed like a login.
    Transfer,
}

impl NextState {
    pub fn from_i32(v: i32) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::Status),
            2 => Ok(Self::Login),
            3 => Ok(Self::Transfer),
            other => Err(ProtocolError::InvalidNextState(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
            Self::Transfer => 3,
        }
    }

    pub fn is_status(self) -> bool {
        matches!(self, Self::Status)
    }

    pub fn is_login(self) -> bool {
        matches!(self, Self::Login | Self::Transfer)
    }

    /// Metric label for the request kind.
    pub fn label(self) -> &'static str {
        if self.is_status() { "status" } else { "login" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    /// Server address exactly as the client sent it, separators included.
    pub server_address: String,
    pub port: u16,
    pub next_state: NextState,
}

impl Handshake {
    pub fn decode(pk: &Packet) -> Result<Self, ProtocolError> {
        if pk.id != HANDSHAKE_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacket {
                want: HANDSHAKE_PACKET_ID,
                got: pk.id,
            });
        }
        let mut r = FieldReader::new(&pk.data);
        let protocol_version = r.varint()?;
        let server_address = r.string()?;
        let port = r.u16()?;
        let next_state = NextState::from_i32(r.varint()?)?;
        Ok(Self {
            protocol_version,
            server_address,
            port,
            next_state,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut data = BytesMut::new();
        put_varint(&mut data, self.protocol_version);
        put_string(&mut data, &self.server_address);
        data.put_u16(self.port);
        put_varint(&mut data, self.next_state.as_i32());
        Packet::new(HANDSHAKE_PACKET_ID, data.freeze())
    }

    /// Host part used for routing (see [`normalize_host`]).
    pub fn routing_host(&self) -> String {
        normalize_host(&self.server_address)
    }

    /// Client address forwarded by an upstream proxy in real-IP format.
    pub fn real_ip(&self) -> Option<SocketAddr> {
        let mut parts = self.server_address.split(SEPARATOR_REAL_IP);
        parts.next()?;
        let addr = parts.next()?;
        addr.split(SEPARATOR_FORGE).next()?.trim().parse().ok()
    }

    /// Rewrite the server address into real-IP format, keeping any Forge marker.
    /// Addresses that already carry a forwarded client address are left untouched.
    pub fn upgrade_to_real_ip(&mut self, client: SocketAddr, unix_ts: u64) {
        if self.server_address.contains(SEPARATOR_REAL_IP) {
            return;
        }
        let mut parts = self.server_address.splitn(3, SEPARATOR_FORGE);
        let host = parts.next().unwrap_or_default();
        let mut out = format!("{host}{SEPARATOR_REAL_IP}{client}{SEPARATOR_REAL_IP}{unix_ts}");
        if let Some(forge) = parts.next() {
            out.push_str(SEPARATOR_FORGE);
            out.push_str(forge);
            out.push_str(SEPARATOR_FORGE);
        }
        self.server_address = out;
    }
}

/// Reduce a declared server address to the bare, lowercased virtual host.
///
/// Everything from the first reserved separator on is dropped, then surrounding
/// whitespace and dots (some proxies send `host.`) are trimmed.
pub fn normalize_host(addr: &str) -> String {
    let mut host = addr;
    for sep in [SEPARATOR_MODDED, SEPARATOR_FORGE, SEPARATOR_REAL_IP] {
        if let Some(i) = host.find(sep) {
            host = &host[..i];
        }
    }
    host.trim().trim_matches('.').to_ascii_lowercase()
}

pub fn status_response_packet(json: &str) -> Packet {
    let mut data = BytesMut::with_capacity(json.len() + 5);
    put_string(&mut data, json);
    Packet::new(STATUS_RESPONSE_PACKET_ID, data.freeze())
}

/// Login-phase disconnect carrying a plain-text chat component.
pub fn login_disconnect_packet(reason: &str) -> Packet {
    let json = serde_json::json!({ "text": reason }).to_string();
    let mut data = BytesMut::with_capacity(json.len() + 5);
    put_string(&mut data, &json);
    Packet::new(LOGIN_DISCONNECT_PACKET_ID, data.freeze())
}

/// Player name from a login start packet.
pub fn login_start_name(pk: &Packet) -> Result<String, ProtocolError> {
    if pk.id != LOGIN_START_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacket {
            want: LOGIN_START_PACKET_ID,
            got: pk.id,
        });
    }
    FieldReader::new(&pk.data).string()
}
