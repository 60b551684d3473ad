//! PROXY protocol (v1 text, v2 binary) ingress parsing and v2 egress encoding.
//!
//! Parsing works on the buffered bytes of a [`PacketConn`], so whatever follows the
//! header stays in the buffer for the handshake peek.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::infragate::conn::PacketConn;

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const V2_HEADER_LEN: usize = 16;
const V2_MAX_ADDR_LEN: usize = 512;
const V1_PREFIX: &[u8] = b"PROXY ";
/// 107 bytes of text plus CRLF.
const V1_MAX_LEN: usize = 108;

const V2_CMD_LOCAL: u8 = 0x0;
const V2_CMD_PROXY: u8 = 0x1;
const V2_FAM_UNSPEC: u8 = 0x0;
const V2_FAM_INET: u8 = 0x1;
const V2_FAM_INET6: u8 = 0x2;
const V2_PROTO_STREAM: u8 = 0x1;

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("proxy protocol: missing header signature")]
    MissingSignature,
    #[error("proxy protocol: v1 header too long")]
    V1TooLong,
    #[error("proxy protocol: invalid v1 header: {0}")]
    InvalidV1(String),
    #[error("proxy protocol: unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("proxy protocol: unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("proxy protocol: unsupported address family {0}")]
    UnsupportedFamily(u8),
    #[error("proxy protocol: address block too long ({0} bytes)")]
    AddressBlockTooLong(usize),
    #[error("proxy protocol: address block too short for family")]
    AddressBlockTooShort,
    #[error("proxy protocol: connection closed inside header")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed ingress header. `source` is `None` for `UNKNOWN` (v1) and `LOCAL` (v2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: u8,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Parse a header from the start of `buf`.
///
/// Returns the header and its length in bytes, or `Ok(None)` if `buf` is a strict
/// prefix of a header that may still turn out valid.
pub fn parse(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyProtocolError> {
    if could_be(buf, &V2_SIGNATURE) {
        if buf.len() < V2_HEADER_LEN {
            return Ok(None);
        }
        return parse_v2(buf);
    }
    if could_be(buf, V1_PREFIX) {
        if buf.len() < V1_PREFIX.len() {
            return Ok(None);
        }
        return parse_v1(buf);
    }
    Err(ProxyProtocolError::MissingSignature)
}

fn could_be(buf: &[u8], sig: &[u8]) -> bool {
    let n = buf.len().min(sig.len());
    buf[..n] == sig[..n]
}

fn parse_v1(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyProtocolError> {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX_LEN {
            return Err(ProxyProtocolError::V1TooLong);
        }
        return Ok(None);
    };

    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProxyProtocolError::InvalidV1("not ascii".into()))?;
    let parts: Vec<&str> = line.split(' ').collect();
    let header = match parts.get(1).copied() {
        Some("UNKNOWN") => ProxyHeader {
            version: 1,
            source: None,
            destination: None,
        },
        Some(proto @ ("TCP4" | "TCP6")) => {
            if parts.len() != 6 {
                return Err(ProxyProtocolError::InvalidV1(format!(
                    "expected 6 fields, got {}",
                    parts.len()
                )));
            }
            let src = parse_v1_addr(parts[2], parts[4])?;
            let dst = parse_v1_addr(parts[3], parts[5])?;
            let want_v4 = proto == "TCP4";
            if src.is_ipv4() != want_v4 || dst.is_ipv4() != want_v4 {
                return Err(ProxyProtocolError::InvalidV1(format!(
                    "address family does not match {proto}"
                )));
            }
            ProxyHeader {
                version: 1,
                source: Some(src),
                destination: Some(dst),
            }
        }
        other => {
            return Err(ProxyProtocolError::InvalidV1(format!(
                "unsupported protocol {}",
                other.unwrap_or("")
            )));
        }
    };
    Ok(Some((header, end + 2)))
}

fn parse_v1_addr(ip: &str, port: &str) -> Result<SocketAddr, ProxyProtocolError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ProxyProtocolError::InvalidV1(format!("invalid address {ip}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyProtocolError::InvalidV1(format!("invalid port {port}")))?;
    Ok(SocketAddr::new(ip, port))
}

fn parse_v2(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyProtocolError> {
    let ver_cmd = buf[12];
    let version = ver_cmd >> 4;
    let command = ver_cmd & 0x0f;
    if version != 2 {
        return Err(ProxyProtocolError::UnsupportedVersion(version));
    }
    let family = buf[13] >> 4;
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if addr_len > V2_MAX_ADDR_LEN {
        return Err(ProxyProtocolError::AddressBlockTooLong(addr_len));
    }
    let total = V2_HEADER_LEN + addr_len;
    if buf.len() < total {
        return Ok(None);
    }
    let block = &buf[V2_HEADER_LEN..total];

    let (source, destination) = match command {
        V2_CMD_LOCAL => (None, None),
        V2_CMD_PROXY => match family {
            V2_FAM_INET => {
                if block.len() < 12 {
                    return Err(ProxyProtocolError::AddressBlockTooShort);
                }
                let src = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
                let dst = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
                let sp = u16::from_be_bytes([block[8], block[9]]);
                let dp = u16::from_be_bytes([block[10], block[11]]);
                (
                    Some(SocketAddr::new(src.into(), sp)),
                    Some(SocketAddr::new(dst.into(), dp)),
                )
            }
            V2_FAM_INET6 => {
                if block.len() < 36 {
                    return Err(ProxyProtocolError::AddressBlockTooShort);
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&block[0..16]);
                dst.copy_from_slice(&block[16..32]);
                let sp = u16::from_be_bytes([block[32], block[33]]);
                let dp = u16::from_be_bytes([block[34], block[35]]);
                (
                    Some(SocketAddr::new(Ipv6Addr::from(src).into(), sp)),
                    Some(SocketAddr::new(Ipv6Addr::from(dst).into(), dp)),
                )
            }
            V2_FAM_UNSPEC => (None, None),
            other => return Err(ProxyProtocolError::UnsupportedFamily(other)),
        },
        other => return Err(ProxyProtocolError::UnsupportedCommand(other)),
    };

    Ok(Some((
        ProxyHeader {
            version: 2,
            source,
            destination,
        },
        total,
    )))
}

/// Read and consume a header from the front of `conn`.
pub async fn read_header<S>(conn: &mut PacketConn<S>) -> Result<ProxyHeader, ProxyProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if let Some((header, n)) = parse(conn.buffered())? {
            conn.advance(n);
            return Ok(header);
        }
        if conn.fill().await? == 0 {
            return Err(ProxyProtocolError::UnexpectedEof);
        }
    }
}

/// Encode a v2 `PROXY` header for a TCP stream from `src` to `dst`.
///
/// Mixed families are sent as INET6 with the IPv4 side mapped.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> BytesMut {
    let mut out = BytesMut::with_capacity(V2_HEADER_LEN + 36);
    out.put_slice(&V2_SIGNATURE);
    out.put_u8(0x20 | V2_CMD_PROXY);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            out.put_u8((V2_FAM_INET << 4) | V2_PROTO_STREAM);
            out.put_u16(12);
            out.put_slice(&s.octets());
            out.put_slice(&d.octets());
        }
        (s, d) => {
            out.put_u8((V2_FAM_INET6 << 4) | V2_PROTO_STREAM);
            out.put_u16(36);
            out.put_slice(&to_v6(s).octets());
            out.put_slice(&to_v6(d).octets());
        }
    }
    out.put_u16(src.port());
    out.put_u16(dst.port());
    out
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
