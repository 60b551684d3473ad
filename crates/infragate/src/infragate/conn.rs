use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::infragate::protocol::{self, DEFAULT_MAX_PACKET_BYTES, Packet, ProtocolError};

/// Buffered packet stream with non-consuming reads.
///
/// Everything read from the socket lands in `buf`; `peek_packet` decodes from the
/// front without advancing, so the same bytes are later returned by `read_packet`
/// or handed to the backend via [`PacketConn::into_parts`].
#[derive(Debug)]
pub struct PacketConn<S> {
    stream: S,
    buf: BytesMut,
    max_packet_bytes: usize,
}

impl<S> PacketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_packet_bytes(stream, DEFAULT_MAX_PACKET_BYTES)
    }

    pub fn with_max_packet_bytes(stream: S, max_packet_bytes: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4 * 1024),
            max_packet_bytes,
        }
    }

    pub fn set_max_packet_bytes(&mut self, max: usize) {
        self.max_packet_bytes = max;
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Read more bytes from the socket into the buffer. Returns 0 on EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(4 * 1024);
        self.stream.read_buf(&mut self.buf).await
    }

    /// Decode the next packet without consuming it. Calling this repeatedly
    /// returns the same packet.
    pub async fn peek_packet(&mut self) -> Result<Packet, ProtocolError> {
        let (pk, _) = self.next_frame().await?;
        Ok(pk)
    }

    pub async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        let (pk, n) = self.next_frame().await?;
        self.buf.advance(n);
        Ok(pk)
    }

    pub async fn write_packet(&mut self, pk: &Packet) -> Result<(), ProtocolError> {
        self.stream.write_all(&pk.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Release the stream together with any bytes read but not consumed.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buf)
    }

    async fn next_frame(&mut self) -> Result<(Packet, usize), ProtocolError> {
        loop {
            if let Some(frame) = protocol::decode_frame(&self.buf, self.max_packet_bytes)? {
                return Ok(frame);
            }
            if self.fill().await? == 0 {
                return Err(ProtocolError::UnexpectedEof);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infragate::protocol::{Handshake, NextState, tests::handshake_bytes};

    #[tokio::test]
    async fn peek_is_repeatable_and_read_consumes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let hs = handshake_bytes("play.example.com", 25565, 763, 2);
        client.write_all(&hs).await.unwrap();
        client.write_all(&[0x01, 0x00]).await.unwrap();

        let mut conn = PacketConn::new(server);
        let a = conn.peek_packet().await.unwrap();
        let b = conn.peek_packet().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(Handshake::decode(&a).unwrap().next_state, NextState::Login);

        let c = conn.read_packet().await.unwrap();
        assert_eq!(a, c);
        let next = conn.read_packet().await.unwrap();
        assert_eq!(next.id, 0x00);
        assert!(next.data.is_empty());
    }

    #[tokio::test]
    async fn peeked_bytes_survive_into_parts() {
        let (mut client, server) = tokio::io::duplex(1024);
        let hs = handshake_bytes("play.example.com", 25565, 763, 1);
        client.write_all(&hs).await.unwrap();

        let mut conn = PacketConn::new(server);
        conn.peek_packet().await.unwrap();
        let (_stream, rest) = conn.into_parts();
        assert_eq!(&rest[..], &hs[..]);
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let hs = handshake_bytes("play.example.com", 25565, 763, 1);
        client.write_all(&hs[..hs.len() - 2]).await.unwrap();
        drop(client);

        let mut conn = PacketConn::new(server);
        assert!(matches!(
            conn.peek_packet().await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_payload() {
        let (mut client, server) = tokio::io::duplex(1024);
        // Declares a 300-byte frame; only the prefix is ever sent.
        client.write_all(&[0xac, 0x02]).await.unwrap();

        let mut conn = PacketConn::with_max_packet_bytes(server, 64);
        assert!(matches!(
            conn.peek_packet().await,
            Err(ProtocolError::PacketTooLarge { len: 300, max: 64 })
        ));
    }
}
