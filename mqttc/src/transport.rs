//! Transport abstraction.
//!
//! The session speaks MQTT over any ordered, reliable byte stream. Opening
//! the stream (TCP, TLS, WebSocket, an in-memory pipe) is the caller's
//! business; the client only reads, writes and shuts it down.

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carrying one MQTT connection.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed<T: Transport>(transport: T) -> Box<dyn Transport> {
        Box::new(transport)
    }

    #[tokio::test]
    async fn test_duplex_is_transport() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = tokio::io::duplex(64);
        let mut a = boxed(a);
        let mut b = boxed(b);
        a.write_all(b"\xC0\x00").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00]);
    }
}
