//! Type-erased byte stream shared by every transport layer.
//!
//! A channel's live connection holds one [`BoxedStream`]; TLS and the SASL
//! security layer wrap it in turn, so the framing code never needs to know
//! which layers are active.

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional async byte stream that can move between tasks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Owned, layered transport.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Erase the concrete stream type.
pub fn boxed<S: AsyncStream>(stream: S) -> BoxedStream {
    Box::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn boxed_duplex_carries_bytes() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = boxed(a);
        let mut b = boxed(b);
        a.write_all(b"REDQ").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"REDQ");
    }
}
