//! Transport wrapper applying a negotiated SASL security layer.
//!
//! Reads pull raw chunks from the inner stream and decode them into a
//! plaintext buffer. Writes encode the caller's bytes into a pending
//! buffer that is drained before the next write, on flush and on
//! shutdown.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::stream::BoxedStream;
use crate::auth::SecurityLayer;

const READ_CHUNK: usize = 8192;

pub struct SaslStream {
    inner: BoxedStream,
    layer: Box<dyn SecurityLayer>,
    decoded: BytesMut,
    pending: BytesMut,
}

impl SaslStream {
    pub fn new(inner: BoxedStream, layer: Box<dyn SecurityLayer>) -> Self {
        Self {
            inner,
            layer,
            decoded: BytesMut::new(),
            pending: BytesMut::new(),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

fn layer_err(e: crate::error::SpiceError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

impl AsyncRead for SaslStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.decoded.is_empty() {
            let mut chunk = [0u8; READ_CHUNK];
            let mut raw = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            if raw.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
            let plain = this.layer.decode(raw.filled()).map_err(layer_err)?;
            this.decoded.extend_from_slice(&plain);
        }
        let n = buf.remaining().min(this.decoded.len());
        buf.put_slice(&this.decoded[..n]);
        this.decoded.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SaslStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        let encoded = this.layer.encode(buf).map_err(layer_err)?;
        this.pending.extend_from_slice(&encoded);
        // Bytes are accepted once encoded; a stalled drain resumes on flush.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
