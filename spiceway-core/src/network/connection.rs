//! Opening the raw transport of a channel.
//!
//! A channel reaches its server over TCP or a Unix socket, or over a
//! descriptor the embedding application opened itself. Whatever the
//! source, the result is a [`BoxedStream`] ready for the link handshake.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;

use super::stream::{BoxedStream, boxed};
use crate::error::SpiceError;

/// Upper bound on establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Endpoint ─────────────────────────────────────────────────────

/// Where a channel connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Host name presented to TLS, if this is a network endpoint.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp { host, .. } => Some(host),
            Endpoint::Unix(_) => None,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

// ── Opening ──────────────────────────────────────────────────────

/// Connect to `endpoint`.
///
/// TCP connections time out after [`CONNECT_TIMEOUT`] and disable Nagle.
pub async fn open(endpoint: &Endpoint) -> Result<BoxedStream, SpiceError> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
                .await
                .map_err(|_| SpiceError::Connect(format!("{addr}: timed out")))?
                .map_err(|e| SpiceError::Connect(format!("{addr}: {e}")))?;
            stream.set_nodelay(true)?;
            tracing::debug!(%addr, "tcp connected");
            Ok(boxed(stream))
        }
        Endpoint::Unix(path) => open_unix(path).await,
    }
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> Result<BoxedStream, SpiceError> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| SpiceError::Connect(format!("{}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), "unix socket connected");
    Ok(boxed(stream))
}

#[cfg(not(unix))]
async fn open_unix(path: &std::path::Path) -> Result<BoxedStream, SpiceError> {
    Err(SpiceError::Connect(format!(
        "{}: unix sockets are not supported on this platform",
        path.display()
    )))
}

/// Adopt a socket descriptor opened by the embedding application.
#[cfg(unix)]
pub fn stream_from_fd(fd: std::os::fd::OwnedFd) -> Result<BoxedStream, SpiceError> {
    let std_stream = std::net::TcpStream::from(fd);
    std_stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(std_stream)?;
    Ok(boxed(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::tcp("example.org", 5900).to_string(), "example.org:5900");
        let unix = Endpoint::Unix(PathBuf::from("/run/spice.sock"));
        assert_eq!(unix.to_string(), "unix:/run/spice.sock");
        assert!(unix.is_unix());
        assert_eq!(unix.host(), None);
    }

    #[tokio::test]
    async fn open_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = open(&Endpoint::tcp("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"abc").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = open(&Endpoint::tcp("127.0.0.1", port)).await.err().unwrap();
        assert!(matches!(err, SpiceError::Connect(_)));
    }
}
