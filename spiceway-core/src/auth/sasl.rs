//! SASL authentication over the link connection.
//!
//! ```text
//! Server ──[len:u32][mechlist]──────────────────────► Client   (len ≤ 300)
//! Client ──[len:u32][mechname]──────────────────────► Server
//! Client ──[len:u32][client-out + NUL] or [0:u32]───► Server
//! Server ──[len:u32][server-in + NUL][complete:u8]──► Client   (len ≤ 65536)
//!        ... step until both sides are complete ...
//! Server ──[result:u32]─────────────────────────────► Client
//! ```
//!
//! Mechanisms plug in through [`SaslMechanism`]; a [`SaslProvider`] picks
//! one from the server's list. Without TLS the negotiated security
//! strength must reach [`MIN_SSF`].

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SpiceError;

pub const MAX_MECHLIST_LEN: usize = 300;
pub const MAX_DATA_LEN: usize = 65536;

/// Weakest security layer accepted on an unencrypted transport.
pub const MIN_SSF: u32 = 56;

// ── Traits ───────────────────────────────────────────────────────

/// Outcome of one client step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslStep {
    /// Data for the server; `None` is distinct from empty.
    pub out: Option<Vec<u8>>,
    /// The client side considers the exchange finished.
    pub complete: bool,
}

/// Message protection negotiated by a mechanism.
pub trait SecurityLayer: Send + fmt::Debug {
    fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>, SpiceError>;
    fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>, SpiceError>;
}

/// Client side of one SASL mechanism.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<SaslStep, SpiceError>;

    fn step(&mut self, server_in: Option<&[u8]>) -> Result<SaslStep, SpiceError>;

    /// Negotiated security strength factor; zero means no protection.
    fn ssf(&self) -> u32 {
        0
    }

    /// The protection layer, once the exchange is complete.
    fn into_security_layer(self: Box<Self>) -> Option<Box<dyn SecurityLayer>> {
        None
    }
}

/// What a mechanism may need from the session.
#[derive(Clone, Default)]
pub struct SaslCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .finish()
    }
}

/// Chooses a mechanism from the list the server offers.
pub trait SaslProvider: Send + Sync + fmt::Debug {
    fn select(
        &self,
        offered: &[&str],
        credentials: &SaslCredentials,
    ) -> Option<Box<dyn SaslMechanism>>;
}

// ── PLAIN ────────────────────────────────────────────────────────

/// `PLAIN` (RFC 4616): one message carrying the credentials in clear.
#[derive(Debug)]
pub struct PlainMechanism {
    authzid: String,
    username: String,
    password: String,
}

impl PlainMechanism {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: String::new(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn start(&mut self) -> Result<SaslStep, SpiceError> {
        let mut out = Vec::new();
        out.extend_from_slice(self.authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        Ok(SaslStep {
            out: Some(out),
            complete: true,
        })
    }

    fn step(&mut self, _server_in: Option<&[u8]>) -> Result<SaslStep, SpiceError> {
        Ok(SaslStep {
            out: None,
            complete: true,
        })
    }
}

/// Offers `PLAIN` when the server lists it and credentials are set.
#[derive(Debug, Default)]
pub struct DefaultSaslProvider;

impl SaslProvider for DefaultSaslProvider {
    fn select(
        &self,
        offered: &[&str],
        credentials: &SaslCredentials,
    ) -> Option<Box<dyn SaslMechanism>> {
        if !offered.iter().any(|m| m.eq_ignore_ascii_case("PLAIN")) {
            return None;
        }
        let username = credentials.username.clone()?;
        let password = credentials.password.clone().unwrap_or_default();
        Some(Box::new(PlainMechanism::new(username, password)))
    }
}

// ── Exchange ─────────────────────────────────────────────────────

fn io_err(e: std::io::Error) -> SpiceError {
    SpiceError::Sasl(format!("transport: {e}"))
}

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u32, SpiceError> {
    stream.read_u32_le().await.map_err(io_err)
}

async fn write_data<S: AsyncWrite + Unpin>(
    stream: &mut S,
    data: Option<&[u8]>,
) -> Result<(), SpiceError> {
    match data {
        Some(data) => {
            stream
                .write_u32_le(data.len() as u32 + 1)
                .await
                .map_err(io_err)?;
            stream.write_all(data).await.map_err(io_err)?;
            stream.write_u8(0).await.map_err(io_err)?;
        }
        None => stream.write_u32_le(0).await.map_err(io_err)?,
    }
    Ok(())
}

/// One server reply: the data without its NUL, and the completion flag.
async fn read_server<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(Option<Vec<u8>>, bool), SpiceError> {
    let len = read_u32(stream).await? as usize;
    if len > MAX_DATA_LEN {
        return Err(SpiceError::Sasl(format!(
            "negotiation data too long: {len} bytes"
        )));
    }
    let data = if len > 0 {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.map_err(io_err)?;
        buf.truncate(len - 1);
        Some(buf)
    } else {
        None
    };
    let complete = stream.read_u8().await.map_err(io_err)? != 0;
    Ok((data, complete))
}

/// Parse the mechanism list: names separated by commas or spaces.
pub fn parse_mechlist(raw: &[u8]) -> Vec<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end])
        .split([',', ' '])
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run the whole exchange after the auth selector was written.
///
/// Returns the security layer to wrap the transport with, if the
/// mechanism negotiated one. `tls` relaxes the strength requirement.
pub async fn authenticate<S>(
    stream: &mut S,
    provider: &dyn SaslProvider,
    credentials: &SaslCredentials,
    tls: bool,
) -> Result<Option<Box<dyn SecurityLayer>>, SpiceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = read_u32(stream).await? as usize;
    if len > MAX_MECHLIST_LEN {
        return Err(SpiceError::Sasl(format!("mechlist too long: {len} bytes")));
    }
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await.map_err(io_err)?;
    let offered = parse_mechlist(&raw);
    tracing::debug!(mechlist = ?offered, "server SASL mechanisms");

    let names: Vec<&str> = offered.iter().map(String::as_str).collect();
    let mut mech = provider
        .select(&names, credentials)
        .ok_or_else(|| SpiceError::Sasl(format!("no usable mechanism in {offered:?}")))?;

    let start = mech.start()?;
    let name = mech.name().to_string();
    tracing::debug!(mechanism = %name, "starting SASL");
    stream.write_u32_le(name.len() as u32).await.map_err(io_err)?;
    stream.write_all(name.as_bytes()).await.map_err(io_err)?;
    write_data(stream, start.out.as_deref()).await?;
    stream.flush().await.map_err(io_err)?;

    let (mut server_in, mut server_complete) = read_server(stream).await?;
    let mut client_complete = start.complete;
    let mut check_ssf = true;

    while !(server_complete && client_complete) {
        let step = mech.step(server_in.as_deref())?;
        client_complete = step.complete;
        if server_complete && client_complete {
            break;
        }

        write_data(stream, step.out.as_deref()).await?;
        stream.flush().await.map_err(io_err)?;
        (server_in, server_complete) = read_server(stream).await?;

        if server_complete {
            if !client_complete {
                tracing::warn!("server finished SASL before the client");
                check_ssf = false;
            }
            break;
        }
    }

    if !tls && check_ssf {
        let ssf = mech.ssf();
        tracing::debug!(ssf, "SASL security strength");
        if ssf < MIN_SSF {
            return Err(SpiceError::Sasl(format!(
                "negotiation SSF {ssf} was not strong enough"
            )));
        }
    }

    let result = read_u32(stream).await?;
    if result != 0 {
        return Err(SpiceError::Auth(format!("SASL rejected by server: {result}")));
    }
    tracing::debug!("SASL authentication complete");
    Ok(if mech.ssf() > 0 {
        mech.into_security_layer()
    } else {
        None
    })
}
