//! Link handshake: everything between opening the transport and `Ready`.
//!
//! ```text
//! Client ──[LinkHeader + LinkMess + caps]──────► Server
//! Server ──[LinkHeader + LinkReply + caps]─────► Client
//! Client ──[auth selector?][ticket | SASL]─────► Server
//! Server ──[result:u32]────────────────────────► Client
//! ```
//!
//! Two failures are answered with a reconnect instead of an error: a
//! rejected link header while speaking the current protocol (retry with
//! the old major version) and `NeedSecured` on a plain connection (retry
//! over TLS).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::context::{ChannelContext, Fallback};
use super::Channel;
use crate::auth::{self, SecurityLayer};
use crate::caps::{ChannelCaps, common};
use crate::codec::MessageCodec;
use crate::error::SpiceError;
use crate::event::ChannelEvent;
use crate::header::{HeaderMode, LinkHeader, LinkMess, LinkReply, OLD_VERSION_MAJOR, SPICE_MAGIC};
use crate::message::{AuthMechanism, LinkErrorCode};
use crate::network::{self, BoxedStream, SaslStream, boxed, tls};
use crate::session::Session;
use crate::state::ChannelState;

/// Upper bound on the peer's link reply.
pub const MAX_LINK_REPLY: usize = 64 * 1024;

/// How a handshake attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkOutcome {
    Ready,
    /// Reconnect speaking the old major version.
    Downgrade,
    /// Reconnect over TLS.
    SwitchTls,
}

fn incomplete(what: &str) -> impl FnOnce(std::io::Error) -> SpiceError + '_ {
    move |e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => SpiceError::Link(format!("incomplete {what}")),
        _ => SpiceError::Io(e),
    }
}

/// Run the handshake over a fresh transport and install it in `ctx`.
pub(crate) async fn link(
    ctx: &mut ChannelContext,
    fallback: &mut Fallback,
) -> Result<LinkOutcome, SpiceError> {
    let channel = ctx.channel().clone();
    let session = ctx.session()?;
    let mut use_tls = fallback.tls;

    let stream = open_transport(&channel, &session, &mut use_tls).await?;
    let mut stream = if use_tls {
        channel.set_state(ChannelState::TlsHandshake);
        let config = tls::client_config(&session.tls_settings()?)?;
        tls::connect(stream, &session.host(), config).await?
    } else {
        stream
    };

    // ── Link message ─────────────────────────────────────────────
    let major = session.protocol_major();
    let sasl_provider = session.sasl_provider();
    ctx.live.caps.reset(&channel.shared.kind_caps);
    if sasl_provider.is_some() {
        ctx.live.caps.local_common.set(common::AUTH_SASL);
    }
    let id = channel.id();
    let mess = LinkMess::encode_with_caps(
        session.connection_id(),
        id.channel_type as u8,
        id.id,
        &ctx.live.caps.local_common,
        &ctx.live.caps.local_kind,
    );
    let header = LinkHeader::new(major, mess.len() as u32);
    stream.write_all(&header.encode()).await?;
    stream.write_all(&mess).await?;
    stream.flush().await?;
    channel.set_state(ChannelState::LinkSent);
    debug!(channel = %channel.name(), major, size = mess.len(), "link sent");

    // ── Link reply ───────────────────────────────────────────────
    let peer = match read_link_header(&mut stream, major).await {
        Ok(peer) => peer,
        Err(e) if major != OLD_VERSION_MAJOR => {
            warn!(channel = %channel.name(), error = %e, "link header rejected, retrying with protocol {OLD_VERSION_MAJOR}");
            return Ok(LinkOutcome::Downgrade);
        }
        Err(e) => return Err(e),
    };
    channel.set_state(ChannelState::LinkHeaderRecv);

    let (reply, raw) = read_link_reply(&mut stream, peer.size as usize).await?;
    channel.set_state(ChannelState::LinkMsgRecv);
    match LinkErrorCode::try_from(reply.error) {
        Ok(LinkErrorCode::Ok) => {}
        Ok(LinkErrorCode::NeedSecured) if !use_tls => {
            info!(channel = %channel.name(), "server requires TLS, reconnecting");
            return Ok(LinkOutcome::SwitchTls);
        }
        Ok(code) => return Err(SpiceError::LinkRejected(code)),
        Err(_) => {
            return Err(SpiceError::Link(format!(
                "unknown link error code {}",
                reply.error
            )));
        }
    }
    let (remote_common, remote_kind) = reply.capabilities(&raw)?;
    ctx.live.caps.remote_common = remote_common;
    ctx.live.caps.remote_kind = remote_kind;

    // ── Authentication ───────────────────────────────────────────
    channel.set_state(ChannelState::Authenticating);
    let caps = ctx.live.caps.clone();
    let layer = authenticate(&caps, channel.name(), &session, &mut stream, &reply, use_tls).await?;

    let mode = if ctx.live.caps.remote_has_common(common::MINI_HEADER) {
        HeaderMode::Mini
    } else {
        HeaderMode::Full
    };
    let stream = match layer {
        Some(layer) => boxed(SaslStream::new(stream, layer)),
        None => stream,
    };
    ctx.live.transport = Some(Framed::new(stream, MessageCodec::new(mode)));
    ctx.live.use_tls = use_tls;
    ctx.live.peer_major = peer.major_version;
    ctx.reached_ready = true;
    channel.set_state(ChannelState::Ready);
    channel.publish_caps(&ctx.live.caps);
    info!(channel = %channel.name(), tls = use_tls, ?mode, "channel ready");

    channel.emit_event(ChannelEvent::Opened).await;

    // An event hook may have moved the channel on already.
    let kind = Arc::clone(channel.kind());
    match channel.state() {
        ChannelState::MigrationHandshake => kind.send_migration_handshake(ctx).await?,
        ChannelState::Ready => kind.on_up(ctx).await?,
        _ => {}
    }
    Ok(LinkOutcome::Ready)
}

async fn open_transport(
    channel: &Channel,
    session: &Session,
    use_tls: &mut bool,
) -> Result<BoxedStream, SpiceError> {
    let ty = channel.channel_type();
    let provided = channel.shared.pending_stream.lock().take();
    if let Some(stream) = provided {
        *use_tls = *use_tls || session.wants_tls(ty);
        debug!(channel = %channel.name(), tls = *use_tls, "using caller-provided stream");
        return Ok(stream);
    }

    let endpoint = session.endpoint_for(ty, use_tls)?;
    debug!(channel = %channel.name(), %endpoint, tls = *use_tls, "opening transport");
    match network::open(&endpoint).await {
        Ok(stream) => Ok(stream),
        Err(e) if !*use_tls && session.has_tls_port() => {
            warn!(channel = %channel.name(), error = %e, "plain connect failed, trying the TLS port");
            *use_tls = true;
            let endpoint = session.endpoint_for(ty, use_tls)?;
            network::open(&endpoint).await
        }
        Err(e) => Err(e),
    }
}

/// Read the peer's link header and check magic and major version.
pub(crate) async fn read_link_header<S>(stream: &mut S, major: u32) -> Result<LinkHeader, SpiceError>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; LinkHeader::SIZE];
    stream
        .read_exact(&mut raw)
        .await
        .map_err(incomplete("link header"))?;
    let header = LinkHeader::decode(&raw)?;
    if header.magic != SPICE_MAGIC {
        return Err(SpiceError::InvalidMagic(header.magic));
    }
    debug!(
        major = header.major_version,
        minor = header.minor_version,
        "peer version"
    );
    if header.major_version != major {
        return Err(SpiceError::VersionMismatch {
            major: header.major_version,
            minor: header.minor_version,
        });
    }
    Ok(header)
}

/// Read `size` bytes of link reply and decode its fixed part.
pub(crate) async fn read_link_reply<S>(
    stream: &mut S,
    size: usize,
) -> Result<(LinkReply, Vec<u8>), SpiceError>
where
    S: AsyncRead + Unpin,
{
    if size > MAX_LINK_REPLY {
        return Err(SpiceError::Link(format!("link reply too large: {size} bytes")));
    }
    let mut raw = vec![0u8; size];
    stream
        .read_exact(&mut raw)
        .await
        .map_err(incomplete("link reply"))?;
    let reply = LinkReply::decode(&raw)?;
    Ok((reply, raw))
}

/// Read the final 4-byte result of the authentication step.
pub(crate) async fn read_auth_result<S>(stream: &mut S) -> Result<(), SpiceError>
where
    S: AsyncRead + Unpin,
{
    let result = stream
        .read_u32_le()
        .await
        .map_err(incomplete("auth reply"))?;
    if result != LinkErrorCode::Ok as u32 {
        let reason = LinkErrorCode::try_from(result)
            .map(|c| c.to_string())
            .unwrap_or_else(|_| result.to_string());
        return Err(SpiceError::Auth(format!("rejected by server: {reason}")));
    }
    Ok(())
}

async fn send_ticket<S>(stream: &mut S, session: &Session, reply: &LinkReply) -> Result<(), SpiceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let password = session.password().unwrap_or_default();
    let ticket = auth::encrypt_ticket(&reply.pub_key, &password)?;
    stream.write_all(&ticket).await?;
    stream.flush().await?;
    read_auth_result(stream).await
}

async fn authenticate(
    caps: &ChannelCaps,
    name: &str,
    session: &Session,
    stream: &mut BoxedStream,
    reply: &LinkReply,
    use_tls: bool,
) -> Result<Option<Box<dyn SecurityLayer>>, SpiceError> {
    if !caps.remote_has_common(common::PROTOCOL_AUTH_SELECTION) {
        debug!(channel = %name, "peer has no auth selection, sending ticket");
        send_ticket(stream, session, reply).await?;
        return Ok(None);
    }

    if caps.remote_has_common(common::AUTH_SASL) {
        if let Some(provider) = session.sasl_provider() {
            debug!(channel = %name, "using SASL authentication");
            stream.write_u32_le(AuthMechanism::Sasl as u32).await?;
            let credentials = session.sasl_credentials();
            return auth::sasl::authenticate(stream, provider.as_ref(), &credentials, use_tls).await;
        }
    }

    if caps.remote_has_common(common::AUTH_SPICE) {
        debug!(channel = %name, "using ticket authentication");
        stream.write_u32_le(AuthMechanism::Spice as u32).await?;
        send_ticket(stream, session, reply).await?;
        return Ok(None);
    }

    Err(SpiceError::Link("no compatible auth mechanism".into()))
}
