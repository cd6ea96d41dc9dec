//! The main channel: session setup, channel discovery and migration.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::base::encoded;
use super::context::ChannelContext;
use super::kind::{ChannelKind, HandlerFuture, HandlerTable};
use crate::caps::{self, CapabilityFilter, CapabilitySet};
use crate::error::SpiceError;
use crate::event::ChannelEvent;
use crate::message::{ChannelType, client, server};
use crate::packet::IncomingMessage;
use crate::protocol::{
    AgentConnectedTokens, AgentDisconnected, ChannelsList, MainInit, MainName, MainUuid,
    MigrateBeginSeamless, MigrateDstDoSeamless, MigrationDstInfo, MouseMode, MultiMediaTime,
};
use crate::session::migration::HandshakeResult;
use crate::state::{ChannelState, MigrationState};

use server::main as msg;

static HANDLERS: LazyLock<HandlerTable> = LazyLock::new(|| {
    HandlerTable::new()
        .with::<MainInit>(msg::INIT, handle_init)
        .with::<MainName>(msg::NAME, handle_name)
        .with::<MainUuid>(msg::UUID, handle_uuid)
        .with::<ChannelsList>(msg::CHANNELS_LIST, handle_channels_list)
        .with::<MouseMode>(msg::MOUSE_MODE, handle_mouse_mode)
        .with::<MultiMediaTime>(msg::MULTI_MEDIA_TIME, handle_mm_time)
        .with_raw(msg::AGENT_CONNECTED, "AgentConnected", handle_agent_connected)
        .with::<AgentDisconnected>(msg::AGENT_DISCONNECTED, handle_agent_disconnected)
        .with::<AgentConnectedTokens>(msg::AGENT_CONNECTED_TOKENS, handle_agent_tokens)
        .with_raw(msg::AGENT_DATA, "AgentData", forward)
        .with_raw(msg::AGENT_TOKEN, "AgentToken", forward)
        .with::<MigrationDstInfo>(msg::MIGRATE_BEGIN, handle_migrate_begin)
        .with::<MigrateBeginSeamless>(msg::MIGRATE_BEGIN_SEAMLESS, handle_migrate_begin_seamless)
        .with_raw(msg::MIGRATE_DST_SEAMLESS_ACK, "MigrateDstSeamlessAck", handle_seamless_ack)
        .with_raw(msg::MIGRATE_DST_SEAMLESS_NACK, "MigrateDstSeamlessNack", handle_seamless_nack)
        .with_raw(msg::MIGRATE_END, "MigrateEnd", handle_migrate_end)
        .with_raw(msg::MIGRATE_CANCEL, "MigrateCancel", handle_migrate_cancel)
        .with::<MigrationDstInfo>(msg::MIGRATE_SWITCH_HOST, handle_switch_host)
});

// ── MainKind ─────────────────────────────────────────────────────

/// Kind of the `main:0` channel every session starts with.
#[derive(Debug, Clone, Copy, Default)]
pub struct MainKind;

#[async_trait]
impl ChannelKind for MainKind {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Main
    }

    fn handlers(&self) -> &HandlerTable {
        &HANDLERS
    }

    fn reset_capabilities(&self, set: &mut CapabilitySet, filter: &CapabilityFilter) {
        use caps::main::*;
        for bit in [
            SEMI_SEAMLESS_MIGRATE,
            NAME_AND_UUID,
            AGENT_CONNECTED_TOKENS,
            SEAMLESS_MIGRATE,
        ] {
            filter.set(set, bit, NAMES[bit as usize]);
        }
    }

    async fn send_migration_handshake(&self, ctx: &mut ChannelContext) -> Result<(), SpiceError> {
        let session = ctx.session()?;
        let Some(tracker) = session.handshake_tracker() else {
            warn!(channel = %ctx.channel().name(), "migration handshake without a migration");
            return Ok(());
        };
        if !ctx.caps().remote_has(caps::main::SEAMLESS_MIGRATE) {
            debug!(channel = %ctx.channel().name(), "destination cannot migrate seamlessly");
            let channel = ctx.channel().clone();
            tracker.handshake_done(&channel, false);
            return Ok(());
        }
        let request = encoded(
            ctx,
            client::main::MIGRATE_DST_DO_SEAMLESS,
            &MigrateDstDoSeamless {
                src_version: tracker.src_version(),
            },
        );
        ctx.write(request).await
    }

    /// A shadow main channel waiting for its seamless reply ignores
    /// everything else.
    fn filter(&self, state: ChannelState, msg_type: u16) -> bool {
        state != ChannelState::MigrationHandshake
            || msg_type == msg::MIGRATE_DST_SEAMLESS_ACK
            || msg_type == msg::MIGRATE_DST_SEAMLESS_NACK
    }
}

// ── Session setup ────────────────────────────────────────────────

fn handle_init(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let init = *msg.parsed_as::<MainInit>()?;
        let session = ctx.session()?;
        info!(
            channel = %ctx.channel().name(),
            session_id = init.session_id,
            agent = init.agent_connected != 0,
            "main init"
        );
        session.set_connection_id(init.session_id);
        session.update_server_info(|info| {
            info.supported_mouse_modes = init.supported_mouse_modes;
            info.current_mouse_mode = init.current_mouse_mode;
            info.multi_media_time = init.multi_media_time;
            info.agent_connected = init.agent_connected != 0;
            info.agent_tokens = init.agent_tokens;
            info.display_channels_hint = init.display_channels_hint;
            info.ram_hint = init.ram_hint;
        });

        if session.migrate_after_main_init() {
            return Ok(());
        }
        ctx.send(ctx.channel().message(client::main::ATTACH_CHANNELS));
        Ok(())
    })
}

fn handle_channels_list(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let list = msg.parsed_as::<ChannelsList>()?;
        let session = ctx.session()?;
        let config = session.config();

        for &(raw_type, id) in &list.channels {
            let Ok(ty) = ChannelType::try_from(raw_type) else {
                debug!(channel_type = raw_type, id, "ignoring unknown channel kind");
                continue;
            };
            if !config.is_enabled(ty) {
                debug!(kind = ty.name(), id, "channel kind not enabled");
                continue;
            }
            if session.lookup_channel(ty, id).is_some() {
                continue;
            }
            let channel = session.channel_new(ty, id);
            if let Err(e) = channel.connect() {
                warn!(channel = %channel.name(), error = %e, "cannot connect advertised channel");
            }
        }
        Ok(())
    })
}

// ── Server info ──────────────────────────────────────────────────

fn handle_name(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let name = msg.parsed_as::<MainName>()?.name.clone();
        debug!(channel = %ctx.channel().name(), server = %name, "server name");
        ctx.session()?.update_server_info(|info| info.name = Some(name));
        Ok(())
    })
}

fn handle_uuid(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let uuid = msg.parsed_as::<MainUuid>()?.uuid;
        ctx.session()?.update_server_info(|info| info.uuid = Some(uuid));
        Ok(())
    })
}

fn handle_mouse_mode(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let mode = *msg.parsed_as::<MouseMode>()?;
        ctx.session()?.update_server_info(|info| {
            info.supported_mouse_modes = mode.supported_modes;
            info.current_mouse_mode = mode.current_mode;
        });
        Ok(())
    })
}

fn handle_mm_time(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let time = msg.parsed_as::<MultiMediaTime>()?.time;
        ctx.session()?
            .update_server_info(|info| info.multi_media_time = time);
        Ok(())
    })
}

fn handle_agent_connected(ctx: &mut ChannelContext, _msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        debug!(channel = %ctx.channel().name(), "agent connected");
        ctx.session()?
            .update_server_info(|info| info.agent_connected = true);
        Ok(())
    })
}

fn handle_agent_disconnected(
    ctx: &mut ChannelContext,
    msg: Arc<IncomingMessage>,
) -> HandlerFuture<'_> {
    Box::pin(async move {
        let error_code = msg.parsed_as::<AgentDisconnected>()?.error_code;
        debug!(channel = %ctx.channel().name(), error_code, "agent disconnected");
        ctx.session()?.update_server_info(|info| {
            info.agent_connected = false;
            info.agent_tokens = 0;
        });
        Ok(())
    })
}

fn handle_agent_tokens(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let tokens = msg.parsed_as::<AgentConnectedTokens>()?.num_tokens;
        ctx.session()?.update_server_info(|info| {
            info.agent_connected = true;
            info.agent_tokens = tokens;
        });
        Ok(())
    })
}

/// Agent traffic belongs to whoever interprets the agent protocol.
fn forward(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move { ctx.forward(msg).await })
}

// ── Migration ────────────────────────────────────────────────────

fn handle_migrate_begin(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let info = msg.parsed_as::<MigrationDstInfo>()?.clone();
        migrate_connect(ctx, info, false, 0).await
    })
}

fn handle_migrate_begin_seamless(
    ctx: &mut ChannelContext,
    msg: Arc<IncomingMessage>,
) -> HandlerFuture<'_> {
    Box::pin(async move {
        let begin = msg.parsed_as::<MigrateBeginSeamless>()?.clone();
        migrate_connect(ctx, begin.dst_info, true, begin.src_mig_version).await
    })
}

/// Connect a shadow session to the destination, wait for every channel
/// to open there and report the outcome to the source server.
async fn migrate_connect(
    ctx: &mut ChannelContext,
    info: MigrationDstInfo,
    seamless: bool,
    src_version: u32,
) -> Result<(), SpiceError> {
    let session = ctx.session()?;
    let attempt = match session.migrate_connect(&info, seamless, src_version) {
        Ok(attempt) => attempt,
        Err(e) => {
            warn!(channel = %ctx.channel().name(), error = %e, "migration connect failed");
            let reply = ctx.channel().message(client::main::MIGRATE_CONNECT_ERROR);
            return ctx.write(reply).await;
        }
    };
    let shadow = attempt.shadow;
    let cancel = ctx.cancel.clone();

    let outcome = tokio::select! {
        outcome = attempt.done => outcome.unwrap_or(HandshakeResult::Failed),
        _ = cancel.cancelled() => {
            debug!(channel = %ctx.channel().name(), "migration connect interrupted");
            shadow.disconnect();
            session.set_migration_state(MigrationState::None);
            return Ok(());
        }
    };

    let reply = match outcome {
        HandshakeResult::Connected { seamless } => {
            info!(seamless, "migration: all destination channels connected");
            session.set_migration(shadow, seamless);
            if seamless {
                client::main::MIGRATE_CONNECTED_SEAMLESS
            } else {
                client::main::MIGRATE_CONNECTED
            }
        }
        HandshakeResult::Failed => {
            warn!("migration: destination connect failed");
            shadow.disconnect();
            session.set_migration_state(MigrationState::None);
            client::main::MIGRATE_CONNECT_ERROR
        }
    };
    let reply = ctx.channel().message(reply);
    ctx.write(reply).await
}

fn handle_seamless_ack(ctx: &mut ChannelContext, _msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move { seamless_reply(ctx, true) })
}

fn handle_seamless_nack(ctx: &mut ChannelContext, _msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move { seamless_reply(ctx, false) })
}

fn seamless_reply(ctx: &mut ChannelContext, seamless: bool) -> Result<(), SpiceError> {
    let channel = ctx.channel().clone();
    match ctx.session()?.handshake_tracker() {
        Some(tracker) => tracker.handshake_done(&channel, seamless),
        None => warn!(channel = %channel.name(), "seamless migration reply without a migration"),
    }
    Ok(())
}

fn handle_migrate_end(ctx: &mut ChannelContext, _msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        if !ctx.caps().remote_has(caps::main::SEMI_SEAMLESS_MIGRATE) {
            warn!(channel = %ctx.channel().name(), "migrate end without semi-seamless support");
            return Ok(());
        }
        debug!(channel = %ctx.channel().name(), "migrate end");
        let session = ctx.session()?;
        session.migrate_end(ctx).await;
        Ok(())
    })
}

fn handle_migrate_cancel(ctx: &mut ChannelContext, _msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        debug!(channel = %ctx.channel().name(), "migrate cancel");
        let session = ctx.session()?;
        session.abort_migration(ctx).await;
        Ok(())
    })
}

fn handle_switch_host(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let dst = msg.parsed_as::<MigrationDstInfo>()?.clone();
        let session = ctx.session()?;
        info!(host = %dst.host, port = dst.port, sport = dst.sport, "switching host");

        session.set_migration_state(MigrationState::Switching);
        session.update_config(|cfg| {
            cfg.host = dst.host;
            cfg.port = (dst.port != 0).then_some(dst.port);
            cfg.tls_port = (dst.sport != 0).then_some(dst.sport);
            cfg.cert_subject = dst.cert_subject;
        });

        // The channel task reconnects once this handler returns.
        ctx.channel().disconnect(ChannelEvent::Switching);
        session.switching_disconnect();
        session.set_migration_state(MigrationState::None);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::{connected, mini, written};
    use crate::protocol::WireEncode;
    use crate::session::{Session, SessionConfig};
    use bytes::{BufMut, BytesMut};

    fn init_payload(session_id: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for v in [session_id, 1, 3, 2, 1, 10, 1234, 0] {
            buf.put_u32_le(v);
        }
        buf.to_vec()
    }

    #[test]
    fn local_caps_follow_filter() {
        let mut set = CapabilitySet::new();
        MainKind.reset_capabilities(&mut set, &CapabilityFilter::default());
        assert!(set.test(caps::main::SEAMLESS_MIGRATE));
        assert!(set.test(caps::main::NAME_AND_UUID));

        let mut set = CapabilitySet::new();
        let filter = CapabilityFilter::new(["SPICE_MAIN_CAP_SEAMLESS_MIGRATE"]);
        MainKind.reset_capabilities(&mut set, &filter);
        assert!(!set.test(caps::main::SEAMLESS_MIGRATE));
        assert!(set.test(caps::main::SEMI_SEAMLESS_MIGRATE));
    }

    #[test]
    fn handshake_state_only_takes_seamless_replies() {
        let kind = MainKind;
        assert!(!kind.filter(ChannelState::MigrationHandshake, msg::INIT));
        assert!(kind.filter(ChannelState::MigrationHandshake, msg::MIGRATE_DST_SEAMLESS_ACK));
        assert!(kind.filter(ChannelState::MigrationHandshake, msg::MIGRATE_DST_SEAMLESS_NACK));
        assert!(kind.filter(ChannelState::Ready, msg::INIT));
    }

    #[tokio::test]
    async fn init_records_session_and_attaches() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Main);

        ctx.process(mini(msg::INIT, &init_payload(0xfeed))).await.unwrap();
        ctx.drain_queue().await.unwrap();

        assert_eq!(session.connection_id(), 0xfeed);
        let info = session.server_info();
        assert_eq!(info.multi_media_time, 1234);
        assert!(info.agent_connected);
        assert_eq!(written(&mut remote).await, vec![client::main::ATTACH_CHANNELS]);
    }

    #[tokio::test]
    async fn channels_list_respects_gates() {
        let session = Session::new(SessionConfig {
            enable_audio: false,
            ..Default::default()
        });
        let (mut ctx, _remote) = connected(&session, ChannelType::Main);

        let mut list = BytesMut::new();
        list.put_u32_le(4);
        for (ty, id) in [(2u8, 0u8), (5, 0), (9, 0), (42, 0)] {
            list.put_u8(ty);
            list.put_u8(id);
        }
        ctx.process(mini(msg::CHANNELS_LIST, &list)).await.unwrap();

        assert!(session.lookup_channel(ChannelType::Display, 0).is_some());
        assert!(session.lookup_channel(ChannelType::Playback, 0).is_none());
        assert!(session.lookup_channel(ChannelType::Usbredir, 0).is_none());
        session.disconnect();
    }

    #[tokio::test]
    async fn name_and_uuid_update_info() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, _remote) = connected(&session, ChannelType::Main);

        let mut name = BytesMut::new();
        name.put_u32_le(4);
        name.put_slice(b"vm1\0");
        ctx.process(mini(msg::NAME, &name)).await.unwrap();
        ctx.process(mini(msg::UUID, &[7; 16])).await.unwrap();

        let info = session.server_info();
        assert_eq!(info.name.as_deref(), Some("vm1"));
        assert_eq!(info.uuid, Some([7; 16]));
    }

    #[tokio::test]
    async fn agent_data_is_forwarded() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let session = Session::builder(SessionConfig::default())
            .payload_sink(tx)
            .build();
        let (mut ctx, _remote) = connected(&session, ChannelType::Main);
        ctx.process(mini(msg::AGENT_DATA, b"clip")).await.unwrap();
        let (id, forwarded) = rx.try_recv().unwrap();
        assert_eq!(id.channel_type, ChannelType::Main);
        assert_eq!(forwarded.data(), b"clip");
    }

    #[tokio::test]
    async fn switch_host_updates_target() {
        let session = Session::new(SessionConfig {
            host: "old".into(),
            port: Some(5900),
            ..Default::default()
        });
        let (mut ctx, _remote) = connected(&session, ChannelType::Main);
        session.channel_new(ChannelType::Display, 0);
        session.set_connection_id(5);

        let mut payload = BytesMut::new();
        MigrationDstInfo {
            port: 6000,
            sport: 6001,
            host: "new".into(),
            cert_subject: Some("CN=new".into()),
        }
        .encode(&mut payload);
        ctx.process(mini(msg::MIGRATE_SWITCH_HOST, &payload)).await.unwrap();

        let cfg = session.config();
        assert_eq!(cfg.host, "new");
        assert_eq!((cfg.port, cfg.tls_port), (Some(6000), Some(6001)));
        assert_eq!(cfg.cert_subject.as_deref(), Some("CN=new"));
        assert_eq!(session.channels().len(), 1);
        assert_eq!(session.connection_id(), 0);
        assert_eq!(ctx.channel().state(), ChannelState::Switching);
        assert!(ctx.is_cancelled());
        assert_eq!(session.migration_state(), MigrationState::None);
    }

    #[tokio::test]
    async fn migrate_end_needs_semi_seamless() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Main);
        ctx.process(mini(msg::MIGRATE_END, b"")).await.unwrap();
        assert!(written(&mut remote).await.is_empty());
        assert_eq!(session.migration_state(), MigrationState::None);
    }
}
