//! Handlers for the base protocol every channel speaks.

use std::sync::{Arc, LazyLock};

use tracing::{debug, error, info, warn};

use super::context::ChannelContext;
use super::kind::{HandlerFuture, HandlerTable};
use crate::flags::MigrateFlags;
use crate::message::{ChannelType, client, server};
use crate::packet::{IncomingMessage, OutgoingMessage};
use crate::protocol::{
    AckSync, Disconnecting, Migrate, Notify, NotifySeverity, Ping, Pong, SetAck, WaitForChannels,
    WireEncode,
};

pub(crate) static HANDLERS: LazyLock<HandlerTable> = LazyLock::new(|| {
    HandlerTable::new()
        .with::<SetAck>(server::SET_ACK, handle_set_ack)
        .with::<Ping>(server::PING, handle_ping)
        .with::<Notify>(server::NOTIFY, handle_notify)
        .with::<Disconnecting>(server::DISCONNECTING, handle_disconnecting)
        .with::<WaitForChannels>(server::WAIT_FOR_CHANNELS, handle_wait_for_channels)
        .with::<Migrate>(server::MIGRATE, handle_migrate)
});

/// Message of `msg_type` carrying `payload`.
pub(crate) fn encoded(
    ctx: &ChannelContext,
    msg_type: u16,
    payload: &impl WireEncode,
) -> OutgoingMessage {
    let mut msg = ctx.channel().message(msg_type);
    payload.encode(msg.payload_mut());
    msg
}

fn handle_set_ack(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let ack = *msg.parsed_as::<SetAck>()?;
        debug!(channel = %ctx.channel().name(), generation = ack.generation, window = ack.window, "set ack");
        ctx.set_ack_window(ack.window);
        let sync = encoded(ctx, client::ACK_SYNC, &AckSync { generation: ack.generation });
        ctx.write(sync).await
    })
}

fn handle_ping(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let ping = *msg.parsed_as::<Ping>()?;
        let pong = encoded(
            ctx,
            client::PONG,
            &Pong {
                id: ping.id,
                timestamp: ping.timestamp,
            },
        );
        ctx.write(pong).await
    })
}

fn handle_notify(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let notify = msg.parsed_as::<Notify>()?;
        let name = ctx.channel().name();
        match notify.severity {
            NotifySeverity::Info => {
                info!(channel = %name, what = notify.what, "server notice: {}", notify.message)
            }
            NotifySeverity::Warn => {
                warn!(channel = %name, what = notify.what, "server warning: {}", notify.message)
            }
            NotifySeverity::Error => {
                error!(channel = %name, what = notify.what, "server error: {}", notify.message)
            }
        }
        Ok(())
    })
}

fn handle_disconnecting(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let d = msg.parsed_as::<Disconnecting>()?;
        debug!(channel = %ctx.channel().name(), time_stamp = d.time_stamp, reason = d.reason, "server disconnecting");
        Ok(())
    })
}

fn handle_wait_for_channels(
    ctx: &mut ChannelContext,
    msg: Arc<IncomingMessage>,
) -> HandlerFuture<'_> {
    Box::pin(async move {
        let wait = msg.parsed_as::<WaitForChannels>()?;
        let session = ctx.session()?;
        let channel = ctx.channel().clone();
        let total = wait.wait_list.len();

        for (i, w) in wait.wait_list.iter().enumerate() {
            let target = ChannelType::try_from(w.channel_type)
                .ok()
                .and_then(|ty| session.lookup_channel(ty, w.channel_id));
            let Some(target) = target else {
                warn!(
                    channel = %channel.name(),
                    channel_type = w.channel_type,
                    channel_id = w.channel_id,
                    "wait for unknown channel"
                );
                continue;
            };
            debug!(channel = %channel.name(), target = %target.name(), serial = w.serial, "waiting for serial ({}/{total})", i + 1);
            let serial = w.serial;
            let reached = channel
                .shared
                .main_ctx
                .condition_wait(|| target.last_serial() >= serial, &channel.shared.canceller)
                .await;
            if reached {
                debug!(channel = %channel.name(), serial, "wait done");
            } else {
                debug!(channel = %channel.name(), serial, "wait cancelled");
            }
        }
        Ok(())
    })
}

fn handle_migrate(ctx: &mut ChannelContext, msg: Arc<IncomingMessage>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let flags = msg.parsed_as::<Migrate>()?.flags;
        let channel = ctx.channel().clone();
        debug!(channel = %channel.name(), ?flags, "migrate");

        if flags.contains(MigrateFlags::NEED_FLUSH) {
            // Old peers expect everything queued to go out before the mark.
            if ctx.peer_major() == 1 {
                ctx.drain_queue().await?;
            }
            ctx.write(channel.message(client::MIGRATE_FLUSH_MARK)).await?;
        }

        let mut data = None;
        if flags.contains(MigrateFlags::NEED_DATA_TRANSFER) {
            let captured = ctx.read_accounted().await?;
            if captured.msg_type() != server::MIGRATE_DATA {
                error!(channel = %channel.name(), msg_type = captured.msg_type(), "expected MIGRATE_DATA");
                return Ok(());
            }
            data = Some(captured.to_bytes());
        }

        let session = ctx.session()?;
        session.channel_migrate(ctx).await;

        if let Some(data) = data {
            let mut relay = channel.message(client::MIGRATE_DATA);
            relay.payload_mut().extend_from_slice(&data);
            ctx.write(relay).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::{connected, mini, written, written_messages};
    use crate::session::{Session, SessionConfig};
    use bytes::{BufMut, BytesMut};

    #[test]
    fn base_table_covers_base_messages() {
        for ty in [
            server::SET_ACK,
            server::PING,
            server::NOTIFY,
            server::DISCONNECTING,
            server::WAIT_FOR_CHANNELS,
            server::MIGRATE,
        ] {
            assert!(HANDLERS.contains(ty), "missing handler for {ty}");
        }
        assert!(!HANDLERS.contains(server::LIST));
        assert!(!HANDLERS.contains(server::MIGRATE_DATA));
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Display);

        let mut ping = BytesMut::new();
        ping.put_u32_le(9);
        ping.put_u64_le(0x1122_3344);
        ping.put_slice(&[0; 16]);
        ctx.process(mini(server::PING, &ping)).await.unwrap();

        let out = written_messages(&mut remote).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, client::PONG);
        let mut expected = BytesMut::new();
        Pong {
            id: 9,
            timestamp: 0x1122_3344,
        }
        .encode(&mut expected);
        assert_eq!(&out[0].1[..], &expected[..]);
    }

    #[tokio::test]
    async fn wait_for_unknown_channel_is_satisfied() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, _remote) = connected(&session, ChannelType::Display);

        let mut wait = BytesMut::new();
        wait.put_u8(1);
        wait.put_u8(ChannelType::Cursor as u8);
        wait.put_u8(3);
        wait.put_u64_le(10);
        let done = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            ctx.process(mini(server::WAIT_FOR_CHANNELS, &wait)),
        )
        .await;
        assert!(matches!(done, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn wait_for_channels_blocks_until_serial() {
        let session = Session::new(SessionConfig::default());
        let (mut waiter, _r1) = connected(&session, ChannelType::Display);
        let (mut target, _r2) = connected(&session, ChannelType::Cursor);

        let mut wait = BytesMut::new();
        wait.put_u8(1);
        wait.put_u8(ChannelType::Cursor as u8);
        wait.put_u8(0);
        wait.put_u64_le(2);

        let barrier = tokio::spawn(async move {
            waiter
                .process(mini(server::WAIT_FOR_CHANNELS, &wait))
                .await
                .map(|()| waiter.channel().last_serial())
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!barrier.is_finished());

        target.process(mini(300, b"")).await.unwrap();
        target.process(mini(300, b"")).await.unwrap();
        let waited = tokio::time::timeout(std::time::Duration::from_secs(1), barrier)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // The barrier message itself is counted once the handler returns.
        assert_eq!(waited, 1);
    }

    #[tokio::test]
    async fn migrate_flush_sends_mark() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Inputs);
        ctx.live.peer_major = 1;
        assert!(ctx.send(ctx.channel().message(client::PONG)));

        let mut flags = BytesMut::new();
        flags.put_u32_le(MigrateFlags::NEED_FLUSH.bits());
        ctx.process(mini(server::MIGRATE, &flags)).await.unwrap();
        assert_eq!(
            written(&mut remote).await,
            vec![client::PONG, client::MIGRATE_FLUSH_MARK]
        );
    }

    #[tokio::test]
    async fn migrate_flush_mark_overtakes_queue_on_current_protocol() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Inputs);
        ctx.live.peer_major = 2;
        assert!(ctx.send(ctx.channel().message(client::PONG)));

        let mut flags = BytesMut::new();
        flags.put_u32_le(MigrateFlags::NEED_FLUSH.bits());
        ctx.process(mini(server::MIGRATE, &flags)).await.unwrap();
        assert_eq!(written(&mut remote).await, vec![client::MIGRATE_FLUSH_MARK]);
        assert_eq!(ctx.channel().queued(), 1);

        ctx.drain_queue().await.unwrap();
        assert_eq!(written(&mut remote).await, vec![client::PONG]);
    }
}
