//! The channel task.
//!
//! [`run`] owns one channel's connection from `connect` until teardown:
//! it runs the link handshake, then loops over three sources (the
//! transmit queue wake-up, state changes and the transport) until the
//! channel is cancelled or fails. Handlers get the [`ChannelContext`]
//! mutably, so message processing on one channel is strictly sequential.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::handshake::{self, LinkOutcome};
use super::live::LiveConnection;
use super::{Channel, base};
use crate::caps::ChannelCaps;
use crate::codec::OutboundFrame;
use crate::error::SpiceError;
use crate::header::HeaderMode;
use crate::message::{client, server};
use crate::packet::{IncomingMessage, OutgoingMessage};
use crate::session::Session;
use crate::state::ChannelState;

/// Reconnect decisions carried across attempts of one task.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Fallback {
    /// Connect over TLS from the start.
    pub(crate) tls: bool,
}

enum Exit {
    Closed,
    Reconnect,
}

// ── ChannelContext ───────────────────────────────────────────────

/// Task-side view of a channel, handed to every message handler.
pub struct ChannelContext {
    channel: Channel,
    pub(crate) live: Box<LiveConnection>,
    ack_window: u32,
    ack_count: u32,
    pub(crate) cancel: CancellationToken,
    pub(crate) reached_ready: bool,
}

impl ChannelContext {
    pub(crate) fn new(channel: Channel, live: Box<LiveConnection>, cancel: CancellationToken) -> Self {
        Self {
            channel,
            live,
            ack_window: 0,
            ack_count: 0,
            cancel,
            reached_ready: false,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn session(&self) -> Result<Session, SpiceError> {
        self.channel
            .session()
            .ok_or(SpiceError::SetupIncomplete("channel has no session"))
    }

    pub fn caps(&self) -> &ChannelCaps {
        &self.live.caps
    }

    /// Major protocol version of the connected peer.
    pub fn peer_major(&self) -> u32 {
        self.live.peer_major
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue `msg` behind everything already pending.
    pub fn send(&self, msg: OutgoingMessage) -> bool {
        self.channel.send(msg)
    }

    /// Write `msg` now, ahead of the transmit queue.
    pub async fn write(&mut self, msg: OutgoingMessage) -> Result<(), SpiceError> {
        self.write_message(msg.into_shared()).await
    }

    pub(crate) async fn write_message(
        &mut self,
        message: Arc<OutgoingMessage>,
    ) -> Result<(), SpiceError> {
        let live = &mut *self.live;
        let transport = live.transport.as_mut().ok_or(SpiceError::ChannelClosed)?;
        let serial = live.out_serial;
        live.out_serial += 1;
        trace!(channel = %self.channel.name(), msg_type = message.msg_type(), serial, "write");
        transport.send(OutboundFrame { serial, message }).await
    }

    /// Write everything queued, oldest first.
    pub(crate) async fn drain_queue(&mut self) -> Result<(), SpiceError> {
        let pending = self.channel.shared.xmit.take_all();
        if pending.is_empty() {
            return Ok(());
        }
        let live = &mut *self.live;
        let transport = live.transport.as_mut().ok_or(SpiceError::ChannelClosed)?;
        for message in pending {
            let serial = live.out_serial;
            live.out_serial += 1;
            transport.feed(OutboundFrame { serial, message }).await?;
        }
        transport.flush().await
    }

    /// Read one message, counting it like any other received message
    /// but without dispatching it.
    pub async fn read_accounted(&mut self) -> Result<Arc<IncomingMessage>, SpiceError> {
        let transport = self.live.transport.as_mut().ok_or(SpiceError::ChannelClosed)?;
        let msg = Arc::new(transport.next().await.ok_or(SpiceError::Eof)??);
        self.count_for_ack().await?;
        self.record_serial(&msg);
        Ok(msg)
    }

    /// Adopt a new ack window, as requested by the server.
    pub(crate) fn set_ack_window(&mut self, window: u32) {
        self.ack_window = window;
        self.ack_count = window;
    }

    // ── Task body ────────────────────────────────────────────────

    async fn connect_and_serve(&mut self, fallback: &mut Fallback) -> Result<Exit, SpiceError> {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Exit::Closed),
            outcome = handshake::link(self, fallback) => outcome?,
        };
        match outcome {
            LinkOutcome::Ready => {}
            LinkOutcome::Downgrade => {
                let session = self.session()?;
                session.set_protocol_major(crate::header::OLD_VERSION_MAJOR);
                return Ok(Exit::Reconnect);
            }
            LinkOutcome::SwitchTls => {
                fallback.tls = true;
                return Ok(Exit::Reconnect);
            }
        }
        self.serve().await?;
        Ok(Exit::Closed)
    }

    async fn serve(&mut self) -> Result<(), SpiceError> {
        let shared = Arc::clone(&self.channel.shared);
        loop {
            if self.channel.state() == ChannelState::Migrating {
                if !self.park().await? {
                    return Ok(());
                }
                continue;
            }

            let transport = self.live.transport.as_mut().ok_or(SpiceError::ChannelClosed)?;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = shared.xmit.notified() => self.drain_queue().await?,
                _ = shared.state_notify.notified() => {}
                next = transport.next() => {
                    let msg = next.ok_or(SpiceError::Eof)??;
                    self.process(msg).await?;
                }
            }
        }
    }

    /// Leave the live connection in the parked slot until the channel
    /// stops migrating. Returns `false` if cancelled meanwhile.
    async fn park(&mut self) -> Result<bool, SpiceError> {
        let shared = Arc::clone(&self.channel.shared);
        *shared.parked.lock() = Some(std::mem::take(&mut self.live));
        shared.main_ctx.iterate();
        debug!(channel = %self.channel.name(), "parked for migration");

        let channel = self.channel.clone();
        let resumed = move || channel.state() != ChannelState::Migrating;
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = shared.main_ctx.condition_wait(resumed, &shared.canceller) => {}
        }

        if let Some(live) = shared.parked.lock().take() {
            self.live = live;
        }
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        if shared.up_pending.swap(false, Ordering::AcqRel) && self.channel.state().is_ready() {
            debug!(channel = %self.channel.name(), "resumed on a migrated connection");
            let kind = Arc::clone(&shared.kind);
            kind.on_up(self).await?;
        }
        Ok(true)
    }

    pub(crate) async fn process(&mut self, msg: IncomingMessage) -> Result<(), SpiceError> {
        let msg = Arc::new(msg);
        if msg.msg_type() == server::LIST || msg.sub_list() != 0 {
            for child in msg.sub_messages()? {
                self.dispatch(Arc::new(child)).await?;
            }
        }
        self.count_for_ack().await?;
        if msg.msg_type() != server::LIST {
            self.dispatch(Arc::clone(&msg)).await?;
        }
        self.record_serial(&msg);
        Ok(())
    }

    async fn count_for_ack(&mut self) -> Result<(), SpiceError> {
        if self.ack_count == 0 {
            return Ok(());
        }
        self.ack_count -= 1;
        if self.ack_count == 0 {
            let ack = self.channel.message(client::ACK);
            self.write(ack).await?;
            self.ack_count = self.ack_window;
        }
        Ok(())
    }

    fn record_serial(&mut self, msg: &IncomingMessage) {
        let mode = self.live.transport.as_ref().map(|t| t.codec().mode());
        let serial = match mode {
            Some(HeaderMode::Full) => msg.serial(),
            _ => self.live.in_serial,
        };
        self.channel.shared.last_serial.store(serial, Ordering::Release);
        self.live.in_serial += 1;
        self.channel.shared.main_ctx.iterate();
    }

    async fn dispatch(&mut self, msg: Arc<IncomingMessage>) -> Result<(), SpiceError> {
        let shared = Arc::clone(&self.channel.shared);
        let msg_type = msg.msg_type();

        if msg_type >= server::BASE_LAST && shared.disabled {
            debug!(channel = %shared.name, msg_type, "channel disabled, dropping message");
            return Ok(());
        }
        if !shared.kind.filter(self.channel.state(), msg_type) {
            debug!(channel = %shared.name, msg_type, "message filtered");
            return Ok(());
        }

        let handler = shared
            .kind
            .handlers()
            .get(msg_type)
            .or_else(|| base::HANDLERS.get(msg_type))
            .copied();
        match handler {
            Some(handler) => {
                if let Some(parse) = handler.parse {
                    let parsed = parse(msg.data()).inspect_err(|e| {
                        error!(channel = %shared.name, msg = handler.name, error = %e, "failed to parse message");
                    })?;
                    msg.set_parsed(parsed);
                }
                trace!(channel = %shared.name, msg = handler.name, "dispatch");
                (handler.handle)(self, msg).await
            }
            None if msg_type >= server::BASE_LAST && shared.kind.forward_unhandled() => {
                self.forward(msg).await
            }
            None => {
                error!(channel = %shared.name, msg_type, "no handler for message");
                Ok(())
            }
        }
    }

    /// Hand a payload message to the session's sink.
    pub(crate) async fn forward(&mut self, msg: Arc<IncomingMessage>) -> Result<(), SpiceError> {
        let Some(sink) = self.session()?.payload_sink() else {
            trace!(channel = %self.channel.name(), msg_type = msg.msg_type(), "no payload sink");
            return Ok(());
        };
        if sink.send((self.channel.id(), msg)).await.is_err() {
            debug!(channel = %self.channel.name(), "payload sink closed");
        }
        Ok(())
    }

    fn into_live(self) -> Box<LiveConnection> {
        self.live
    }
}

// ── Task ─────────────────────────────────────────────────────────

/// Body of a channel task, from connect to teardown.
pub(crate) async fn run(channel: Channel) {
    let shared = Arc::clone(&channel.shared);
    let mut fallback = Fallback::default();

    loop {
        let cancel = shared.cancel.lock().clone();
        let live = shared.parked.lock().take().unwrap_or_default();
        let mut ctx = ChannelContext::new(channel.clone(), live, cancel.clone());

        let result = ctx.connect_and_serve(&mut fallback).await;
        let reached_ready = ctx.reached_ready;
        let mut live = ctx.into_live();
        live.reset();
        shared.xmit.clear();
        *shared.parked.lock() = Some(live);

        let reconnect = match &result {
            Ok(Exit::Reconnect) => !cancel.is_cancelled(),
            Ok(Exit::Closed) => channel.state() == ChannelState::Switching,
            Err(_) => false,
        };
        if reconnect {
            if channel.state() == ChannelState::Switching {
                info!(channel = %shared.name, "reconnecting to the new host");
                fallback = Fallback::default();
                *shared.cancel.lock() = CancellationToken::new();
            } else {
                info!(channel = %shared.name, tls = fallback.tls, "reconnecting");
            }
            shared.xmit.unblock();
            channel.set_state(ChannelState::Unconnected);
            channel.set_state(ChannelState::Connecting);
            continue;
        }

        shared.task_running.store(false, Ordering::Release);
        channel.set_state(ChannelState::Unconnected);
        match result {
            Err(e) => {
                let event = e.channel_event(reached_ready);
                warn!(channel = %shared.name, error = %e, %event, "channel failed");
                channel.emit_event(event).await;
            }
            Ok(_) => info!(channel = %shared.name, "channel closed"),
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::{connected, mini, written};
    use crate::header::DataHeader;
    use crate::message::ChannelType;
    use crate::session::{Session, SessionConfig};
    use bytes::{BufMut, BytesMut};

    #[tokio::test]
    async fn mini_header_serials_count_messages() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, _remote) = connected(&session, ChannelType::Display);
        for n in 1..=5u64 {
            ctx.process(mini(300, b"x")).await.unwrap();
            assert_eq!(ctx.channel().last_serial(), n);
        }
    }

    #[tokio::test]
    async fn ack_every_window() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Display);

        let mut set_ack = BytesMut::new();
        set_ack.put_u32_le(7);
        set_ack.put_u32_le(3);
        ctx.process(mini(server::SET_ACK, &set_ack)).await.unwrap();
        assert_eq!(written(&mut remote).await, vec![client::ACK_SYNC]);

        // The window counts messages received after the SetAck.
        ctx.process(mini(300, b"")).await.unwrap();
        ctx.process(mini(300, b"")).await.unwrap();
        assert!(written(&mut remote).await.is_empty());
        ctx.process(mini(300, b"")).await.unwrap();
        assert_eq!(written(&mut remote).await, vec![client::ACK]);

        for _ in 0..3 {
            ctx.process(mini(300, b"")).await.unwrap();
        }
        assert_eq!(written(&mut remote).await, vec![client::ACK]);
    }

    #[tokio::test]
    async fn list_dispatches_each_child() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let session = Session::builder(SessionConfig::default())
            .payload_sink(tx)
            .build();
        let (mut ctx, _remote) = connected(&session, ChannelType::Cursor);

        let mut body = BytesMut::new();
        let mut offsets = Vec::new();
        for ty in [201u16, 202, 203] {
            offsets.push(body.len() as u32);
            body.put_u16_le(ty);
            body.put_u32_le(1);
            body.put_u8(0xaa);
        }
        let table = body.len() as u32;
        body.put_u16_le(3);
        for off in offsets {
            body.put_u32_le(off);
        }
        let list = IncomingMessage::new(
            DataHeader {
                msg_type: server::LIST,
                size: body.len() as u32,
                serial: 0,
                sub_list: table,
            },
            body.freeze(),
        );
        ctx.process(list).await.unwrap();

        let mut types = Vec::new();
        while let Ok((id, msg)) = rx.try_recv() {
            assert_eq!(id, ctx.channel().id());
            assert!(msg.parent().is_some());
            types.push(msg.msg_type());
        }
        assert_eq!(types, vec![201, 202, 203]);
        assert_eq!(ctx.channel().last_serial(), 1);
    }

    #[tokio::test]
    async fn disabled_channel_drops_payload() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let config = SessionConfig {
            disabled_channels: vec!["playback".into()],
            ..Default::default()
        };
        let session = Session::builder(config).payload_sink(tx).build();
        let (mut ctx, _remote) = connected(&session, ChannelType::Playback);
        assert!(ctx.channel().is_disabled());
        ctx.process(mini(101, b"pcm")).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.channel().last_serial(), 1);
    }

    #[tokio::test]
    async fn parse_failure_is_fatal() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, _remote) = connected(&session, ChannelType::Display);
        let err = ctx.process(mini(server::SET_ACK, &[1, 2])).await.unwrap_err();
        assert!(matches!(err, SpiceError::Parse { .. }));
    }

    #[tokio::test]
    async fn queue_drains_in_order() {
        let session = Session::new(SessionConfig::default());
        let (mut ctx, mut remote) = connected(&session, ChannelType::Inputs);
        for ty in [client::ACK, client::PONG, client::ACK_SYNC] {
            assert!(ctx.send(ctx.channel().message(ty)));
        }
        ctx.drain_queue().await.unwrap();
        assert_eq!(
            written(&mut remote).await,
            vec![client::ACK, client::PONG, client::ACK_SYNC]
        );
        assert_eq!(ctx.live.out_serial, 4);
    }
}
