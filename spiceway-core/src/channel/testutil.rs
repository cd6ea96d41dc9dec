//! Helpers for driving a channel context over an in-memory pipe.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::codec::{Decoder, Framed};

use super::ChannelContext;
use crate::codec::MessageCodec;
use crate::header::{DataHeader, HeaderMode};
use crate::message::ChannelType;
use crate::network::boxed;
use crate::packet::IncomingMessage;
use crate::session::Session;
use crate::state::ChannelState;

/// A `Ready` context for a new channel whose peer end is returned.
pub(crate) fn connected(session: &Session, ty: ChannelType) -> (ChannelContext, DuplexStream) {
    connected_as(session, ty, 0)
}

pub(crate) fn connected_as(
    session: &Session,
    ty: ChannelType,
    id: u8,
) -> (ChannelContext, DuplexStream) {
    let channel = session.channel_new(ty, id);
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let mut live = channel.shared.parked.lock().take().unwrap();
    live.transport = Some(Framed::new(boxed(local), MessageCodec::new(HeaderMode::Mini)));
    channel.set_state(ChannelState::Ready);
    let cancel = channel.shared.cancel.lock().clone();
    (ChannelContext::new(channel, live, cancel), remote)
}

pub(crate) fn mini(msg_type: u16, payload: &[u8]) -> IncomingMessage {
    IncomingMessage::new(
        DataHeader {
            msg_type,
            size: payload.len() as u32,
            serial: 0,
            sub_list: 0,
        },
        Bytes::copy_from_slice(payload),
    )
}

/// Messages the context wrote to the pipe, as `(type, payload)`.
pub(crate) async fn written_messages(remote: &mut DuplexStream) -> Vec<(u16, Bytes)> {
    let mut raw = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_millis(100), remote.read(&mut raw))
        .await
        .map_or(0, |r| r.unwrap());
    let mut buf = BytesMut::from(&raw[..n]);
    let mut codec = MessageCodec::new(HeaderMode::Mini);
    let mut out = Vec::new();
    while let Some(msg) = codec.decode(&mut buf).unwrap() {
        out.push((msg.msg_type(), msg.to_bytes()));
    }
    out
}

pub(crate) async fn written(remote: &mut DuplexStream) -> Vec<u16> {
    written_messages(remote)
        .await
        .into_iter()
        .map(|(ty, _)| ty)
        .collect()
}
