//! Incoming and outgoing message envelopes.
//!
//! An [`IncomingMessage`] either owns its payload bytes or, when it was
//! extracted from a `LIST` container, borrows a range of its parent's
//! payload while holding a strong reference to the parent. The parent never
//! references its children, so plain `Arc` counting suffices.
//!
//! An [`OutgoingMessage`] is a builder for one wire message. It is shared
//! through the transmit queue as an `Arc`; the serial and header are
//! assigned when it is written.

use std::any::Any;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::SpiceError;
use crate::header::DataHeader;
use crate::message::{ChannelType, client};

/// Upper bound on a declared message payload.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Size of a sub-message header (`type:u16, size:u32`).
pub const SUB_HEADER_SIZE: usize = 6;

// ── IncomingMessage ──────────────────────────────────────────────

enum Payload {
    Owned(Bytes),
    Borrowed {
        parent: Arc<IncomingMessage>,
        range: Range<usize>,
    },
}

/// One received message.
pub struct IncomingMessage {
    header: DataHeader,
    payload: Payload,
    parsed: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl IncomingMessage {
    pub fn new(header: DataHeader, data: Bytes) -> Self {
        Self {
            header,
            payload: Payload::Owned(data),
            parsed: OnceLock::new(),
        }
    }

    pub fn header(&self) -> &DataHeader {
        &self.header
    }

    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }

    pub fn size(&self) -> u32 {
        self.header.size
    }

    /// Serial from a full header; zero under mini headers.
    pub fn serial(&self) -> u64 {
        self.header.serial
    }

    pub fn sub_list(&self) -> u32 {
        self.header.sub_list
    }

    /// The container this message was extracted from, if any.
    pub fn parent(&self) -> Option<&Arc<IncomingMessage>> {
        match &self.payload {
            Payload::Owned(_) => None,
            Payload::Borrowed { parent, .. } => Some(parent),
        }
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Owned(bytes) => bytes,
            Payload::Borrowed { parent, range } => &parent.data()[range.clone()],
        }
    }

    /// Payload as a cheaply cloneable buffer, sharing storage when possible.
    pub fn to_bytes(&self) -> Bytes {
        match &self.payload {
            Payload::Owned(bytes) => bytes.clone(),
            Payload::Borrowed { parent, range } => parent.to_bytes().slice(range.clone()),
        }
    }

    /// Attach the decoded form of the payload. Only the first call sticks.
    pub fn set_parsed(&self, parsed: Box<dyn Any + Send + Sync>) {
        let _ = self.parsed.set(parsed);
    }

    /// The decoded payload, if it was attached and has type `T`.
    pub fn parsed<T: Any>(&self) -> Option<&T> {
        self.parsed.get().and_then(|p| p.downcast_ref::<T>())
    }

    /// Like [`parsed`](Self::parsed) but reports a missing payload as an error.
    pub fn parsed_as<T: Any>(&self) -> Result<&T, SpiceError> {
        self.parsed::<T>()
            .ok_or(SpiceError::ProtocolViolation("handler ran without its parsed payload"))
    }

    /// Split a container into its sub-messages.
    ///
    /// The table at `sub_list` is `count:u16` followed by `count` offsets,
    /// each pointing at a `{type:u16, size:u32}` header and its body.
    /// Children share the parent's bytes and inherit its serial.
    pub fn sub_messages(self: &Arc<Self>) -> Result<Vec<IncomingMessage>, SpiceError> {
        let data = self.data();
        let table = self.sub_list() as usize;
        let mut b = data
            .get(table..)
            .filter(|t| t.len() >= 2)
            .ok_or_else(|| SpiceError::parse("sub-message list", "table out of range"))?;
        let count = b.get_u16_le() as usize;
        if b.len() < count * 4 {
            return Err(SpiceError::parse("sub-message list", "offsets out of range"));
        }

        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = b.get_u32_le() as usize;
            let mut sub = data
                .get(offset..)
                .filter(|s| s.len() >= SUB_HEADER_SIZE)
                .ok_or_else(|| SpiceError::parse("sub-message", "header out of range"))?;
            let msg_type = sub.get_u16_le();
            let size = sub.get_u32_le();
            let start = offset + SUB_HEADER_SIZE;
            let end = start
                .checked_add(size as usize)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| SpiceError::parse("sub-message", "body out of range"))?;

            children.push(IncomingMessage {
                header: DataHeader {
                    msg_type,
                    size,
                    serial: self.serial(),
                    sub_list: 0,
                },
                payload: Payload::Borrowed {
                    parent: Arc::clone(self),
                    range: start..end,
                },
                parsed: OnceLock::new(),
            });
        }
        Ok(children)
    }
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("msg_type", &self.header.msg_type)
            .field("size", &self.header.size)
            .field("serial", &self.header.serial)
            .field("sub_list", &self.header.sub_list)
            .field("has_parent", &self.parent().is_some())
            .finish()
    }
}

// ── OutgoingMessage ──────────────────────────────────────────────

/// `true` if a message of this type must not be sent while read-only.
pub fn blocked_when_read_only(channel_type: ChannelType, msg_type: u16) -> bool {
    if msg_type < client::BASE_LAST {
        return false;
    }
    match channel_type {
        ChannelType::Main => !matches!(
            msg_type,
            client::main::CLIENT_INFO
                | client::main::MIGRATE_CONNECTED
                | client::main::MIGRATE_CONNECT_ERROR
                | client::main::ATTACH_CHANNELS
                | client::main::MIGRATE_END
        ),
        ChannelType::Display => false,
        _ => true,
    }
}

/// Builder for one outgoing message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    msg_type: u16,
    payload: BytesMut,
    ro_check: bool,
}

impl OutgoingMessage {
    /// Start a message of `msg_type` for a channel of `channel_type`.
    pub fn new(channel_type: ChannelType, msg_type: u16) -> Self {
        Self {
            msg_type,
            payload: BytesMut::new(),
            ro_check: blocked_when_read_only(channel_type, msg_type),
        }
    }

    /// Message with a prebuilt payload.
    pub fn with_payload(channel_type: ChannelType, msg_type: u16, payload: &[u8]) -> Self {
        let mut msg = Self::new(channel_type, msg_type);
        msg.payload.extend_from_slice(payload);
        msg
    }

    /// Override the read-only policy for this message.
    pub fn with_ro_check(mut self, ro_check: bool) -> Self {
        self.ro_check = ro_check;
        self
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    /// Growable payload buffer; write with [`bytes::BufMut`].
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the read-only policy applies to this message.
    pub fn ro_check(&self) -> bool {
        self.ro_check
    }

    pub fn into_shared(self) -> Arc<OutgoingMessage> {
        Arc::new(self)
    }
}
