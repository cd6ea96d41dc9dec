//! Data-phase framing for `tokio_util::codec::Framed`.
//!
//! [`MessageCodec`] decodes `header + payload` into an [`IncomingMessage`]
//! and encodes an [`OutboundFrame`] with the header shape negotiated for
//! the connection. The mode is fixed for the codec's lifetime.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SpiceError;
use crate::header::{DataHeader, HeaderMode};
use crate::packet::{IncomingMessage, MAX_MESSAGE_SIZE, OutgoingMessage};

/// One message ready for the wire, with the serial assigned at write time.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub serial: u64,
    pub message: Arc<OutgoingMessage>,
}

/// Codec for the post-handshake message stream.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    mode: HeaderMode,
    bytes_read: u64,
    bytes_written: u64,
}

impl MessageCodec {
    pub fn new(mode: HeaderMode) -> Self {
        Self {
            mode,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn mode(&self) -> HeaderMode {
        self.mode
    }

    /// Total bytes of complete messages decoded so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Decoder for MessageCodec {
    type Item = IncomingMessage;
    type Error = SpiceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header_size = self.mode.size();
        if src.len() < header_size {
            return Ok(None);
        }

        let header = DataHeader::decode(self.mode, &src[..header_size])?;
        let size = header.size as usize;
        if size > MAX_MESSAGE_SIZE {
            return Err(SpiceError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if src.len() < header_size + size {
            src.reserve(header_size + size - src.len());
            return Ok(None);
        }

        src.advance(header_size);
        let payload = src.split_to(size).freeze();
        self.bytes_read += (header_size + size) as u64;
        Ok(Some(IncomingMessage::new(header, payload)))
    }
}

impl Encoder<OutboundFrame> for MessageCodec {
    type Error = SpiceError;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.message.payload();
        let header = DataHeader {
            msg_type: item.message.msg_type(),
            size: payload.len() as u32,
            serial: item.serial,
            sub_list: 0,
        };
        dst.reserve(self.mode.size() + payload.len());
        header.encode(self.mode, dst);
        dst.extend_from_slice(payload);
        self.bytes_written += (self.mode.size() + payload.len()) as u64;
        Ok(())
    }
}
