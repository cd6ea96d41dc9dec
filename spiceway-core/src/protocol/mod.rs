//! Payload layouts the engine interprets itself.
//!
//! Each sub-module defines the base or main channel payloads as plain
//! structs with a [`WireDecode`] and/or [`WireEncode`] implementation.
//! Payloads of other channel kinds are left to external interpreters.

pub mod base;
pub mod main;

use bytes::BytesMut;

use crate::error::SpiceError;

pub use base::{
    AckSync, Disconnecting, Migrate, Notify, NotifySeverity, Ping, Pong, SetAck, WaitForChannel,
    WaitForChannels,
};
pub use main::{
    AgentConnectedTokens, AgentDisconnected, ChannelsList, MainInit, MainName, MainUuid,
    MigrateBeginSeamless, MigrateDstDoSeamless, MigrationDstInfo, MouseMode, MultiMediaTime,
};

// ── Traits ───────────────────────────────────────────────────────

/// A payload the client can decode from a received message.
pub trait WireDecode: Sized {
    /// Name used in parse errors and logs.
    const NAME: &'static str;

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError>;

    /// Decode a whole payload.
    fn from_bytes(data: &[u8]) -> Result<Self, SpiceError> {
        Self::decode(&mut Reader::new(data, Self::NAME))
    }
}

/// A payload the client can marshal into an outgoing message.
pub trait WireEncode {
    fn encode(&self, buf: &mut BytesMut);
}

// ── Reader ───────────────────────────────────────────────────────

/// Bounds-checked little-endian cursor over a payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SpiceError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                SpiceError::parse(
                    self.what,
                    format!("need {n} bytes at {}, have {}", self.pos, self.data.len()),
                )
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, SpiceError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, SpiceError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, SpiceError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, SpiceError> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], SpiceError> {
        self.take(n)
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// `len` bytes at an absolute offset from the payload start.
    ///
    /// Used for pointer fields, which the wire encodes as offsets.
    pub fn at(&self, offset: usize, len: usize) -> Result<&'a [u8], SpiceError> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .map(|end| &self.data[offset..end])
            .ok_or_else(|| SpiceError::parse(self.what, format!("offset {offset}+{len} out of range")))
    }
}

/// Text field that may carry a trailing NUL.
pub fn zero_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
