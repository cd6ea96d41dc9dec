//! Messages every channel kind understands.
//!
//! ```text
//! Server ──[SetAck {generation, window}]──────► Client
//! Client ──[AckSync {generation}]─────────────► Server
//! Client ──[Ack]──────────────────────────────► Server   (every `window` messages)
//!
//! Server ──[Ping {id, timestamp, data}]───────► Client
//! Client ──[Pong {id, timestamp}]─────────────► Server
//!
//! Server ──[WaitForChannels [(type, id, serial)]]► Client
//! Server ──[Migrate {flags}]──────────────────► Client
//! ```

use bytes::{BufMut, BytesMut};

use super::{Reader, WireDecode, WireEncode, zero_terminated};
use crate::error::SpiceError;
use crate::flags::MigrateFlags;

// ── Ack ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetAck {
    pub generation: u32,
    pub window: u32,
}

impl WireDecode for SetAck {
    const NAME: &'static str = "SetAck";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            generation: r.u32()?,
            window: r.u32()?,
        })
    }
}

impl WireEncode for SetAck {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.generation);
        buf.put_u32_le(self.window);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSync {
    pub generation: u32,
}

impl WireEncode for AckSync {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.generation);
    }
}

// ── Ping ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u32,
    pub timestamp: u64,
    /// Length of the padding the server attached.
    pub data_len: usize,
}

impl WireDecode for Ping {
    const NAME: &'static str = "Ping";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            id: r.u32()?,
            timestamp: r.u64()?,
            data_len: r.rest().len(),
        })
    }
}

impl WireEncode for Ping {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.id);
        buf.put_u64_le(self.timestamp);
        buf.put_bytes(0, self.data_len);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub id: u32,
    pub timestamp: u64,
}

impl WireEncode for Pong {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.id);
        buf.put_u64_le(self.timestamp);
    }
}

// ── WaitForChannels ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForChannel {
    pub channel_type: u8,
    pub channel_id: u8,
    pub serial: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForChannels {
    pub wait_list: Vec<WaitForChannel>,
}

impl WireDecode for WaitForChannels {
    const NAME: &'static str = "WaitForChannels";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        let count = r.u8()?;
        let wait_list = (0..count)
            .map(|_| -> Result<WaitForChannel, SpiceError> {
                Ok(WaitForChannel {
                    channel_type: r.u8()?,
                    channel_id: r.u8()?,
                    serial: r.u64()?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { wait_list })
    }
}

impl WireEncode for WaitForChannels {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.wait_list.len() as u8);
        for w in &self.wait_list {
            buf.put_u8(w.channel_type);
            buf.put_u8(w.channel_id);
            buf.put_u64_le(w.serial);
        }
    }
}

// ── Disconnecting / Notify ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnecting {
    pub time_stamp: u64,
    pub reason: u32,
}

impl WireDecode for Disconnecting {
    const NAME: &'static str = "Disconnecting";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            time_stamp: r.u64()?,
            reason: r.u32()?,
        })
    }
}

/// Severity of a server notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifySeverity {
    Info,
    Warn,
    Error,
}

impl From<u32> for NotifySeverity {
    fn from(v: u32) -> Self {
        match v {
            0 => NotifySeverity::Info,
            1 => NotifySeverity::Warn,
            _ => NotifySeverity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub time_stamp: u64,
    pub severity: NotifySeverity,
    pub visibility: u32,
    pub what: u32,
    pub message: String,
}

impl WireDecode for Notify {
    const NAME: &'static str = "Notify";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        let time_stamp = r.u64()?;
        let severity = r.u32()?.into();
        let visibility = r.u32()?;
        let what = r.u32()?;
        let len = r.u32()? as usize;
        let message = zero_terminated(r.bytes(len)?);
        Ok(Self {
            time_stamp,
            severity,
            visibility,
            what,
            message,
        })
    }
}

// ── Migrate ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migrate {
    pub flags: MigrateFlags,
}

impl WireDecode for Migrate {
    const NAME: &'static str = "Migrate";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            flags: MigrateFlags::from_bits_truncate(r.u32()?),
        })
    }
}

impl WireEncode for Migrate {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.flags.bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_ack_decode() {
        let mut buf = BytesMut::new();
        SetAck {
            generation: 3,
            window: 20,
        }
        .encode(&mut buf);
        let ack = SetAck::from_bytes(&buf).unwrap();
        assert_eq!(ack.generation, 3);
        assert_eq!(ack.window, 20);
        assert!(SetAck::from_bytes(&buf[..7]).is_err());
    }

    #[test]
    fn ping_keeps_padding_length() {
        let mut buf = BytesMut::new();
        Ping {
            id: 1,
            timestamp: 99,
            data_len: 256,
        }
        .encode(&mut buf);
        let ping = Ping::from_bytes(&buf).unwrap();
        assert_eq!(ping.data_len, 256);
        assert_eq!(ping.timestamp, 99);
    }

    #[test]
    fn wait_for_channels_truncated() {
        let mut buf = BytesMut::new();
        WaitForChannels {
            wait_list: vec![
                WaitForChannel {
                    channel_type: 2,
                    channel_id: 0,
                    serial: 10,
                },
                WaitForChannel {
                    channel_type: 4,
                    channel_id: 0,
                    serial: 7,
                },
            ],
        }
        .encode(&mut buf);
        let wait = WaitForChannels::from_bytes(&buf).unwrap();
        assert_eq!(wait.wait_list.len(), 2);
        assert_eq!(wait.wait_list[1].serial, 7);
        assert!(WaitForChannels::from_bytes(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn notify_message_text() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        buf.put_u32_le(1);
        buf.put_u32_le(0);
        buf.put_u32_le(5);
        buf.put_u32_le(6);
        buf.put_slice(b"hello\0");
        let n = Notify::from_bytes(&buf).unwrap();
        assert_eq!(n.severity, NotifySeverity::Warn);
        assert_eq!(n.message, "hello");
    }
}
