//! Main channel payloads handled by the engine.
//!
//! Pointer fields (host, certificate subject) are encoded on the wire as
//! `u32` offsets from the start of the message payload.

use bytes::{BufMut, BytesMut};

use super::{Reader, WireDecode, WireEncode, zero_terminated};
use crate::error::SpiceError;

// ── Init / ChannelsList ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MainInit {
    pub session_id: u32,
    pub display_channels_hint: u32,
    pub supported_mouse_modes: u32,
    pub current_mouse_mode: u32,
    pub agent_connected: u32,
    pub agent_tokens: u32,
    pub multi_media_time: u32,
    pub ram_hint: u32,
}

impl WireDecode for MainInit {
    const NAME: &'static str = "MainInit";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            session_id: r.u32()?,
            display_channels_hint: r.u32()?,
            supported_mouse_modes: r.u32()?,
            current_mouse_mode: r.u32()?,
            agent_connected: r.u32()?,
            agent_tokens: r.u32()?,
            multi_media_time: r.u32()?,
            ram_hint: r.u32()?,
        })
    }
}

impl WireEncode for MainInit {
    fn encode(&self, buf: &mut BytesMut) {
        for v in [
            self.session_id,
            self.display_channels_hint,
            self.supported_mouse_modes,
            self.current_mouse_mode,
            self.agent_connected,
            self.agent_tokens,
            self.multi_media_time,
            self.ram_hint,
        ] {
            buf.put_u32_le(v);
        }
    }
}

/// Channels the server offers, as raw `(type, id)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelsList {
    pub channels: Vec<(u8, u8)>,
}

impl WireDecode for ChannelsList {
    const NAME: &'static str = "ChannelsList";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        let count = r.u32()?;
        let mut channels = Vec::new();
        for _ in 0..count {
            channels.push((r.u8()?, r.u8()?));
        }
        Ok(Self { channels })
    }
}

impl WireEncode for ChannelsList {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.channels.len() as u32);
        for (t, id) in &self.channels {
            buf.put_u8(*t);
            buf.put_u8(*id);
        }
    }
}

// ── Server info ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainName {
    pub name: String,
}

impl WireDecode for MainName {
    const NAME: &'static str = "MainName";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        let len = r.u32()? as usize;
        Ok(Self {
            name: zero_terminated(r.bytes(len)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainUuid {
    pub uuid: [u8; 16],
}

impl WireDecode for MainUuid {
    const NAME: &'static str = "MainUuid";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(r.bytes(16)?);
        Ok(Self { uuid })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseMode {
    pub supported_modes: u32,
    pub current_mode: u32,
}

impl WireDecode for MouseMode {
    const NAME: &'static str = "MouseMode";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            supported_modes: r.u32()?,
            current_mode: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiMediaTime {
    pub time: u32,
}

impl WireDecode for MultiMediaTime {
    const NAME: &'static str = "MultiMediaTime";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self { time: r.u32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentDisconnected {
    pub error_code: u32,
}

impl WireDecode for AgentDisconnected {
    const NAME: &'static str = "AgentDisconnected";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            error_code: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConnectedTokens {
    pub num_tokens: u32,
}

impl WireDecode for AgentConnectedTokens {
    const NAME: &'static str = "AgentConnectedTokens";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            num_tokens: r.u32()?,
        })
    }
}

// ── Migration ────────────────────────────────────────────────────

/// Where a migrating session should reconnect.
///
/// Carried by `MigrateBegin`, `MigrateBeginSeamless` and (with the same
/// layout) `MigrateSwitchHost`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationDstInfo {
    pub port: u16,
    pub sport: u16,
    pub host: String,
    pub cert_subject: Option<String>,
}

impl MigrationDstInfo {
    /// Size of the fixed fields.
    pub const FIXED_SIZE: usize = 20;

    /// Write the fixed fields, assuming the whole message has `fixed_len`
    /// bytes of fixed fields before the variable data starts.
    fn encode_fixed(&self, buf: &mut BytesMut, fixed_len: usize) {
        let host_size = self.host.len() + 1;
        let subject_size = self.cert_subject.as_ref().map_or(0, |s| s.len() + 1);
        buf.put_u16_le(self.port);
        buf.put_u16_le(self.sport);
        buf.put_u32_le(host_size as u32);
        buf.put_u32_le(fixed_len as u32);
        buf.put_u32_le(subject_size as u32);
        buf.put_u32_le(if subject_size == 0 {
            0
        } else {
            (fixed_len + host_size) as u32
        });
    }

    fn encode_data(&self, buf: &mut BytesMut) {
        buf.put_slice(self.host.as_bytes());
        buf.put_u8(0);
        if let Some(subject) = &self.cert_subject {
            buf.put_slice(subject.as_bytes());
            buf.put_u8(0);
        }
    }
}

impl WireDecode for MigrationDstInfo {
    const NAME: &'static str = "MigrationDstInfo";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        let port = r.u16()?;
        let sport = r.u16()?;
        let host_size = r.u32()? as usize;
        let host_offset = r.u32()? as usize;
        let subject_size = r.u32()? as usize;
        let subject_offset = r.u32()? as usize;

        if host_size == 0 {
            return Err(SpiceError::parse(Self::NAME, "empty host"));
        }
        let host = zero_terminated(r.at(host_offset, host_size)?);
        let cert_subject = match subject_size {
            0 => None,
            n => Some(zero_terminated(r.at(subject_offset, n)?)).filter(|s| !s.is_empty()),
        };
        Ok(Self {
            port,
            sport,
            host,
            cert_subject,
        })
    }
}

impl WireEncode for MigrationDstInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.encode_fixed(buf, Self::FIXED_SIZE);
        self.encode_data(buf);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrateBeginSeamless {
    pub dst_info: MigrationDstInfo,
    pub src_mig_version: u32,
}

impl WireDecode for MigrateBeginSeamless {
    const NAME: &'static str = "MigrateBeginSeamless";

    fn decode(r: &mut Reader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            dst_info: MigrationDstInfo::decode(r)?,
            src_mig_version: r.u32()?,
        })
    }
}

impl WireEncode for MigrateBeginSeamless {
    fn encode(&self, buf: &mut BytesMut) {
        self.dst_info
            .encode_fixed(buf, MigrationDstInfo::FIXED_SIZE + 4);
        buf.put_u32_le(self.src_mig_version);
        self.dst_info.encode_data(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateDstDoSeamless {
    pub src_version: u32,
}

impl WireEncode for MigrateDstDoSeamless {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.src_version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_info_offsets() {
        let info = MigrationDstInfo {
            port: 5900,
            sport: 5901,
            host: "dst.example".into(),
            cert_subject: Some("CN=dst".into()),
        };
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(&buf[20..32], b"dst.example\0");
        assert_eq!(MigrationDstInfo::from_bytes(&buf).unwrap(), info);
    }

    #[test]
    fn seamless_begin_carries_version() {
        let begin = MigrateBeginSeamless {
            dst_info: MigrationDstInfo {
                port: 1,
                sport: 0,
                host: "h".into(),
                cert_subject: None,
            },
            src_mig_version: 1,
        };
        let mut buf = BytesMut::new();
        begin.encode(&mut buf);
        assert_eq!(MigrateBeginSeamless::from_bytes(&buf).unwrap(), begin);
    }

    #[test]
    fn dst_info_bad_offset() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(1);
        buf.put_u16_le(2);
        buf.put_u32_le(5);
        buf.put_u32_le(400);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        assert!(MigrationDstInfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn channels_list() {
        let mut buf = BytesMut::new();
        ChannelsList {
            channels: vec![(2, 0), (4, 0), (3, 0)],
        }
        .encode(&mut buf);
        let list = ChannelsList::from_bytes(&buf).unwrap();
        assert_eq!(list.channels, vec![(2, 0), (4, 0), (3, 0)]);
    }
}
