//! Fixed-layout structures of the link handshake and the data header.
//!
//! ## Wire format
//!
//! All integers are little-endian.
//!
//! **Link header** (16 bytes):
//! ```text
//! magic:          u32  "REDQ"
//! major_version:  u32
//! minor_version:  u32
//! size:           u32  (bytes following the header)
//! ```
//!
//! **Link message** (18 bytes + capability words):
//! ```text
//! connection_id:     u32
//! channel_type:      u8
//! channel_id:        u8
//! num_common_caps:   u32
//! num_channel_caps:  u32
//! caps_offset:       u32
//! ```
//!
//! **Link reply** (178 bytes + capability words at `caps_offset`):
//! ```text
//! error:             u32
//! pub_key:           [u8; 162]
//! num_common_caps:   u32
//! num_channel_caps:  u32
//! caps_offset:       u32
//! ```
//!
//! **Data header**, full (18 bytes) or mini (6 bytes):
//! ```text
//! full:  serial u64 | type u16 | size u32 | sub_list u32
//! mini:  type u16 | size u32
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::caps::CapabilitySet;
use crate::error::SpiceError;

// ── Constants ────────────────────────────────────────────────────

/// `"REDQ"` read as a little-endian `u32`.
pub const SPICE_MAGIC: u32 = u32::from_le_bytes(*b"REDQ");

/// Current protocol version.
pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 2;

/// Oldest protocol version, used when the peer rejects the current one.
pub const OLD_VERSION_MAJOR: u32 = 1;
pub const OLD_VERSION_MINOR: u32 = 3;

/// DER SubjectPublicKeyInfo of a 1024-bit RSA key.
pub const TICKET_PUBKEY_BYTES: usize = 1024 / 8 + 34;

/// Minor version paired with a major version we speak.
pub fn minor_for(major: u32) -> u32 {
    if major == OLD_VERSION_MAJOR {
        OLD_VERSION_MINOR
    } else {
        VERSION_MINOR
    }
}

fn ensure_len(data: &[u8], need: usize, what: &str) -> Result<(), SpiceError> {
    if data.len() < need {
        return Err(SpiceError::Link(format!(
            "{what} too short: {} < {need}",
            data.len()
        )));
    }
    Ok(())
}

// ── LinkHeader ───────────────────────────────────────────────────

/// Preamble of both link message and link reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    pub magic: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub size: u32,
}

impl LinkHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 16;

    pub fn new(major_version: u32, size: u32) -> Self {
        Self {
            magic: SPICE_MAGIC,
            major_version,
            minor_version: minor_for(major_version),
            size,
        }
    }

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.major_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Deserialize from bytes. Does not check the magic.
    pub fn decode(data: &[u8]) -> Result<Self, SpiceError> {
        ensure_len(data, Self::SIZE, "link header")?;
        let mut b = data;
        Ok(Self {
            magic: b.get_u32_le(),
            major_version: b.get_u32_le(),
            minor_version: b.get_u32_le(),
            size: b.get_u32_le(),
        })
    }
}

// ── LinkMess ─────────────────────────────────────────────────────

/// Client half of the link exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkMess {
    pub connection_id: u32,
    pub channel_type: u8,
    pub channel_id: u8,
    pub num_common_caps: u32,
    pub num_channel_caps: u32,
    pub caps_offset: u32,
}

impl LinkMess {
    /// Encoded size on the wire, excluding capability words.
    pub const SIZE: usize = 18;

    /// Full link payload: the message followed by common then kind words.
    pub fn encode_with_caps(
        connection_id: u32,
        channel_type: u8,
        channel_id: u8,
        common: &CapabilitySet,
        kind: &CapabilitySet,
    ) -> BytesMut {
        let mess = LinkMess {
            connection_id,
            channel_type,
            channel_id,
            num_common_caps: common.len() as u32,
            num_channel_caps: kind.len() as u32,
            caps_offset: Self::SIZE as u32,
        };
        let mut buf = BytesMut::with_capacity(Self::SIZE + 4 * (common.len() + kind.len()));
        mess.encode_into(&mut buf);
        for word in common.words().iter().chain(kind.words()) {
            buf.put_u32_le(*word);
        }
        buf
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.connection_id);
        buf.put_u8(self.channel_type);
        buf.put_u8(self.channel_id);
        buf.put_u32_le(self.num_common_caps);
        buf.put_u32_le(self.num_channel_caps);
        buf.put_u32_le(self.caps_offset);
    }

    pub fn decode(data: &[u8]) -> Result<Self, SpiceError> {
        ensure_len(data, Self::SIZE, "link message")?;
        let mut b = data;
        Ok(Self {
            connection_id: b.get_u32_le(),
            channel_type: b.get_u8(),
            channel_id: b.get_u8(),
            num_common_caps: b.get_u32_le(),
            num_channel_caps: b.get_u32_le(),
            caps_offset: b.get_u32_le(),
        })
    }
}

// ── LinkReply ────────────────────────────────────────────────────

/// Server half of the link exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReply {
    pub error: u32,
    pub pub_key: Vec<u8>,
    pub num_common_caps: u32,
    pub num_channel_caps: u32,
    pub caps_offset: u32,
}

impl LinkReply {
    /// Encoded size on the wire, excluding capability words.
    pub const SIZE: usize = 4 + TICKET_PUBKEY_BYTES + 12;

    pub fn decode(data: &[u8]) -> Result<Self, SpiceError> {
        ensure_len(data, Self::SIZE, "link reply")?;
        let mut b = data;
        let error = b.get_u32_le();
        let pub_key = b[..TICKET_PUBKEY_BYTES].to_vec();
        b.advance(TICKET_PUBKEY_BYTES);
        Ok(Self {
            error,
            pub_key,
            num_common_caps: b.get_u32_le(),
            num_channel_caps: b.get_u32_le(),
            caps_offset: b.get_u32_le(),
        })
    }

    /// Serialize the reply and its capability words (used by test peers).
    pub fn encode_with_caps(&self, common: &[u32], kind: &[u32]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE + 4 * (common.len() + kind.len()));
        buf.put_u32_le(self.error);
        let mut key = self.pub_key.clone();
        key.resize(TICKET_PUBKEY_BYTES, 0);
        buf.put_slice(&key);
        buf.put_u32_le(common.len() as u32);
        buf.put_u32_le(kind.len() as u32);
        buf.put_u32_le(Self::SIZE as u32);
        for word in common.iter().chain(kind) {
            buf.put_u32_le(*word);
        }
        buf
    }

    /// Read the common and kind capability sets that follow the reply.
    ///
    /// `data` is the whole reply; `caps_offset` counts from its start.
    pub fn capabilities(&self, data: &[u8]) -> Result<(CapabilitySet, CapabilitySet), SpiceError> {
        let offset = self.caps_offset as usize;
        let ncommon = self.num_common_caps as usize;
        let nkind = self.num_channel_caps as usize;
        let end = ncommon
            .checked_add(nkind)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(offset))
            .ok_or_else(|| SpiceError::Link("capability table overflows".into()))?;
        ensure_len(data, end, "link reply capabilities")?;

        let mut b = &data[offset..end];
        let common = (0..ncommon).map(|_| b.get_u32_le()).collect();
        let kind = (0..nkind).map(|_| b.get_u32_le()).collect();
        Ok((CapabilitySet::from_words(common), CapabilitySet::from_words(kind)))
    }
}

// ── DataHeader ───────────────────────────────────────────────────

/// Which of the two data header shapes a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMode {
    #[default]
    Full,
    Mini,
}

impl HeaderMode {
    /// Encoded header size for this mode.
    pub const fn size(self) -> usize {
        match self {
            HeaderMode::Full => 18,
            HeaderMode::Mini => 6,
        }
    }
}

/// Envelope of every message after the handshake.
///
/// In mini mode `serial` and `sub_list` are not on the wire and decode
/// as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHeader {
    pub msg_type: u16,
    pub size: u32,
    pub serial: u64,
    pub sub_list: u32,
}

impl DataHeader {
    pub fn encode(&self, mode: HeaderMode, buf: &mut BytesMut) {
        if mode == HeaderMode::Full {
            buf.put_u64_le(self.serial);
        }
        buf.put_u16_le(self.msg_type);
        buf.put_u32_le(self.size);
        if mode == HeaderMode::Full {
            buf.put_u32_le(self.sub_list);
        }
    }

    pub fn decode(mode: HeaderMode, data: &[u8]) -> Result<Self, SpiceError> {
        if data.len() < mode.size() {
            return Err(SpiceError::parse(
                "data header",
                format!("{} < {}", data.len(), mode.size()),
            ));
        }
        let mut b = data;
        Ok(match mode {
            HeaderMode::Full => Self {
                serial: b.get_u64_le(),
                msg_type: b.get_u16_le(),
                size: b.get_u32_le(),
                sub_list: b.get_u32_le(),
            },
            HeaderMode::Mini => Self {
                msg_type: b.get_u16_le(),
                size: b.get_u32_le(),
                serial: 0,
                sub_list: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn magic_is_redq() {
        assert_eq!(&SPICE_MAGIC.to_le_bytes(), b"REDQ");
        assert_eq!(TICKET_PUBKEY_BYTES, 162);
        assert_eq!(LinkReply::SIZE, 178);
    }

    #[test]
    fn link_header_layout() {
        let hdr = LinkHeader::new(VERSION_MAJOR, 26);
        let bytes = hdr.encode();
        assert_eq!(&bytes[0..4], b"REDQ");
        assert_eq!(LinkHeader::decode(&bytes).unwrap(), hdr);
        assert_eq!(LinkHeader::new(OLD_VERSION_MAJOR, 0).minor_version, 3);
    }

    #[test]
    fn link_mess_with_caps() {
        let mut common = CapabilitySet::new();
        common.set(0);
        common.set(3);
        let mut kind = CapabilitySet::new();
        kind.set(1);

        let buf = LinkMess::encode_with_caps(7, 2, 1, &common, &kind);
        assert_eq!(buf.len(), LinkMess::SIZE + 8);
        let mess = LinkMess::decode(&buf).unwrap();
        assert_eq!(mess.connection_id, 7);
        assert_eq!(mess.channel_type, 2);
        assert_eq!(mess.channel_id, 1);
        assert_eq!(mess.num_common_caps, 1);
        assert_eq!(mess.num_channel_caps, 1);
        assert_eq!(mess.caps_offset, 18);
        assert_eq!(&buf[18..22], &0b1001u32.to_le_bytes());
        assert_eq!(&buf[22..26], &0b10u32.to_le_bytes());
    }

    #[test]
    fn link_reply_capabilities() {
        let reply = LinkReply {
            error: 0,
            pub_key: vec![0xab; TICKET_PUBKEY_BYTES],
            num_common_caps: 0,
            num_channel_caps: 0,
            caps_offset: 0,
        };
        let buf = reply.encode_with_caps(&[0b1011], &[0b1, 0b100]);
        let decoded = LinkReply::decode(&buf).unwrap();
        assert_eq!(decoded.num_common_caps, 1);
        assert_eq!(decoded.num_channel_caps, 2);
        let (common, kind) = decoded.capabilities(&buf).unwrap();
        assert!(common.test(3));
        assert!(!common.test(2));
        assert!(kind.test(34));
    }

    #[test]
    fn link_reply_truncated_caps() {
        let reply = LinkReply {
            error: 0,
            pub_key: vec![],
            num_common_caps: 0,
            num_channel_caps: 0,
            caps_offset: 0,
        };
        let buf = reply.encode_with_caps(&[1, 2], &[]);
        let decoded = LinkReply::decode(&buf).unwrap();
        assert!(decoded.capabilities(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn short_header_is_error() {
        assert!(DataHeader::decode(HeaderMode::Full, &[0u8; 17]).is_err());
        assert!(DataHeader::decode(HeaderMode::Mini, &[0u8; 5]).is_err());
        assert!(LinkHeader::decode(&[0u8; 15]).is_err());
    }

    proptest! {
        #[test]
        fn data_header_roundtrip(msg_type: u16, size: u32, serial: u64, sub_list: u32) {
            let full = DataHeader { msg_type, size, serial, sub_list };
            let mut buf = BytesMut::new();
            full.encode(HeaderMode::Full, &mut buf);
            prop_assert_eq!(buf.len(), HeaderMode::Full.size());
            prop_assert_eq!(DataHeader::decode(HeaderMode::Full, &buf).unwrap(), full);

            let mut buf = BytesMut::new();
            full.encode(HeaderMode::Mini, &mut buf);
            prop_assert_eq!(buf.len(), HeaderMode::Mini.size());
            let mini = DataHeader::decode(HeaderMode::Mini, &buf).unwrap();
            prop_assert_eq!(mini.msg_type, msg_type);
            prop_assert_eq!(mini.size, size);
        }
    }
}
