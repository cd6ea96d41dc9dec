//! Channel kinds, link error codes and the message type catalogue.
//!
//! Uses proper enums with `TryFrom` where the engine branches on a value;
//! raw message types are plain `u16` constants grouped by direction.

use std::fmt;

use crate::error::SpiceError;

// ── ChannelType ──────────────────────────────────────────────────

/// Kind of a channel multiplexed within a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    Main = 1,
    Display = 2,
    Inputs = 3,
    Cursor = 4,
    Playback = 5,
    Record = 6,
    Tunnel = 7,
    Smartcard = 8,
    Usbredir = 9,
    Port = 10,
    Webdav = 11,
}

impl ChannelType {
    pub const ALL: [ChannelType; 11] = [
        ChannelType::Main,
        ChannelType::Display,
        ChannelType::Inputs,
        ChannelType::Cursor,
        ChannelType::Playback,
        ChannelType::Record,
        ChannelType::Tunnel,
        ChannelType::Smartcard,
        ChannelType::Usbredir,
        ChannelType::Port,
        ChannelType::Webdav,
    ];

    /// Short lowercase name, as used in channel names and override lists.
    pub fn name(self) -> &'static str {
        match self {
            ChannelType::Main => "main",
            ChannelType::Display => "display",
            ChannelType::Inputs => "inputs",
            ChannelType::Cursor => "cursor",
            ChannelType::Playback => "playback",
            ChannelType::Record => "record",
            ChannelType::Tunnel => "tunnel",
            ChannelType::Smartcard => "smartcard",
            ChannelType::Usbredir => "usbredir",
            ChannelType::Port => "port",
            ChannelType::Webdav => "webdav",
        }
    }

    /// Reverse of [`ChannelType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = SpiceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or(SpiceError::UnknownVariant {
                type_name: "ChannelType",
                value: value as u64,
            })
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── LinkErrorCode ────────────────────────────────────────────────

/// Error code carried in the peer's link reply and in auth results.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkErrorCode {
    Ok = 0,
    Error = 1,
    InvalidMagic = 2,
    InvalidData = 3,
    VersionMismatch = 4,
    NeedSecured = 5,
    NeedUnsecured = 6,
    PermissionDenied = 7,
    BadConnectionId = 8,
    ChannelNotAvailable = 9,
}

impl TryFrom<u32> for LinkErrorCode {
    type Error = SpiceError;

    fn try_from(value: u32) -> Result<Self, SpiceError> {
        Ok(match value {
            0 => LinkErrorCode::Ok,
            1 => LinkErrorCode::Error,
            2 => LinkErrorCode::InvalidMagic,
            3 => LinkErrorCode::InvalidData,
            4 => LinkErrorCode::VersionMismatch,
            5 => LinkErrorCode::NeedSecured,
            6 => LinkErrorCode::NeedUnsecured,
            7 => LinkErrorCode::PermissionDenied,
            8 => LinkErrorCode::BadConnectionId,
            9 => LinkErrorCode::ChannelNotAvailable,
            _ => {
                return Err(SpiceError::UnknownVariant {
                    type_name: "LinkErrorCode",
                    value: value as u64,
                });
            }
        })
    }
}

impl fmt::Display for LinkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkErrorCode::Ok => "ok",
            LinkErrorCode::Error => "error",
            LinkErrorCode::InvalidMagic => "invalid magic",
            LinkErrorCode::InvalidData => "invalid data",
            LinkErrorCode::VersionMismatch => "version mismatch",
            LinkErrorCode::NeedSecured => "need secured",
            LinkErrorCode::NeedUnsecured => "need unsecured",
            LinkErrorCode::PermissionDenied => "permission denied",
            LinkErrorCode::BadConnectionId => "bad connection id",
            LinkErrorCode::ChannelNotAvailable => "channel not available",
        };
        f.write_str(s)
    }
}

// ── AuthMechanism ────────────────────────────────────────────────

/// Selector written after the link exchange when the peer supports
/// auth selection.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    Spice = 1,
    Sasl = 2,
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMechanism::Spice => write!(f, "spice"),
            AuthMechanism::Sasl => write!(f, "sasl"),
        }
    }
}

// ── Message types ────────────────────────────────────────────────

/// Messages sent by the server.
pub mod server {
    pub const MIGRATE: u16 = 1;
    pub const MIGRATE_DATA: u16 = 2;
    pub const SET_ACK: u16 = 3;
    pub const PING: u16 = 4;
    pub const WAIT_FOR_CHANNELS: u16 = 5;
    pub const DISCONNECTING: u16 = 6;
    pub const NOTIFY: u16 = 7;
    pub const LIST: u16 = 8;

    /// First type number available to channel kinds.
    pub const BASE_LAST: u16 = 101;

    /// Main channel.
    pub mod main {
        pub const MIGRATE_BEGIN: u16 = 101;
        pub const MIGRATE_CANCEL: u16 = 102;
        pub const INIT: u16 = 103;
        pub const CHANNELS_LIST: u16 = 104;
        pub const MOUSE_MODE: u16 = 105;
        pub const MULTI_MEDIA_TIME: u16 = 106;
        pub const AGENT_CONNECTED: u16 = 107;
        pub const AGENT_DISCONNECTED: u16 = 108;
        pub const AGENT_DATA: u16 = 109;
        pub const AGENT_TOKEN: u16 = 110;
        pub const MIGRATE_SWITCH_HOST: u16 = 111;
        pub const MIGRATE_END: u16 = 112;
        pub const NAME: u16 = 113;
        pub const UUID: u16 = 114;
        pub const AGENT_CONNECTED_TOKENS: u16 = 115;
        pub const MIGRATE_BEGIN_SEAMLESS: u16 = 116;
        pub const MIGRATE_DST_SEAMLESS_ACK: u16 = 117;
        pub const MIGRATE_DST_SEAMLESS_NACK: u16 = 118;
    }
}

/// Messages sent by the client.
pub mod client {
    pub const ACK_SYNC: u16 = 1;
    pub const ACK: u16 = 2;
    pub const PONG: u16 = 3;
    pub const MIGRATE_FLUSH_MARK: u16 = 4;
    pub const MIGRATE_DATA: u16 = 5;
    pub const DISCONNECTING: u16 = 6;

    /// First type number available to channel kinds.
    pub const BASE_LAST: u16 = 101;

    /// Main channel.
    pub mod main {
        pub const CLIENT_INFO: u16 = 101;
        pub const MIGRATE_CONNECTED: u16 = 102;
        pub const MIGRATE_CONNECT_ERROR: u16 = 103;
        pub const ATTACH_CHANNELS: u16 = 104;
        pub const MOUSE_MODE_REQUEST: u16 = 105;
        pub const AGENT_START: u16 = 106;
        pub const AGENT_DATA: u16 = 107;
        pub const AGENT_TOKEN: u16 = 108;
        pub const MIGRATE_END: u16 = 109;
        pub const MIGRATE_DST_DO_SEAMLESS: u16 = 110;
        pub const MIGRATE_CONNECTED_SEAMLESS: u16 = 111;
    }
}
