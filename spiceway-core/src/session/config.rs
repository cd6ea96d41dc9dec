//! Connection parameters of a session.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::flags::VerifyFlags;
use crate::header::VERSION_MAJOR;
use crate::message::ChannelType;

/// Comma or space separated channel kinds whose payload is never dispatched.
pub const DISABLE_CHANNELS_ENV: &str = "SPICE_DISABLE_CHANNELS";

/// Overrides the destination host announced by a migrating server.
pub const MIGRATION_HOST_ENV: &str = "SPICE_MIG_HOST";

/// Everything a session needs to reach and authenticate to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    /// Plain TCP port.
    pub port: Option<u16>,
    /// TLS port.
    pub tls_port: Option<u16>,
    /// Connect over a Unix socket instead of TCP.
    pub unix_path: Option<PathBuf>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// PEM bundle of trusted CAs.
    pub ca_file: Option<PathBuf>,
    /// Expected certificate subject, e.g. `"C=IL,O=Red Hat,CN=host"`.
    pub cert_subject: Option<String>,
    /// Hex encoded DER SubjectPublicKeyInfo of the server.
    pub pubkey: Option<String>,
    pub verify: VerifyFlags,

    /// Channel kinds that must use TLS; `"all"` selects every kind.
    pub secure_channels: Vec<String>,
    /// Channel kinds whose payload messages are dropped.
    pub disabled_channels: Vec<String>,

    /// Protocol major version offered first.
    pub protocol: u32,
    pub read_only: bool,

    pub enable_audio: bool,
    pub enable_smartcard: bool,
    pub enable_usbredir: bool,

    /// Capability constant names never advertised, e.g.
    /// `"SPICE_MAIN_CAP_SEAMLESS_MIGRATE"`.
    pub disabled_capabilities: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
            tls_port: None,
            unix_path: None,
            username: None,
            password: None,
            ca_file: None,
            cert_subject: None,
            pubkey: None,
            verify: VerifyFlags::default(),
            secure_channels: Vec::new(),
            disabled_channels: Vec::new(),
            protocol: VERSION_MAJOR,
            read_only: false,
            enable_audio: true,
            enable_smartcard: false,
            enable_usbredir: false,
            disabled_capabilities: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// `true` if channels of `ty` must connect over TLS.
    pub fn is_secure(&self, ty: ChannelType) -> bool {
        self.secure_channels
            .iter()
            .any(|name| name == "all" || name == ty.name())
    }

    /// Whether a server-advertised channel of `ty` should be created.
    pub fn is_enabled(&self, ty: ChannelType) -> bool {
        match ty {
            ChannelType::Playback | ChannelType::Record => self.enable_audio,
            ChannelType::Smartcard => self.enable_smartcard,
            ChannelType::Usbredir => self.enable_usbredir,
            _ => true,
        }
    }

    /// The configured server key, decoded from hex.
    pub fn pubkey_der(&self) -> Result<Option<Vec<u8>>, String> {
        self.pubkey.as_deref().map(decode_hex).transpose()
    }

    /// Configured plus environment-disabled channel kinds.
    pub(crate) fn disabled_kinds(&self) -> Vec<ChannelType> {
        let from_env = std::env::var(DISABLE_CHANNELS_ENV).unwrap_or_default();
        self.disabled_channels
            .iter()
            .map(String::as_str)
            .chain(split_list(&from_env))
            .filter_map(|name| {
                let ty = ChannelType::from_name(name);
                if ty.is_none() {
                    tracing::warn!(name, "unknown channel kind in disable list");
                }
                ty
            })
            .collect()
    }
}

/// Split a comma or space separated list, skipping empty entries.
pub fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([',', ' ']).map(str::trim).filter(|s| !s.is_empty())
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| format!("bad hex at {i}: {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.protocol, 2);
        assert_eq!(cfg.verify, VerifyFlags::HOSTNAME);
        assert!(cfg.is_enabled(ChannelType::Playback));
        assert!(!cfg.is_enabled(ChannelType::Usbredir));
        assert!(cfg.is_enabled(ChannelType::Display));
    }

    #[test]
    fn secure_channel_selection() {
        let mut cfg = SessionConfig {
            secure_channels: vec!["main".into(), "inputs".into()],
            ..Default::default()
        };
        assert!(cfg.is_secure(ChannelType::Main));
        assert!(!cfg.is_secure(ChannelType::Display));
        cfg.secure_channels = vec!["all".into()];
        assert!(cfg.is_secure(ChannelType::Display));
    }

    #[test]
    fn list_splitting() {
        let names: Vec<_> = split_list("display, cursor  playback,,").collect();
        assert_eq!(names, vec!["display", "cursor", "playback"]);
    }

    #[test]
    fn pubkey_hex() {
        let cfg = SessionConfig {
            pubkey: Some("30 0d".replace(' ', "")),
            ..Default::default()
        };
        assert_eq!(cfg.pubkey_der().unwrap(), Some(vec![0x30, 0x0d]));

        let bad = SessionConfig {
            pubkey: Some("abc".into()),
            ..Default::default()
        };
        assert!(bad.pubkey_der().is_err());
    }

    #[test]
    fn configured_kinds_are_disabled() {
        let cfg = SessionConfig {
            disabled_channels: vec!["cursor".into(), "bogus".into()],
            ..Default::default()
        };
        assert!(cfg.disabled_kinds().contains(&ChannelType::Cursor));
    }
}
