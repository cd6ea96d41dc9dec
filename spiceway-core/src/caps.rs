//! Capability bit-vectors exchanged during the link handshake.
//!
//! A [`CapabilitySet`] is a growable vector of 32-bit words. Setting a bit
//! grows the vector exactly enough to hold it; testing a bit beyond the
//! end reports it as unset.

use std::collections::HashSet;

// ── Capability bits ──────────────────────────────────────────────

/// Capabilities shared by every channel kind.
pub mod common {
    pub const PROTOCOL_AUTH_SELECTION: u32 = 0;
    pub const AUTH_SPICE: u32 = 1;
    pub const AUTH_SASL: u32 = 2;
    pub const MINI_HEADER: u32 = 3;
}

/// Main channel capabilities.
pub mod main {
    pub const SEMI_SEAMLESS_MIGRATE: u32 = 0;
    pub const NAME_AND_UUID: u32 = 1;
    pub const AGENT_CONNECTED_TOKENS: u32 = 2;
    pub const SEAMLESS_MIGRATE: u32 = 3;

    /// Override names, indexed by bit.
    pub const NAMES: [&str; 4] = [
        "SPICE_MAIN_CAP_SEMI_SEAMLESS_MIGRATE",
        "SPICE_MAIN_CAP_NAME_AND_UUID",
        "SPICE_MAIN_CAP_AGENT_CONNECTED_TOKENS",
        "SPICE_MAIN_CAP_SEAMLESS_MIGRATE",
    ];
}

// ── CapabilitySet ────────────────────────────────────────────────

/// Growable capability bit-vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    words: Vec<u32>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from words received on the wire.
    pub fn from_words(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Set `bit`, growing the vector to `bit / 32 + 1` words if shorter.
    pub fn set(&mut self, bit: u32) {
        let word = (bit / 32) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 32);
    }

    /// `true` if `bit` is set; bits past the end are unset.
    pub fn test(&self, bit: u32) -> bool {
        self.words
            .get((bit / 32) as usize)
            .is_some_and(|w| w & (1 << (bit % 32)) != 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Number of 32-bit words in the set.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

// ── ChannelCaps ──────────────────────────────────────────────────

/// The four capability sets of one channel connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelCaps {
    pub local_common: CapabilitySet,
    pub local_kind: CapabilitySet,
    pub remote_common: CapabilitySet,
    pub remote_kind: CapabilitySet,
}

impl ChannelCaps {
    /// Drop negotiated state and restore the local defaults.
    ///
    /// Auth selection and mini headers are always offered; `kind_defaults`
    /// are the bits the channel kind advertises.
    pub fn reset(&mut self, kind_defaults: &CapabilitySet) {
        self.remote_common.clear();
        self.remote_kind.clear();
        self.local_common.clear();
        self.local_common.set(common::PROTOCOL_AUTH_SELECTION);
        self.local_common.set(common::MINI_HEADER);
        self.local_kind = kind_defaults.clone();
    }

    /// `true` if the peer advertised the common capability `bit`.
    pub fn remote_has_common(&self, bit: u32) -> bool {
        self.remote_common.test(bit)
    }

    /// `true` if the peer advertised the kind capability `bit`.
    pub fn remote_has(&self, bit: u32) -> bool {
        self.remote_kind.test(bit)
    }
}

// ── CapabilityFilter ─────────────────────────────────────────────

/// Capabilities switched off by configuration or environment.
///
/// A capability is disabled when its constant name appears in the
/// configured list, or when an environment variable of that name is `"0"`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    disabled: HashSet<String>,
}

impl CapabilityFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            disabled: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        if self.disabled.contains(name) {
            return false;
        }
        std::env::var(name).map_or(true, |v| v != "0")
    }

    /// Set `bit` in `set` unless `name` is disabled.
    pub fn set(&self, set: &mut CapabilitySet, bit: u32, name: &str) {
        if self.allows(name) {
            set.set(bit);
        } else {
            tracing::debug!(capability = name, "capability disabled by override");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beyond_length_is_false() {
        let set = CapabilitySet::new();
        assert!(!set.test(0));
        assert!(!set.test(31));
        assert!(!set.test(1000));
    }

    #[test]
    fn set_grows_exactly_enough() {
        let mut set = CapabilitySet::new();
        set.set(3);
        assert_eq!(set.len(), 1);
        set.set(70);
        assert_eq!(set.len(), 3);
        assert!(set.test(70));
        assert!(set.test(3));
        assert!(!set.test(69));
        assert!(!set.test(96));

        // Setting a bit inside the current length never shrinks or grows.
        set.set(32);
        assert_eq!(set.len(), 3);
        assert_eq!(set.words(), &[1 << 3, 1, 1 << 6]);
    }

    #[test]
    fn reset_restores_fixed_bits() {
        let mut kind = CapabilitySet::new();
        kind.set(main::SEAMLESS_MIGRATE);

        let mut caps = ChannelCaps::default();
        caps.remote_common.set(common::AUTH_SASL);
        caps.local_common.set(common::AUTH_SASL);
        caps.reset(&kind);

        assert!(caps.remote_common.is_empty());
        assert!(caps.local_common.test(common::PROTOCOL_AUTH_SELECTION));
        assert!(caps.local_common.test(common::MINI_HEADER));
        assert!(!caps.local_common.test(common::AUTH_SASL));
        assert_eq!(caps.local_kind, kind);
    }

    #[test]
    fn filter_skips_disabled_names() {
        let filter = CapabilityFilter::new(["SPICE_MAIN_CAP_NAME_AND_UUID"]);
        let mut set = CapabilitySet::new();
        filter.set(&mut set, main::NAME_AND_UUID, main::NAMES[1]);
        filter.set(&mut set, main::SEMI_SEAMLESS_MIGRATE, main::NAMES[0]);
        assert!(!set.test(main::NAME_AND_UUID));
        assert!(set.test(main::SEMI_SEAMLESS_MIGRATE));
    }
}
