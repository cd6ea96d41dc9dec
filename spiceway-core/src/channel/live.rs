//! The swappable half of a channel: its live connection.
//!
//! Everything that belongs to one concrete server connection lives in a
//! [`LiveConnection`] behind a `Box`. A channel's identity (id, kind,
//! queue, state) stays put; migration moves whole boxes between a channel
//! and its shadow counterpart.

use tokio_util::codec::Framed;

use crate::caps::ChannelCaps;
use crate::codec::MessageCodec;
use crate::network::BoxedStream;

pub type Transport = Framed<BoxedStream, MessageCodec>;

/// Transport and negotiated state of one connection.
pub struct LiveConnection {
    /// Framed transport; `None` until the handshake completes.
    pub transport: Option<Transport>,
    pub use_tls: bool,
    /// Major version the peer accepted.
    pub peer_major: u32,
    pub caps: ChannelCaps,
    /// Count of messages received, starting at 1.
    pub in_serial: u64,
    /// Serial of the next message written, starting at 1.
    pub out_serial: u64,
}

impl Default for LiveConnection {
    fn default() -> Self {
        Self {
            transport: None,
            use_tls: false,
            peer_major: 0,
            caps: ChannelCaps::default(),
            in_serial: 1,
            out_serial: 1,
        }
    }
}

impl LiveConnection {
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Drop the transport and negotiated state. Serials are kept.
    pub fn reset(&mut self) {
        self.transport = None;
        self.use_tls = false;
        self.peer_major = 0;
        self.caps.remote_common.clear();
        self.caps.remote_kind.clear();
    }

    /// Exchange two live connections.
    ///
    /// When `with_serials` is false each side keeps its own serial
    /// counters.
    pub fn exchange(a: &mut Box<Self>, b: &mut Box<Self>, with_serials: bool) {
        std::mem::swap(a, b);
        if !with_serials {
            std::mem::swap(&mut a.in_serial, &mut b.in_serial);
            std::mem::swap(&mut a.out_serial, &mut b.out_serial);
        }
    }
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("connected", &self.transport.is_some())
            .field("use_tls", &self.use_tls)
            .field("peer_major", &self.peer_major)
            .field("in_serial", &self.in_serial)
            .field("out_serial", &self.out_serial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::common;

    #[test]
    fn reset_keeps_serials_and_local_caps() {
        let mut live = LiveConnection {
            use_tls: true,
            peer_major: 2,
            in_serial: 9,
            out_serial: 4,
            ..Default::default()
        };
        live.caps.local_common.set(common::MINI_HEADER);
        live.caps.remote_common.set(common::AUTH_SPICE);
        live.reset();
        assert!(!live.use_tls);
        assert_eq!(live.peer_major, 0);
        assert_eq!((live.in_serial, live.out_serial), (9, 4));
        assert!(live.caps.remote_common.is_empty());
        assert!(live.caps.local_common.test(common::MINI_HEADER));
    }

    #[test]
    fn exchange_with_and_without_serials() {
        let mut a = Box::new(LiveConnection {
            peer_major: 2,
            in_serial: 10,
            ..Default::default()
        });
        let mut b = Box::new(LiveConnection {
            peer_major: 1,
            in_serial: 3,
            ..Default::default()
        });

        LiveConnection::exchange(&mut a, &mut b, false);
        assert_eq!(a.peer_major, 1);
        assert_eq!(a.in_serial, 10);
        assert_eq!(b.in_serial, 3);

        LiveConnection::exchange(&mut a, &mut b, true);
        assert_eq!(a.peer_major, 2);
        assert_eq!(a.in_serial, 3);
        assert_eq!(b.in_serial, 10);
    }
}
