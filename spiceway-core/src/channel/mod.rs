//! Channels: one independently sequenced connection per `(type, id)`.
//!
//! A [`Channel`] is a cheap handle onto shared state. The session owns
//! the registry entry; everything else (callers, events, migration
//! trackers) refers to a channel through clones of the handle or its
//! [`ChannelId`].
//!
//! The connection itself is driven by one tokio task per channel (see
//! [`context`]). While no task owns it, the channel's
//! [`LiveConnection`] box sits in the `parked` slot, which is where a
//! migration swaps it.

pub mod base;
pub mod context;
pub mod handshake;
pub mod kind;
pub mod live;
pub mod main;
pub mod xmit;

#[cfg(test)]
pub(crate) mod testutil;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::caps::{CapabilitySet, ChannelCaps};
use crate::error::SpiceError;
use crate::event::{ChannelEvent, SessionEvent};
use crate::message::ChannelType;
use crate::network::BoxedStream;
use crate::packet::OutgoingMessage;
use crate::session::{Session, SessionInner};
use crate::state::ChannelState;
use crate::task::{MainContext, WaitCanceller};

pub use context::ChannelContext;
pub use kind::{ChannelKind, GenericKind, HandleFn, HandlerFuture, HandlerTable, MessageHandler};
pub use live::LiveConnection;
pub use main::MainKind;
pub use xmit::TransmitQueue;

// ── ChannelId ────────────────────────────────────────────────────

/// Identity of a channel within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    pub channel_type: ChannelType,
    pub id: u8,
}

impl ChannelId {
    pub fn new(channel_type: ChannelType, id: u8) -> Self {
        Self { channel_type, id }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}",
            self.channel_type.name(),
            self.channel_type as u8,
            self.id
        )
    }
}

// ── Shared state ─────────────────────────────────────────────────

pub(crate) struct ChannelShared {
    pub(crate) id: ChannelId,
    pub(crate) name: String,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) main_ctx: Arc<MainContext>,
    pub(crate) kind: Arc<dyn ChannelKind>,
    /// Kind capabilities restored on every reset.
    pub(crate) kind_caps: CapabilitySet,
    /// Messages above the base range are dropped.
    pub(crate) disabled: bool,

    pub(crate) state: Mutex<ChannelState>,
    pub(crate) state_notify: Notify,
    pub(crate) xmit: TransmitQueue,
    pub(crate) canceller: WaitCanceller,
    pub(crate) cancel: Mutex<CancellationToken>,

    /// The live connection whenever the task does not hold it.
    pub(crate) parked: Mutex<Option<Box<LiveConnection>>>,
    pub(crate) last_serial: AtomicU64,
    /// Run `on_up` when the parked task resumes.
    pub(crate) up_pending: AtomicBool,
    pub(crate) task_running: AtomicBool,
    pub(crate) published_caps: Mutex<ChannelCaps>,
    pub(crate) pending_stream: Mutex<Option<BoxedStream>>,
}

// ── Channel ──────────────────────────────────────────────────────

/// Handle onto one channel of a session.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(
        session: &Arc<SessionInner>,
        kind: Arc<dyn ChannelKind>,
        id: u8,
        disabled: bool,
    ) -> Self {
        let channel_type = kind.channel_type();
        let id = ChannelId::new(channel_type, id);
        let mut kind_caps = CapabilitySet::new();
        kind.reset_capabilities(&mut kind_caps, &session.cap_filter);

        let mut caps = ChannelCaps::default();
        caps.reset(&kind_caps);
        let live = LiveConnection {
            caps: caps.clone(),
            ..Default::default()
        };

        Self {
            shared: Arc::new(ChannelShared {
                id,
                name: id.to_string(),
                session: Arc::downgrade(session),
                main_ctx: Arc::clone(&session.main_ctx),
                kind,
                kind_caps,
                disabled,
                state: Mutex::new(ChannelState::Unconnected),
                state_notify: Notify::new(),
                xmit: TransmitQueue::new(),
                canceller: WaitCanceller::new(),
                cancel: Mutex::new(CancellationToken::new()),
                parked: Mutex::new(Some(Box::new(live))),
                last_serial: AtomicU64::new(0),
                up_pending: AtomicBool::new(false),
                task_running: AtomicBool::new(false),
                published_caps: Mutex::new(caps),
                pending_stream: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn channel_type(&self) -> ChannelType {
        self.shared.id.channel_type
    }

    /// Name used in logs, e.g. `display-2:0`.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.session.upgrade().map(Session::from_inner)
    }

    pub fn kind(&self) -> &Arc<dyn ChannelKind> {
        &self.shared.kind
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    /// Serial of the last message this channel processed.
    pub fn last_serial(&self) -> u64 {
        self.shared.last_serial.load(Ordering::Acquire)
    }

    /// `true` while the channel task exists.
    pub fn is_running(&self) -> bool {
        self.shared.task_running.load(Ordering::Acquire)
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled
    }

    /// Capabilities of the last completed handshake.
    pub fn caps(&self) -> ChannelCaps {
        self.shared.published_caps.lock().clone()
    }

    /// `true` if the peer advertised kind capability `bit`.
    pub fn test_capability(&self, bit: u32) -> bool {
        self.shared.published_caps.lock().remote_has(bit)
    }

    pub fn test_common_capability(&self, bit: u32) -> bool {
        self.shared.published_caps.lock().remote_has_common(bit)
    }

    /// Number of messages waiting in the transmit queue.
    pub fn queued(&self) -> usize {
        self.shared.xmit.len()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start connecting.
    ///
    /// A channel that is already connecting or connected is left alone.
    /// In client-provided-sockets mode without a stream, an
    /// [`SessionEvent::OpenFdRequested`] is emitted instead.
    pub fn connect(&self) -> Result<(), SpiceError> {
        let session = self
            .session()
            .ok_or(SpiceError::SetupIncomplete("channel has no session"))?;
        {
            let mut state = self.shared.state.lock();
            if state.is_connecting_or_further() {
                debug!(channel = %self.name(), %state, "connect ignored");
                return Ok(());
            }
            if session.client_provided_sockets() && self.shared.pending_stream.lock().is_none() {
                drop(state);
                let tls = session.wants_tls(self.channel_type());
                debug!(channel = %self.name(), tls, "requesting a caller-provided socket");
                session.emit(SessionEvent::OpenFdRequested { id: self.id(), tls });
                return Ok(());
            }
            *state = ChannelState::Connecting;
        }
        self.start_task();
        Ok(())
    }

    /// Connect over a stream the caller already opened.
    pub fn open_stream(&self, stream: BoxedStream) -> Result<(), SpiceError> {
        if self.state() != ChannelState::Unconnected {
            warn!(channel = %self.name(), state = %self.state(), "open_stream in invalid state");
            return Err(SpiceError::Other(format!(
                "{}: cannot open a stream while {}",
                self.name(),
                self.state()
            )));
        }
        *self.shared.pending_stream.lock() = Some(stream);
        self.connect()
    }

    /// Connect over a socket descriptor the caller opened.
    #[cfg(unix)]
    pub fn open_fd(&self, fd: std::os::fd::OwnedFd) -> Result<(), SpiceError> {
        self.open_stream(crate::network::connection::stream_from_fd(fd)?)
    }

    fn start_task(&self) {
        self.shared.xmit.unblock();
        *self.shared.cancel.lock() = CancellationToken::new();
        self.shared.task_running.store(true, Ordering::Release);
        info!(channel = %self.name(), "connecting");
        self.shared.main_ctx.spawn(context::run(self.clone()));
    }

    /// Tear the connection down and report `reason`.
    ///
    /// `Switching` leaves the channel in the switching state so its task
    /// reconnects. `Closed` is only reported for a channel that reached
    /// `Ready`.
    pub fn disconnect(&self, reason: ChannelEvent) {
        let prior = {
            let mut state = self.shared.state.lock();
            let prior = *state;
            if prior == ChannelState::Unconnected {
                return;
            }
            if reason == ChannelEvent::Switching {
                *state = ChannelState::Switching;
            } else if prior == ChannelState::Migrating {
                *state = ChannelState::Ready;
            }
            prior
        };
        debug!(channel = %self.name(), %reason, from = %prior, "disconnect");

        if reason != ChannelEvent::Switching {
            self.shared.xmit.block();
        }
        self.shared.cancel.lock().cancel();
        self.shared.canceller.cancel();
        self.notify_state();

        let report = match reason {
            ChannelEvent::None => false,
            ChannelEvent::Closed => prior >= ChannelState::Ready,
            _ => true,
        };
        if !report {
            return;
        }
        if let Some(session) = self.session() {
            session.emit(SessionEvent::Channel {
                id: self.id(),
                event: reason,
            });
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Start an outgoing message of `msg_type` for this channel.
    pub fn message(&self, msg_type: u16) -> OutgoingMessage {
        OutgoingMessage::new(self.channel_type(), msg_type)
            .with_ro_check(!self.shared.kind.allowed_while_read_only(msg_type))
    }

    /// Queue `msg` for the channel task.
    ///
    /// Returns `false` if the message was dropped: the session is
    /// read-only and the message is not allowed, or the queue is blocked.
    pub fn send(&self, msg: OutgoingMessage) -> bool {
        if msg.ro_check() && self.session().is_some_and(|s| s.read_only()) {
            warn!(
                channel = %self.name(),
                msg_type = msg.msg_type(),
                "read-only session, dropping message"
            );
            return false;
        }
        self.shared.xmit.push(msg.into_shared())
    }

    // ── Internal ─────────────────────────────────────────────────

    pub(crate) fn set_state(&self, next: ChannelState) {
        {
            let mut state = self.shared.state.lock();
            if !state.can_transition(next) {
                debug!(channel = %self.name(), from = %*state, to = %next, "forced state change");
            }
            *state = next;
        }
        self.notify_state();
    }

    fn notify_state(&self) {
        self.shared.state_notify.notify_one();
        self.shared.main_ctx.iterate();
    }

    pub(crate) fn publish_caps(&self, caps: &ChannelCaps) {
        *self.shared.published_caps.lock() = caps.clone();
    }

    /// Report `event` to the session from the main context.
    pub(crate) async fn emit_event(&self, event: ChannelEvent) {
        let Some(session) = self.session() else {
            return;
        };
        let id = self.id();
        let ctx = Arc::clone(&self.shared.main_ctx);
        if ctx
            .invoke(move || session.emit(SessionEvent::Channel { id, event }))
            .await
            .is_err()
        {
            debug!(channel = %id, %event, "main context gone, event dropped");
        }
    }

    pub(crate) fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("last_serial", &self.last_serial())
            .finish()
    }
}
