//! Live migration to another server.
//!
//! ```text
//!  MIGRATE_BEGIN ─► migrate_connect: shadow session dials the destination,
//!                   main first, then every other channel of the source
//!                   │
//!     all opened ───┤─── any failure
//!                   ▼                    ▼
//!        MIGRATE_CONNECTED       MIGRATE_CONNECT_ERROR, shadow dropped
//!        set_migration
//!                   │
//!   seamless: per-channel MIGRATE ─► channel_migrate (swap one channel)
//!   semi-seamless: MIGRATE_END ─► main swaps, INIT ─► the rest swap
//! ```
//!
//! A swap exchanges the [`LiveConnection`] boxes of a source channel and
//! its shadow counterpart. It only touches a box nobody is driving: the
//! one a channel task is holding in its own context, or one parked while
//! its channel is `Migrating`.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::config::MIGRATION_HOST_ENV;
use super::{Session, SessionInner};
use crate::channel::{Channel, ChannelContext, ChannelId, LiveConnection, TransmitQueue};
use crate::error::SpiceError;
use crate::event::{ChannelEvent, SessionEvent};
use crate::flags::VerifyFlags;
use crate::message::ChannelType;
use crate::protocol::MigrationDstInfo;
use crate::state::{ChannelState, MigrationState};

// ── Migration ────────────────────────────────────────────────────

/// Migration bookkeeping of a source session.
#[derive(Debug, Default)]
pub(crate) struct Migration {
    pub(crate) state: MigrationState,
    pub(crate) shadow: Option<Session>,
    /// Seamless migration: serials and queues stay with the source.
    full: bool,
    /// Source channels not swapped yet.
    left: Vec<ChannelId>,
    /// Waiting for the migrated main channel's INIT.
    wait_init: bool,
}

/// Result of connecting a shadow session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeResult {
    Connected { seamless: bool },
    Failed,
}

/// A shadow session that is connecting.
pub(crate) struct MigrationAttempt {
    pub(crate) shadow: Session,
    pub(crate) done: oneshot::Receiver<HandshakeResult>,
}

// ── HandshakeTracker ─────────────────────────────────────────────

#[derive(Debug)]
struct TrackerState {
    pending: usize,
    seamless: bool,
    done: Option<oneshot::Sender<HandshakeResult>>,
    seen: HashSet<ChannelId>,
}

/// Counts shadow channels until all of them opened or one failed.
///
/// Only the first event of each shadow channel counts.
#[derive(Debug)]
pub(crate) struct HandshakeTracker {
    state: Mutex<TrackerState>,
    src_version: u32,
    source: Weak<SessionInner>,
    shadow: Weak<SessionInner>,
}

enum Step {
    Ignore,
    MainOpened,
    Opened,
    Failed,
}

impl HandshakeTracker {
    pub(crate) fn src_version(&self) -> u32 {
        self.src_version
    }

    fn on_event(&self, event: &SessionEvent) {
        let SessionEvent::Channel { id, event } = event else {
            return;
        };
        let step = {
            let mut st = self.state.lock();
            if st.done.is_none() || !st.seen.insert(*id) {
                Step::Ignore
            } else {
                match (event, id.channel_type) {
                    (ChannelEvent::Opened, ChannelType::Main) => Step::MainOpened,
                    (ChannelEvent::Opened, _) => Step::Opened,
                    _ => Step::Failed,
                }
            }
        };

        match step {
            Step::Ignore => {}
            Step::MainOpened => self.main_opened(*id),
            Step::Opened => {
                self.set_shadow_state(*id, ChannelState::Migrating);
                self.settle(|st| st.pending = st.pending.saturating_sub(1));
            }
            Step::Failed => {
                warn!(channel = %id, %event, "migration target failed to connect");
                self.finish(HandshakeResult::Failed);
            }
        }
    }

    fn main_opened(&self, id: ChannelId) {
        let seamless = self.state.lock().seamless;
        if seamless {
            self.set_shadow_state(id, ChannelState::MigrationHandshake);
        } else {
            self.set_shadow_state(id, ChannelState::Migrating);
        }

        let (Some(source), Some(shadow)) = (self.source.upgrade(), self.shadow.upgrade()) else {
            self.finish(HandshakeResult::Failed);
            return;
        };
        let others: Vec<ChannelId> = Session::from_inner(source)
            .channels()
            .iter()
            .map(Channel::id)
            .filter(|id| id.channel_type != ChannelType::Main)
            .collect();
        {
            let mut st = self.state.lock();
            if !seamless {
                st.pending = st.pending.saturating_sub(1);
            }
            st.pending += others.len();
        }

        let shadow = Session::from_inner(shadow);
        for id in others {
            debug!(channel = %id, "connecting migration target");
            let target = shadow.channel_new(id.channel_type, id.id);
            if let Err(e) = target.connect() {
                warn!(channel = %id, error = %e, "migration target did not start");
                self.finish(HandshakeResult::Failed);
                return;
            }
        }
        self.settle(|_| {});
    }

    /// The shadow main channel finished its seamless handshake.
    pub(crate) fn handshake_done(&self, main: &Channel, seamless: bool) {
        if main.state() != ChannelState::MigrationHandshake {
            warn!(channel = %main.name(), state = %main.state(), "unexpected migration handshake reply");
            return;
        }
        main.set_state(ChannelState::Migrating);
        self.settle(|st| {
            st.seamless = seamless;
            st.pending = st.pending.saturating_sub(1);
        });
    }

    fn set_shadow_state(&self, id: ChannelId, state: ChannelState) {
        let target = self
            .shadow
            .upgrade()
            .and_then(|inner| Session::from_inner(inner).lookup(id));
        if let Some(target) = target {
            target.set_state(state);
        }
    }

    /// Apply `f`, then finish if nothing is pending any more.
    fn settle(&self, f: impl FnOnce(&mut TrackerState)) {
        let outcome = {
            let mut st = self.state.lock();
            f(&mut st);
            debug!(pending = st.pending, "migration targets left");
            (st.pending == 0).then_some(HandshakeResult::Connected {
                seamless: st.seamless,
            })
        };
        if let Some(outcome) = outcome {
            self.finish(outcome);
        }
    }

    fn finish(&self, outcome: HandshakeResult) {
        let done = self.state.lock().done.take();
        if let Some(done) = done {
            // The source task may have given up already.
            let _ = done.send(outcome);
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────

impl Session {
    pub fn migration_state(&self) -> MigrationState {
        self.inner.migration.lock().state
    }

    pub(crate) fn set_migration_state(&self, state: MigrationState) {
        {
            let mut m = self.inner.migration.lock();
            if m.state == state {
                return;
            }
            m.state = state;
        }
        debug!(%state, "migration state");
        self.emit(SessionEvent::MigrationState(state));
    }

    pub(crate) fn handshake_tracker(&self) -> Option<Arc<HandshakeTracker>> {
        self.inner.tracker.lock().clone()
    }

    /// Start connecting a shadow session to the destination in `info`.
    ///
    /// The main channel connects first; once it is open the remaining
    /// channels of this session follow. `done` resolves once all of them
    /// opened or any one failed.
    pub(crate) fn migrate_connect(
        &self,
        info: &MigrationDstInfo,
        seamless: bool,
        src_version: u32,
    ) -> Result<MigrationAttempt, SpiceError> {
        let shadow = Session::shadow_of(self);
        let host = std::env::var(MIGRATION_HOST_ENV).unwrap_or_else(|_| info.host.clone());
        info!(
            host = %host,
            port = info.port,
            sport = info.sport,
            seamless,
            "migration: connecting to destination"
        );
        shadow.update_config(|cfg| {
            cfg.host = host;
            cfg.port = (info.port != 0).then_some(info.port);
            cfg.tls_port = (info.sport != 0).then_some(info.sport);
            cfg.unix_path = None;
            match &info.cert_subject {
                Some(subject) => {
                    cfg.cert_subject = Some(subject.clone());
                    cfg.verify = VerifyFlags::SUBJECT;
                }
                None => cfg.verify = VerifyFlags::HOSTNAME,
            }
        });

        let (done_tx, done_rx) = oneshot::channel();
        let tracker = Arc::new(HandshakeTracker {
            state: Mutex::new(TrackerState {
                pending: 1,
                seamless,
                done: Some(done_tx),
                seen: HashSet::new(),
            }),
            src_version,
            source: Arc::downgrade(&self.inner),
            shadow: Arc::downgrade(&shadow.inner),
        });
        *shadow.inner.tracker.lock() = Some(Arc::clone(&tracker));
        let hook = Arc::clone(&tracker);
        shadow.add_hook(Arc::new(move |event| hook.on_event(event)));

        self.set_migration_state(MigrationState::Connecting);
        self.emit(SessionEvent::MigrationStarted);

        let main = shadow.channel_new(ChannelType::Main, 0);
        if let Err(e) = main.connect() {
            self.set_migration_state(MigrationState::None);
            return Err(e);
        }
        Ok(MigrationAttempt {
            shadow,
            done: done_rx,
        })
    }

    /// Adopt a connected shadow session and start swapping channels.
    ///
    /// The connection parameters are exchanged with the shadow's so that
    /// later reconnects go to the new server.
    pub(crate) fn set_migration(&self, shadow: Session, full: bool) {
        let left: Vec<ChannelId> = self.channels().iter().map(Channel::id).collect();
        if left.len() != shadow.channels().len() {
            warn!(
                source = left.len(),
                shadow = shadow.channels().len(),
                "migration channel count mismatch"
            );
        }
        debug!(left = left.len(), full, "migration: start migrating");

        let mine = self.config();
        let theirs = shadow.config();
        self.update_config(|cfg| {
            cfg.host = theirs.host.clone();
            cfg.port = theirs.port;
            cfg.tls_port = theirs.tls_port;
            cfg.unix_path = theirs.unix_path.clone();
        });
        shadow.update_config(|cfg| {
            cfg.host = mine.host;
            cfg.port = mine.port;
            cfg.tls_port = mine.tls_port;
            cfg.unix_path = mine.unix_path;
        });

        {
            let mut m = self.inner.migration.lock();
            m.full = full;
            m.left = left;
            m.shadow = Some(shadow);
        }
        self.set_migration_state(MigrationState::Migrating);
    }

    fn shadow_channel(&self, id: ChannelId) -> Option<Channel> {
        let shadow = self.inner.migration.lock().shadow.clone()?;
        shadow.lookup(id)
    }

    /// Suspend until `target` has parked its connection.
    async fn wait_parked(&self, target: &Channel, waiter: &Channel) -> bool {
        let parked = || target.shared.parked.lock().is_some();
        self.inner
            .main_ctx
            .condition_wait(parked, &waiter.shared.canceller)
            .await
    }

    /// Exchange `live` with the parked connection of `target`.
    fn exchange(&self, channel: &Channel, target: &Channel, live: &mut Box<LiveConnection>) -> bool {
        let full = self.inner.migration.lock().full;
        {
            let mut slot = target.shared.parked.lock();
            let Some(other) = slot.as_mut() else {
                warn!(channel = %channel.name(), "migration target is not parked");
                return false;
            };
            if full && !target.shared.xmit.is_empty() {
                debug!(channel = %channel.name(), "migration target has queued messages");
            }
            LiveConnection::exchange(live, other, !full);
        }
        if !full {
            TransmitQueue::swap_contents(&channel.shared.xmit, &target.shared.xmit);
        }
        channel.publish_caps(&live.caps);
        true
    }

    /// Swap a source channel onto its destination connection and close
    /// the migration once no channel is left.
    fn swap_into(&self, channel: &Channel, target: &Channel, live: &mut Box<LiveConnection>) {
        if !self.exchange(channel, target, live) {
            return;
        }
        info!(channel = %channel.name(), "migrated");
        let finished = {
            let mut m = self.inner.migration.lock();
            m.left.retain(|id| *id != channel.id());
            if m.left.is_empty() {
                m.shadow.take()
            } else {
                None
            }
        };
        if let Some(shadow) = finished {
            info!("migration: all channels migrated");
            shadow.disconnect();
            self.set_migration_state(MigrationState::None);
        }
    }

    /// Swap the channel driven by `ctx`.
    pub(crate) async fn channel_migrate(&self, ctx: &mut ChannelContext) {
        let channel = ctx.channel().clone();
        let Some(target) = self.shadow_channel(channel.id()) else {
            error!(channel = %channel.name(), "no migration target");
            return;
        };
        if !self.wait_parked(&target, &channel).await {
            warn!(channel = %channel.name(), "migration target never parked");
            return;
        }
        self.swap_into(&channel, &target, &mut ctx.live);
    }

    /// Swap a channel whose task is parked for migration.
    async fn migrate_parked(&self, channel: &Channel) -> bool {
        let Some(target) = self.shadow_channel(channel.id()) else {
            return false;
        };
        if !channel.is_running() {
            warn!(channel = %channel.name(), "channel not running, not migrated");
            return false;
        }
        if !self.wait_parked(channel, channel).await || !self.wait_parked(&target, channel).await {
            warn!(channel = %channel.name(), "migration wait cancelled");
            return false;
        }
        let mut slot = channel.shared.parked.lock();
        let Some(live) = slot.as_mut() else {
            return false;
        };
        live.reset();
        self.swap_into(channel, &target, live);
        true
    }

    /// `MIGRATE_END`: freeze the other channels, move main onto the new
    /// server and announce the end there.
    pub(crate) async fn migrate_end(&self, ctx: &mut ChannelContext) {
        let left = {
            let m = self.inner.migration.lock();
            if m.shadow.is_none() || m.left.is_empty() {
                warn!("migrate end without a migration");
                return;
            }
            m.left.clone()
        };
        for id in &left {
            if id.channel_type == ChannelType::Main {
                continue;
            }
            if let Some(channel) = self.lookup(*id) {
                channel.set_state(ChannelState::Migrating);
            }
        }

        ctx.live.reset();
        self.channel_migrate(ctx).await;

        let end = ctx
            .channel()
            .message(crate::message::client::main::MIGRATE_END);
        ctx.send(end);
        self.inner.migration.lock().wait_init = true;
    }

    /// Called on the migrated main channel's INIT. Returns `true` if the
    /// remaining channels are being swapped.
    pub(crate) fn migrate_after_main_init(&self) -> bool {
        {
            let mut m = self.inner.migration.lock();
            if !m.wait_init {
                return false;
            }
            m.wait_init = false;
            if m.left.is_empty() {
                return false;
            }
        }
        let session = self.clone();
        self.inner
            .main_ctx
            .spawn(async move { session.after_main_init().await });
        true
    }

    async fn after_main_init(&self) {
        let left = self.inner.migration.lock().left.clone();
        for id in left {
            if self.inner.migration.lock().shadow.is_none() {
                debug!("migration discarded, stop swapping");
                return;
            }
            let Some(channel) = self.lookup(id) else {
                continue;
            };
            if self.migrate_parked(&channel).await {
                channel.shared.up_pending.store(true, Ordering::Release);
            }
            if channel.state() == ChannelState::Migrating {
                channel.set_state(ChannelState::Ready);
            }
        }
    }

    /// `MIGRATE_CANCEL`: swap back what was swapped and drop the shadow.
    ///
    /// `ctx` is the main channel handling the cancel.
    pub(crate) async fn abort_migration(&self, ctx: &mut ChannelContext) {
        let (state, left) = {
            let m = self.inner.migration.lock();
            if m.shadow.is_none() {
                debug!("no migration in progress");
                return;
            }
            (m.state, m.left.clone())
        };
        info!("migration: abort");

        if state == MigrationState::Migrating {
            for channel in self.channels() {
                if left.contains(&channel.id()) {
                    continue;
                }
                let Some(target) = self.shadow_channel(channel.id()) else {
                    continue;
                };
                if channel.same(ctx.channel()) {
                    if self.wait_parked(&target, &channel).await {
                        self.exchange(&channel, &target, &mut ctx.live);
                    }
                    continue;
                }
                if !channel.is_running() {
                    continue;
                }
                channel.set_state(ChannelState::Migrating);
                if self.wait_parked(&channel, &channel).await
                    && self.wait_parked(&target, &channel).await
                {
                    let mut slot = channel.shared.parked.lock();
                    if let Some(live) = slot.as_mut() {
                        self.exchange(&channel, &target, live);
                    }
                }
                if channel.state() == ChannelState::Migrating {
                    channel.set_state(ChannelState::Ready);
                }
            }
        }
        self.discard_migration();
    }

    /// Forget the migration and close the shadow session.
    pub(crate) fn discard_migration(&self) {
        let shadow = {
            let mut m = self.inner.migration.lock();
            m.left.clear();
            m.wait_init = false;
            m.shadow.take()
        };
        if let Some(shadow) = shadow {
            shadow.disconnect();
        }
        self.set_migration_state(MigrationState::None);
    }

    /// `MIGRATE_SWITCH_HOST`: every channel but main goes away.
    pub(crate) fn switching_disconnect(&self) {
        for channel in self.channels() {
            if channel.channel_type() != ChannelType::Main {
                self.channel_destroy(&channel);
            }
        }
        self.set_connection_id(0);
        self.discard_migration();
    }
}
