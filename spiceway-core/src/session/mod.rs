//! Sessions: the set of channels talking to one server.
//!
//! A [`Session`] owns its channel registry, the connection parameters
//! every channel links with, and the migration coordinator (see
//! [`migration`]). Observers follow it through [`Session::subscribe`];
//! the session itself never decides to recreate a failed channel.
//!
//! ```text
//!          Session ──owns──► Channel (main:0) ──task──► server
//!             │      ──owns──► Channel (display:0) ──task──► server
//!             │
//!             └─ during a migration ─► shadow Session ──► destination
//! ```

pub mod config;
pub mod migration;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::auth::{DefaultSaslProvider, SaslCredentials, SaslProvider};
use crate::caps::CapabilityFilter;
use crate::channel::{Channel, ChannelId, ChannelKind, GenericKind, MainKind};
use crate::error::SpiceError;
use crate::event::{ChannelEvent, SessionEvent};
use crate::message::ChannelType;
use crate::network::{BoxedStream, Endpoint, TlsSettings, load_ca_file};
use crate::packet::IncomingMessage;
use crate::state::MigrationState;
use crate::task::MainContext;

pub use config::SessionConfig;
use migration::{HandshakeTracker, Migration};

/// Where payload messages of unhandled types are delivered.
pub type PayloadSink = mpsc::Sender<(ChannelId, Arc<IncomingMessage>)>;

pub(crate) type EventHook = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

const EVENT_CAPACITY: usize = 256;

// ── ServerInfo ───────────────────────────────────────────────────

/// What the main channel learned about the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub supported_mouse_modes: u32,
    pub current_mouse_mode: u32,
    pub multi_media_time: u32,
    pub agent_connected: bool,
    pub agent_tokens: u32,
    pub display_channels_hint: u32,
    pub ram_hint: u32,
}

// ── SessionInner ─────────────────────────────────────────────────

pub(crate) struct SessionInner {
    pub(crate) main_ctx: Arc<MainContext>,
    pub(crate) cap_filter: CapabilityFilter,
    config: RwLock<SessionConfig>,
    disabled_kinds: Vec<ChannelType>,
    kinds: HashMap<ChannelType, Arc<dyn ChannelKind>>,
    sasl_provider: Option<Arc<dyn SaslProvider>>,
    payload_sink: Option<PayloadSink>,
    client_provided_sockets: AtomicBool,
    /// Shadow of another session's migration.
    for_migration: bool,

    channels: Mutex<Vec<Channel>>,
    events: broadcast::Sender<SessionEvent>,
    hooks: Mutex<Vec<EventHook>>,

    connection_id: AtomicU32,
    protocol_major: AtomicU32,
    server_info: Mutex<ServerInfo>,
    migration: Mutex<Migration>,
    tracker: Mutex<Option<Arc<HandshakeTracker>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for channel in self.channels.get_mut().drain(..) {
            channel.disconnect(ChannelEvent::None);
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Configures the collaborators of a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    payload_sink: Option<PayloadSink>,
    sasl_provider: Option<Arc<dyn SaslProvider>>,
    kinds: HashMap<ChannelType, Arc<dyn ChannelKind>>,
    client_provided_sockets: bool,
}

impl SessionBuilder {
    /// Deliver payload messages no kind handles to `sink`.
    pub fn payload_sink(mut self, sink: PayloadSink) -> Self {
        self.payload_sink = Some(sink);
        self
    }

    /// Pick SASL mechanisms with `provider` instead of the built-in one.
    pub fn sasl_provider(mut self, provider: Arc<dyn SaslProvider>) -> Self {
        self.sasl_provider = Some(provider);
        self
    }

    /// Use `kind` for every channel of its type.
    pub fn kind(mut self, kind: Arc<dyn ChannelKind>) -> Self {
        self.kinds.insert(kind.channel_type(), kind);
        self
    }

    /// Channels wait for [`Session::open_stream`] / [`Channel::open_stream`]
    /// instead of connecting themselves.
    pub fn client_provided_sockets(mut self, enabled: bool) -> Self {
        self.client_provided_sockets = enabled;
        self
    }

    /// Build the session. Must be called from within a tokio runtime.
    pub fn build(self) -> Session {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cap_filter = CapabilityFilter::new(self.config.disabled_capabilities.clone());
        let disabled_kinds = self.config.disabled_kinds();
        let protocol = self.config.protocol;
        Session {
            inner: Arc::new(SessionInner {
                main_ctx: MainContext::start(),
                cap_filter,
                config: RwLock::new(self.config),
                disabled_kinds,
                kinds: self.kinds,
                sasl_provider: self.sasl_provider,
                payload_sink: self.payload_sink,
                client_provided_sockets: AtomicBool::new(self.client_provided_sockets),
                for_migration: false,
                channels: Mutex::new(Vec::new()),
                events,
                hooks: Mutex::new(Vec::new()),
                connection_id: AtomicU32::new(0),
                protocol_major: AtomicU32::new(protocol),
                server_info: Mutex::new(ServerInfo::default()),
                migration: Mutex::new(Migration::default()),
                tracker: Mutex::new(None),
            }),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Cheap handle onto a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A session with default collaborators. Must be called from within
    /// a tokio runtime.
    pub fn new(config: SessionConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            payload_sink: None,
            sasl_provider: None,
            kinds: HashMap::new(),
            client_provided_sockets: false,
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// A session for the destination of `source`'s migration.
    ///
    /// Shares the event loop and channel kinds; payload is never
    /// delivered from a shadow.
    fn shadow_of(source: &Session) -> Self {
        let src = &source.inner;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Session {
            inner: Arc::new(SessionInner {
                main_ctx: Arc::clone(&src.main_ctx),
                cap_filter: src.cap_filter.clone(),
                config: RwLock::new(src.config.read().clone()),
                disabled_kinds: src.disabled_kinds.clone(),
                kinds: src.kinds.clone(),
                sasl_provider: src.sasl_provider.clone(),
                payload_sink: None,
                client_provided_sockets: AtomicBool::new(false),
                for_migration: true,
                channels: Mutex::new(Vec::new()),
                events,
                hooks: Mutex::new(Vec::new()),
                connection_id: AtomicU32::new(source.connection_id()),
                protocol_major: AtomicU32::new(source.protocol_major()),
                server_info: Mutex::new(ServerInfo::default()),
                migration: Mutex::new(Migration::default()),
                tracker: Mutex::new(None),
            }),
        }
    }

    // ── Connecting ───────────────────────────────────────────────

    /// Create the main channel and connect it. The server then announces
    /// the other channels.
    pub fn connect(&self) -> Result<Channel, SpiceError> {
        let main = self.main_channel();
        main.connect()?;
        Ok(main)
    }

    /// Connect the main channel over a stream the caller opened.
    pub fn open_stream(&self, stream: BoxedStream) -> Result<Channel, SpiceError> {
        self.inner
            .client_provided_sockets
            .store(true, Ordering::Release);
        let main = self.main_channel();
        main.open_stream(stream)?;
        Ok(main)
    }

    /// Connect the main channel over a descriptor the caller opened.
    #[cfg(unix)]
    pub fn open_fd(&self, fd: std::os::fd::OwnedFd) -> Result<Channel, SpiceError> {
        self.open_stream(crate::network::connection::stream_from_fd(fd)?)
    }

    fn main_channel(&self) -> Channel {
        self.lookup_channel(ChannelType::Main, 0)
            .unwrap_or_else(|| self.channel_new(ChannelType::Main, 0))
    }

    /// Disconnect and destroy every channel.
    pub fn disconnect(&self) {
        info!(migration = self.inner.for_migration, "session disconnecting");
        for channel in self.channels() {
            self.channel_destroy(&channel);
        }
        self.inner.connection_id.store(0, Ordering::Release);
        self.discard_migration();
    }

    // ── Registry ─────────────────────────────────────────────────

    /// Create and register channel `id` of type `ty`.
    pub fn channel_new(&self, ty: ChannelType, id: u8) -> Channel {
        let kind = self.kind_for(ty);
        let disabled = self.inner.disabled_kinds.contains(&ty);
        let channel = Channel::new(&self.inner, kind, id, disabled);
        debug!(channel = %channel.name(), disabled, "channel created");
        self.inner.channels.lock().push(channel.clone());
        self.emit(SessionEvent::ChannelNew(channel.id()));
        channel
    }

    fn kind_for(&self, ty: ChannelType) -> Arc<dyn ChannelKind> {
        if let Some(kind) = self.inner.kinds.get(&ty) {
            return Arc::clone(kind);
        }
        match ty {
            ChannelType::Main => Arc::new(MainKind),
            other => Arc::new(GenericKind::new(other)),
        }
    }

    /// Remove `channel` from the session and close it.
    pub fn channel_destroy(&self, channel: &Channel) {
        let removed = {
            let mut channels = self.inner.channels.lock();
            let before = channels.len();
            channels.retain(|c| !c.same(channel));
            channels.len() != before
        };
        if !removed {
            debug!(channel = %channel.name(), "destroy of unknown channel");
            return;
        }
        self.emit(SessionEvent::ChannelDestroy(channel.id()));
        channel.disconnect(ChannelEvent::Closed);
    }

    pub fn lookup_channel(&self, ty: ChannelType, id: u8) -> Option<Channel> {
        self.inner
            .channels
            .lock()
            .iter()
            .find(|c| c.id() == ChannelId::new(ty, id))
            .cloned()
    }

    pub(crate) fn lookup(&self, id: ChannelId) -> Option<Channel> {
        self.lookup_channel(id.channel_type, id.id)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.lock().clone()
    }

    // ── Events ───────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let hooks = self.inner.hooks.lock().clone();
        for hook in hooks {
            hook(&event);
        }
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn add_hook(&self, hook: EventHook) {
        self.inner.hooks.lock().push(hook);
    }

    // ── Connection parameters ────────────────────────────────────

    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut SessionConfig)) {
        f(&mut self.inner.config.write());
    }

    pub fn host(&self) -> String {
        self.inner.config.read().host.clone()
    }

    pub fn password(&self) -> Option<String> {
        self.inner.config.read().password.clone()
    }

    pub fn read_only(&self) -> bool {
        self.inner.config.read().read_only
    }

    pub fn client_provided_sockets(&self) -> bool {
        self.inner.client_provided_sockets.load(Ordering::Acquire)
    }

    pub fn is_migration_shadow(&self) -> bool {
        self.inner.for_migration
    }

    /// `true` if channels of `ty` must connect over TLS.
    pub fn wants_tls(&self, ty: ChannelType) -> bool {
        self.inner.config.read().is_secure(ty)
    }

    pub fn has_tls_port(&self) -> bool {
        self.inner.config.read().tls_port.is_some()
    }

    /// Where a channel of `ty` connects to.
    ///
    /// Sets `use_tls` when only the TLS port can serve the channel.
    pub fn endpoint_for(&self, ty: ChannelType, use_tls: &mut bool) -> Result<Endpoint, SpiceError> {
        let cfg = self.inner.config.read();
        if let Some(path) = &cfg.unix_path {
            *use_tls = false;
            return Ok(Endpoint::Unix(path.clone()));
        }
        if *use_tls || cfg.is_secure(ty) {
            let port = cfg
                .tls_port
                .ok_or(SpiceError::SetupIncomplete("no tls port configured"))?;
            *use_tls = true;
            return Ok(Endpoint::tcp(cfg.host.clone(), port));
        }
        match (cfg.port, cfg.tls_port) {
            (Some(port), _) => Ok(Endpoint::tcp(cfg.host.clone(), port)),
            (None, Some(port)) => {
                *use_tls = true;
                Ok(Endpoint::tcp(cfg.host.clone(), port))
            }
            (None, None) => Err(SpiceError::SetupIncomplete("no port configured")),
        }
    }

    /// Certificate policy for TLS channels.
    pub fn tls_settings(&self) -> Result<TlsSettings, SpiceError> {
        let cfg = self.inner.config.read();
        let roots = cfg
            .ca_file
            .as_deref()
            .map(load_ca_file)
            .transpose()?
            .map(Arc::new);
        let pubkey = cfg.pubkey_der().map_err(SpiceError::Config)?;
        Ok(TlsSettings {
            verify: cfg.verify,
            roots,
            pubkey,
            subject: cfg.cert_subject.clone(),
        })
    }

    /// The configured SASL provider, or the built-in one when a user
    /// name is configured.
    pub fn sasl_provider(&self) -> Option<Arc<dyn SaslProvider>> {
        if let Some(provider) = &self.inner.sasl_provider {
            return Some(Arc::clone(provider));
        }
        let has_user = self.inner.config.read().username.is_some();
        has_user.then(|| Arc::new(DefaultSaslProvider) as Arc<dyn SaslProvider>)
    }

    pub fn sasl_credentials(&self) -> SaslCredentials {
        let cfg = self.inner.config.read();
        SaslCredentials {
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            host: cfg.host.clone(),
        }
    }

    pub(crate) fn payload_sink(&self) -> Option<PayloadSink> {
        self.inner.payload_sink.clone()
    }

    pub fn protocol_major(&self) -> u32 {
        self.inner.protocol_major.load(Ordering::Acquire)
    }

    pub(crate) fn set_protocol_major(&self, major: u32) {
        info!(major, "falling back to an older protocol version");
        self.inner.protocol_major.store(major, Ordering::Release);
    }

    /// Session id assigned by the server's main channel.
    pub fn connection_id(&self) -> u32 {
        self.inner.connection_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_connection_id(&self, id: u32) {
        self.inner.connection_id.store(id, Ordering::Release);
    }

    // ── Server info ──────────────────────────────────────────────

    pub fn server_info(&self) -> ServerInfo {
        self.inner.server_info.lock().clone()
    }

    pub(crate) fn update_server_info(&self, f: impl FnOnce(&mut ServerInfo)) {
        f(&mut self.inner.server_info.lock());
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host())
            .field("connection_id", &self.connection_id())
            .field("channels", &self.inner.channels.lock().len())
            .field("migration", &self.migration_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_tracks_channels() {
        let session = Session::new(SessionConfig::default());
        let mut events = session.subscribe();

        let display = session.channel_new(ChannelType::Display, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ChannelNew(display.id())
        );
        assert!(session.lookup_channel(ChannelType::Display, 1).is_some());
        assert!(session.lookup_channel(ChannelType::Display, 0).is_none());

        session.channel_destroy(&display);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ChannelDestroy(display.id())
        );
        assert!(session.channels().is_empty());
    }

    #[tokio::test]
    async fn endpoint_selection() {
        let session = Session::new(SessionConfig {
            host: "spice.test".into(),
            port: Some(5900),
            tls_port: Some(5901),
            secure_channels: vec!["main".into()],
            ..Default::default()
        });

        let mut tls = false;
        let ep = session.endpoint_for(ChannelType::Display, &mut tls).unwrap();
        assert_eq!(ep, Endpoint::tcp("spice.test", 5900));
        assert!(!tls);

        let ep = session.endpoint_for(ChannelType::Main, &mut tls).unwrap();
        assert_eq!(ep, Endpoint::tcp("spice.test", 5901));
        assert!(tls);
    }

    #[tokio::test]
    async fn tls_only_server() {
        let session = Session::new(SessionConfig {
            tls_port: Some(5901),
            ..Default::default()
        });
        let mut tls = false;
        let ep = session.endpoint_for(ChannelType::Inputs, &mut tls).unwrap();
        assert_eq!(ep, Endpoint::tcp("localhost", 5901));
        assert!(tls);

        let portless = Session::new(SessionConfig::default());
        let mut tls = false;
        assert!(matches!(
            portless.endpoint_for(ChannelType::Main, &mut tls),
            Err(SpiceError::SetupIncomplete(_))
        ));
    }

    #[tokio::test]
    async fn sasl_provider_needs_a_user() {
        let anonymous = Session::new(SessionConfig::default());
        assert!(anonymous.sasl_provider().is_none());

        let named = Session::new(SessionConfig {
            username: Some("alice".into()),
            ..Default::default()
        });
        assert!(named.sasl_provider().is_some());
        assert_eq!(named.sasl_credentials().username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn disconnect_destroys_everything() {
        let session = Session::new(SessionConfig::default());
        session.channel_new(ChannelType::Main, 0);
        session.channel_new(ChannelType::Display, 0);
        session.set_connection_id(42);

        session.disconnect();
        assert!(session.channels().is_empty());
        assert_eq!(session.connection_id(), 0);
        assert_eq!(session.migration_state(), MigrationState::None);
    }

    #[tokio::test]
    async fn hooks_see_every_event() {
        let session = Session::new(SessionConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.add_hook(Arc::new(move |event| sink.lock().push(event.clone())));

        let cursor = session.channel_new(ChannelType::Cursor, 0);
        session.emit(SessionEvent::Channel {
            id: cursor.id(),
            event: ChannelEvent::Opened,
        });
        assert_eq!(seen.lock().len(), 2);
    }
}
