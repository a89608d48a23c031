//! Connection engine: setup handshake, authorization tracking,
//! keepalive, timeout-driven reconnection, and channel multiplexing
//! over a single transport.
//!
//! # Serialization
//!
//! All engine state lives behind one mutex; transport events and timer
//! firings funnel through it, which is the engine's single logical
//! delivery queue. Listener dispatch and channel fan-out always happen
//! after the lock is released, so listeners may call back into the
//! engine. Sends are synchronous enqueues to the transport writer, so
//! no await ever happens under the lock.
//!
//! # Staleness
//!
//! Every transport teardown bumps an epoch counter. Transport pumps and
//! timer callbacks carry the epoch they were created under and are
//! discarded on mismatch, so late events from a dead transport cannot
//! corrupt the next session.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, trace, warn};

use weft_protocol::{
    AuthState, AuthStatePayload, CONNECTION_CHANNEL, ChannelOpenedPayload, ErrorPayload,
    MessageClass, PROTOCOL_VERSION, SetupPayload, TIMEOUT_ERROR, WireMessage, build_auth,
    build_channel_request, build_error, build_keepalive, build_setup, classify,
    is_connection_kind, msg,
};

use crate::channel::{Channel, ChannelStatus, SendFn};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::listeners::{ListenerId, ListenerSet};
use crate::timers::{TimerKey, TimerRegistry};
use crate::transport::{Transport, TransportEvent, TransportFactory, WebSocketFactory};

/// Peer-liveness checks are never scheduled closer than this.
const LIVENESS_FLOOR: Duration = Duration::from_millis(200);

/// Linear reconnect backoff step: attempt N waits `N * 1000 ms`.
const RECONNECT_STEP_MS: u64 = 1000;

/// Connection lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport. Initial and terminal.
    NotConnected,
    /// Transport starting or restarting; setup not complete.
    Connecting,
    /// Setup complete and, when a token is involved, authorized.
    Connected,
}

/// Negotiated connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    /// Protocol version the client speaks.
    pub protocol_version: String,
    /// Client software version.
    pub client_version: String,
    /// Server version learned from `SETUP`, if any.
    pub server_version: Option<String>,
    /// Keepalive timeout advertised by the client, in seconds.
    pub client_keepalive_timeout: u64,
    /// Keepalive budget learned from the server's `SETUP`, in seconds.
    pub server_keepalive_timeout: Option<u64>,
}

impl ConnectionDetails {
    fn from_config(config: &ClientConfig) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            server_version: None,
            client_keepalive_timeout: config.keepalive_timeout,
            server_keepalive_timeout: None,
        }
    }
}

type ConnectionStateListener = dyn Fn(ConnectionState, ConnectionState) + Send + Sync;
type AuthStateListener = dyn Fn(AuthState, AuthState) + Send + Sync;
type ErrorListener = dyn Fn(&ClientError) + Send + Sync;
type Waiter = oneshot::Sender<Result<(), ClientError>>;

/// Client-side engine for the weft protocol.
///
/// Cheap to clone; all clones share one engine. Must be used from
/// within a Tokio runtime (timers and transports are spawned tasks).
#[derive(Clone)]
pub struct WeftClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for WeftClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeftClient")
            .field("connection_state", &self.connection_state())
            .field("auth_state", &self.auth_state())
            .finish_non_exhaustive()
    }
}

struct EngineState {
    connection_state: ConnectionState,
    auth_state: AuthState,
    details: ConnectionDetails,
    url: Option<String>,
    transport: Option<Box<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    /// Bumped on every transport teardown; stale callbacks check it.
    epoch: u64,
    auth_token: Option<String>,
    /// The first `AUTH_STATE` per transport open is informational.
    first_auth_state: bool,
    reconnect_attempts: u32,
    last_received: Option<Instant>,
    last_sent: Option<Instant>,
    next_channel_id: u64,
    channels: BTreeMap<u64, Channel>,
    connect_waiters: Vec<Waiter>,
    auth_waiters: Vec<Waiter>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    factory: Box<dyn TransportFactory>,
    weak: Weak<ClientInner>,
    state: Mutex<EngineState>,
    timers: TimerRegistry,
    connection_listeners: ListenerSet<ConnectionStateListener>,
    auth_listeners: ListenerSet<AuthStateListener>,
    error_listeners: ListenerSet<ErrorListener>,
}

enum ConnectOutcome {
    AlreadyConnected,
    Pending(oneshot::Receiver<Result<(), ClientError>>),
}

/// Deferred outcome of a connection-state change, dispatched after the
/// engine lock is released.
struct ConnectionTransition {
    change: Option<(ConnectionState, ConnectionState)>,
    waiters: Vec<Waiter>,
    ok: bool,
}

impl ConnectionTransition {
    fn none() -> Self {
        Self {
            change: None,
            waiters: Vec::new(),
            ok: true,
        }
    }
}

impl WeftClient {
    /// Create an engine using the WebSocket transport.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport_factory(config, Box::new(WebSocketFactory))
    }

    /// Create an engine with a custom transport factory.
    #[must_use]
    pub fn with_transport_factory(config: ClientConfig, factory: Box<dyn TransportFactory>) -> Self {
        let details = ConnectionDetails::from_config(&config);
        let inner = Arc::new_cyclic(|weak| ClientInner {
            config,
            factory,
            weak: weak.clone(),
            state: Mutex::new(EngineState {
                connection_state: ConnectionState::NotConnected,
                auth_state: AuthState::Unauthorized,
                details,
                url: None,
                transport: None,
                pump: None,
                epoch: 0,
                auth_token: None,
                first_auth_state: true,
                reconnect_attempts: 0,
                last_received: None,
                last_sent: None,
                next_channel_id: 1,
                channels: BTreeMap::new(),
                connect_waiters: Vec::new(),
                auth_waiters: Vec::new(),
            }),
            timers: TimerRegistry::new(),
            connection_listeners: ListenerSet::new(),
            auth_listeners: ListenerSet::new(),
            error_listeners: ListenerSet::new(),
        });
        Self { inner }
    }

    /// Connect to `url`.
    ///
    /// The setup runs eagerly: any prior connection is torn down, the
    /// transport is created and started, and the state moves to
    /// [`ConnectionState::Connecting`] before this method returns. The
    /// returned future resolves on the next transition to
    /// [`ConnectionState::Connected`] and fails with
    /// [`ClientError::Disconnected`] on the next transition to
    /// [`ConnectionState::NotConnected`].
    ///
    /// Connecting to the url of the live transport is a no-op that
    /// resolves immediately.
    pub fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send + use<> {
        let outcome = self.inner.begin_connect(url);
        async move {
            match outcome {
                ConnectOutcome::AlreadyConnected => Ok(()),
                ConnectOutcome::Pending(rx) => match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Disconnected),
                },
            }
        }
    }

    /// Tear the transport down and retry it after a linear backoff.
    /// No-op while [`ConnectionState::NotConnected`].
    pub fn reconnect(&self) {
        self.inner.reconnect();
    }

    /// Tear everything down. No-op while already
    /// [`ConnectionState::NotConnected`].
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.locked().connection_state
    }

    /// Current authorization state.
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.inner.locked().auth_state
    }

    /// Negotiated connection parameters.
    #[must_use]
    pub fn connection_details(&self) -> ConnectionDetails {
        self.inner.locked().details.clone()
    }

    /// Remember `token` and, if currently connected, submit it
    /// immediately.
    ///
    /// The token is replayed on every transport open until the server
    /// explicitly rejects it.
    pub fn set_auth_token(&self, token: &str) {
        self.inner.set_auth_token(token, None);
    }

    /// Remember `token` like [`Self::set_auth_token`] and return a
    /// completion resolved exactly once, on the first
    /// [`AuthState::Authorized`] after submission. It fails with
    /// [`ClientError::AuthTimeout`] when the `AUTH_STATE` budget lapses
    /// and with [`ClientError::Disconnected`] on teardown.
    pub fn authorize(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        self.inner.set_auth_token(token, Some(tx));
        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Disconnected),
            }
        }
    }

    /// Open a logical channel for `service`.
    ///
    /// The channel starts as [`ChannelStatus::Requested`]. The request
    /// goes out immediately when the connection is connected and
    /// authorized; otherwise it is sent automatically once it becomes
    /// both.
    pub fn open_channel(&self, service: &str, parameters: Map<String, Value>) -> Channel {
        self.inner.open_channel(service, parameters)
    }

    /// Register a connection-state listener receiving
    /// `(new, previous)`.
    pub fn add_connection_state_listener(
        &self,
        listener: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.connection_listeners.add(Arc::new(listener))
    }

    /// Remove a connection-state listener.
    pub fn remove_connection_state_listener(&self, id: ListenerId) -> bool {
        self.inner.connection_listeners.remove(id)
    }

    /// Register an auth-state listener receiving `(new, previous)`.
    pub fn add_auth_state_listener(
        &self,
        listener: impl Fn(AuthState, AuthState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.auth_listeners.add(Arc::new(listener))
    }

    /// Remove an auth-state listener.
    pub fn remove_auth_state_listener(&self, id: ListenerId) -> bool {
        self.inner.auth_listeners.remove(id)
    }

    /// Register an error listener. While no error listeners are
    /// registered, published errors are logged at error level instead.
    pub fn add_error_listener(
        &self,
        listener: impl Fn(&ClientError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.error_listeners.add(Arc::new(listener))
    }

    /// Remove an error listener.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.error_listeners.remove(id)
    }
}

impl ClientInner {
    fn locked(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state poisoned")
    }

    // ── Connect / disconnect / reconnect ─────────────────────

    fn begin_connect(&self, url: &str) -> ConnectOutcome {
        {
            let state = self.locked();
            if state.transport.as_ref().is_some_and(|t| t.url() == url) {
                debug!(url, "connect: transport already exists for this url");
                return ConnectOutcome::AlreadyConnected;
            }
        }
        self.disconnect();

        let (tx, rx) = oneshot::channel();
        let transition = {
            let mut state = self.locked();
            info!(url, "connecting");
            state.url = Some(url.to_owned());
            state.connect_waiters.push(tx);
            let transition = self.set_connection_state_locked(&mut state, ConnectionState::Connecting);
            self.start_transport_locked(&mut state, url);
            transition
        };
        self.finish_connection_transition(transition);
        ConnectOutcome::Pending(rx)
    }

    pub(crate) fn disconnect(&self) {
        let (transition, auth_change, auth_waiters) = {
            let mut state = self.locked();
            if state.connection_state == ConnectionState::NotConnected {
                return;
            }
            info!("disconnecting");
            self.teardown_transport_locked(&mut state);
            state.url = None;
            self.reset_session_locked(&mut state);
            state.reconnect_attempts = 0;
            let transition =
                self.set_connection_state_locked(&mut state, ConnectionState::NotConnected);
            let auth_change = self.set_auth_state_locked(&mut state, AuthState::Unauthorized);
            let auth_waiters = std::mem::take(&mut state.auth_waiters);
            (transition, auth_change, auth_waiters)
        };
        self.finish_connection_transition(transition);
        self.dispatch_auth_change(auth_change);
        for waiter in auth_waiters {
            let _ = waiter.send(Err(ClientError::Disconnected));
        }
    }

    pub(crate) fn reconnect(&self) {
        let transition = {
            let mut state = self.locked();
            if state.connection_state == ConnectionState::NotConnected {
                return;
            }
            self.teardown_transport_locked(&mut state);
            self.reset_session_locked(&mut state);
            state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
            let delay_ms = u64::from(state.reconnect_attempts).saturating_mul(RECONNECT_STEP_MS);
            info!(
                attempt = state.reconnect_attempts,
                delay_ms, "scheduling reconnect"
            );

            let epoch = state.epoch;
            let weak = self.weak.clone();
            self.timers.schedule(
                TimerKey::Reconnect,
                Duration::from_millis(delay_ms),
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_reconnect_due(epoch);
                    }
                },
            );
            self.set_connection_state_locked(&mut state, ConnectionState::Connecting)
        };
        self.finish_connection_transition(transition);
    }

    fn on_reconnect_due(&self, epoch: u64) {
        let mut state = self.locked();
        if state.epoch != epoch || state.connection_state != ConnectionState::Connecting {
            return;
        }
        let Some(url) = state.url.clone() else {
            return;
        };
        debug!(url = %url, "restarting transport");
        self.start_transport_locked(&mut state, &url);
    }

    fn start_transport_locked(&self, state: &mut EngineState, url: &str) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(url, events_tx);
        transport.start();
        state.transport = Some(transport);
        state.pump = Some(self.spawn_pump(state.epoch, events_rx));
    }

    fn spawn_pump(
        &self,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_transport_event(epoch, event);
            }
        })
    }

    fn teardown_transport_locked(&self, state: &mut EngineState) {
        state.epoch = state.epoch.wrapping_add(1);
        self.timers.cancel_all();
        if let Some(transport) = state.transport.take() {
            transport.stop();
        }
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }

    /// Reset the per-transport session state (details, liveness marks,
    /// the first-auth-state flag). Token and channels survive.
    fn reset_session_locked(&self, state: &mut EngineState) {
        state.details = ConnectionDetails::from_config(&self.config);
        state.last_received = None;
        state.last_sent = None;
        state.first_auth_state = true;
    }

    // ── Transport events ─────────────────────────────────────

    pub(crate) fn handle_transport_event(&self, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_transport_open(epoch),
            TransportEvent::Message(message) => self.on_transport_message(epoch, &message),
            TransportEvent::Closed(failure) => self.on_transport_closed(epoch, failure),
        }
    }

    fn on_transport_open(&self, epoch: u64) {
        let auth_change = {
            let mut state = self.locked();
            if state.epoch != epoch || state.transport.is_none() {
                return;
            }
            debug!(url = ?state.url, "transport open; sending SETUP");
            let setup = build_setup(
                &state.details.client_version,
                self.config.keepalive_timeout,
                self.config.accept_keepalive_timeout,
            );
            if self.send_message_locked(&mut state, setup).is_err() {
                return;
            }
            self.arm_action_timeout(epoch, TimerKey::SetupTimeout);
            self.arm_action_timeout(epoch, TimerKey::AuthStateTimeout);

            if let Some(token) = state.auth_token.clone() {
                let _ = self.send_message_locked(&mut state, build_auth(&token));
                self.set_auth_state_locked(&mut state, AuthState::Authorizing)
            } else {
                None
            }
        };
        self.dispatch_auth_change(auth_change);
    }

    fn on_transport_message(&self, epoch: u64, message: &WireMessage) {
        {
            let mut state = self.locked();
            if state.epoch != epoch {
                return;
            }
            // Liveness bookkeeping happens before any handler observes
            // the message.
            state.last_received = Some(Instant::now());

            // Opportunistic keepalive: compensates for suspended timers
            // on backgrounded runtimes.
            let interval = Duration::from_secs(self.config.keepalive_interval);
            let due = state.last_sent.is_some_and(|sent| sent.elapsed() >= interval);
            if due {
                let _ = self.send_message_locked(&mut state, build_keepalive());
            }
        }

        match classify(message) {
            MessageClass::Connection => self.handle_connection_message(epoch, message),
            MessageClass::ChannelLifecycle | MessageClass::ChannelPayload => {
                self.handle_channel_message(epoch, message);
            }
        }
    }

    fn on_transport_closed(&self, epoch: u64, failure: Option<Box<tungstenite::Error>>) {
        let rejected = {
            let mut state = self.locked();
            if state.epoch != epoch {
                return;
            }
            if state.auth_state == AuthState::Unauthorized {
                info!("transport closed while unauthorized; dropping token");
                state.auth_token = None;
                true
            } else {
                false
            }
        };
        // Surface the socket error that killed the transport before the
        // state changes.
        if let Some(error) = failure {
            self.publish_error(&ClientError::WebSocket(error));
        }
        if rejected {
            self.disconnect();
        } else {
            warn!("transport closed; reconnecting");
            self.reconnect();
        }
    }

    // ── Connection-level messages ────────────────────────────

    fn handle_connection_message(&self, epoch: u64, message: &WireMessage) {
        if !is_connection_kind(&message.kind) {
            debug!(kind = %message.kind, "ignoring unrecognized connection message");
            return;
        }
        match message.kind.as_str() {
            msg::SETUP => self.handle_setup(epoch, message),
            msg::AUTH_STATE => self.handle_auth_state(epoch, message),
            // Acknowledged implicitly by the lastReceived update.
            msg::KEEPALIVE => {}
            msg::ERROR => self.handle_connection_error(message),
            // Only AUTH remains, and it is send-only; a server echo is
            // ignored.
            _ => debug!("ignoring unexpected AUTH from server"),
        }
    }

    fn handle_setup(&self, epoch: u64, message: &WireMessage) {
        let payload: SetupPayload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed SETUP");
                self.publish_error(&ClientError::Json(e));
                return;
            }
        };

        let transition = {
            let mut state = self.locked();
            if state.epoch != epoch {
                return;
            }
            self.timers.cancel(TimerKey::SetupTimeout);
            info!(
                server_version = %payload.version,
                server_keepalive_timeout = ?payload.keepalive_timeout,
                "SETUP complete"
            );
            state.details.server_version = Some(payload.version);
            if let Some(timeout) = payload.keepalive_timeout {
                state.details.server_keepalive_timeout = Some(timeout);
            }
            state.reconnect_attempts = 0;

            let transition = if state.auth_token.is_none() {
                // The server requires no auth for this session.
                self.set_connection_state_locked(&mut state, ConnectionState::Connected)
            } else {
                ConnectionTransition::none()
            };

            let budget = self.liveness_budget(&state);
            self.arm_liveness(epoch, budget);
            transition
        };
        self.finish_connection_transition(transition);
    }

    fn handle_auth_state(&self, epoch: u64, message: &WireMessage) {
        let payload: AuthStatePayload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed AUTH_STATE");
                self.publish_error(&ClientError::Json(e));
                return;
            }
        };
        let next = payload.state;

        let mut transition = ConnectionTransition::none();
        let mut auth_waiters = Vec::new();
        let mut refreshed = Vec::new();
        let auth_change = {
            let mut state = self.locked();
            if state.epoch != epoch {
                return;
            }
            self.timers.cancel(TimerKey::AuthStateTimeout);

            let first = std::mem::replace(&mut state.first_auth_state, false);
            if first {
                debug!(state = %next, "first AUTH_STATE (informational)");
            } else if next == AuthState::Unauthorized {
                info!("authorization rejected; clearing remembered token");
                state.auth_token = None;
            }

            if next == AuthState::Authorized {
                transition =
                    self.set_connection_state_locked(&mut state, ConnectionState::Connected);
                auth_waiters = std::mem::take(&mut state.auth_waiters);
                refreshed = self.request_active_channels_locked(&mut state);
            }

            self.set_auth_state_locked(&mut state, next)
        };

        self.finish_connection_transition(transition);
        self.dispatch_auth_change(auth_change);
        for waiter in auth_waiters {
            let _ = waiter.send(Ok(()));
        }
        for channel in refreshed {
            channel.process_status_requested();
        }
    }

    fn handle_connection_error(&self, message: &WireMessage) {
        match message.payload::<ErrorPayload>() {
            Ok(payload) => {
                warn!(kind = %payload.error, message = %payload.message, "server error");
                self.publish_error(&ClientError::Server {
                    kind: payload.error,
                    message: payload.message,
                });
            }
            Err(e) => {
                warn!(error = %e, "malformed ERROR message");
                self.publish_error(&ClientError::Json(e));
            }
        }
    }

    // ── Channel messages ─────────────────────────────────────

    fn handle_channel_message(&self, epoch: u64, message: &WireMessage) {
        let channel = {
            let state = self.locked();
            if state.epoch != epoch {
                return;
            }
            match state.channels.get(&message.channel) {
                Some(channel) => channel.clone(),
                None => {
                    warn!(
                        channel = message.channel,
                        kind = %message.kind,
                        "message for unknown channel dropped"
                    );
                    return;
                }
            }
        };

        match message.kind.as_str() {
            msg::CHANNEL_OPENED => match message.payload::<ChannelOpenedPayload>() {
                Ok(payload) => {
                    if payload.service != channel.service() {
                        warn!(
                            channel = message.channel,
                            expected = %channel.service(),
                            confirmed = %payload.service,
                            "CHANNEL_OPENED service mismatch"
                        );
                    }
                    debug!(
                        channel = message.channel,
                        service = %payload.service,
                        "channel opened by server"
                    );
                    channel.process_status_opened();
                }
                Err(e) => {
                    warn!(error = %e, "malformed CHANNEL_OPENED");
                    channel.process_error(&ClientError::Json(e));
                }
            },
            msg::CHANNEL_CLOSED => {
                debug!(channel = message.channel, "channel closed by server");
                channel.process_status_closed();
            }
            msg::ERROR => match message.payload::<ErrorPayload>() {
                Ok(payload) => {
                    channel.process_error(&ClientError::Server {
                        kind: payload.error,
                        message: payload.message,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "malformed channel ERROR");
                    channel.process_error(&ClientError::Json(e));
                }
            },
            msg::CHANNEL_REQUEST | msg::CHANNEL_CANCEL => {
                self.publish_error(&ClientError::Protocol(format!(
                    "unexpected {} from server on channel {}",
                    message.kind, message.channel
                )));
            }
            _ => channel.process_payload_message(message),
        }
    }

    // ── Authorization ────────────────────────────────────────

    fn set_auth_token(&self, token: &str, waiter: Option<Waiter>) {
        let auth_change = {
            let mut state = self.locked();
            state.auth_token = Some(token.to_owned());
            if let Some(waiter) = waiter {
                state.auth_waiters.push(waiter);
            }
            if state.connection_state == ConnectionState::Connected {
                let _ = self.send_message_locked(&mut state, build_auth(token));
                self.set_auth_state_locked(&mut state, AuthState::Authorizing)
            } else {
                None
            }
        };
        self.dispatch_auth_change(auth_change);
    }

    // ── Channels ─────────────────────────────────────────────

    fn open_channel(&self, service: &str, parameters: Map<String, Value>) -> Channel {
        let weak = self.weak.clone();
        let outbound: SendFn = Arc::new(move |message| match weak.upgrade() {
            Some(inner) => inner.send_message(message),
            None => Err(ClientError::Disconnected),
        });

        let mut state = self.locked();
        let id = state.next_channel_id;
        state.next_channel_id = id.saturating_add(2);
        let channel = Channel::new(id, service.to_owned(), parameters, outbound);
        state.channels.insert(id, channel.clone());
        debug!(id, service, "channel registered");

        if state.connection_state == ConnectionState::Connected
            && state.auth_state == AuthState::Authorized
        {
            let request = build_channel_request(id, channel.service(), channel.parameters());
            let _ = self.send_message_locked(&mut state, request);
        }
        channel
    }

    /// On reauthorization: prune closed channels and re-request the
    /// rest. Returns the channels whose status must return to
    /// `Requested` (notified by the caller outside the lock).
    fn request_active_channels_locked(&self, state: &mut EngineState) -> Vec<Channel> {
        state.channels.retain(|id, channel| {
            let keep = channel.status() != ChannelStatus::Closed;
            if !keep {
                debug!(id = *id, "pruning closed channel");
            }
            keep
        });

        let refreshed: Vec<Channel> = state.channels.values().cloned().collect();
        for channel in &refreshed {
            let request =
                build_channel_request(channel.id(), channel.service(), channel.parameters());
            let _ = self.send_message_locked(state, request);
        }
        refreshed
    }

    // ── Sending & keepalive ──────────────────────────────────

    fn send_message(&self, message: WireMessage) -> Result<(), ClientError> {
        let mut state = self.locked();
        self.send_message_locked(&mut state, message)
    }

    fn send_message_locked(
        &self,
        state: &mut EngineState,
        message: WireMessage,
    ) -> Result<(), ClientError> {
        let Some(transport) = state.transport.as_ref() else {
            return Err(ClientError::NotConnected);
        };
        trace!(kind = %message.kind, channel = message.channel, "sending message");
        transport.send(message)?;
        state.last_sent = Some(Instant::now());
        self.arm_keepalive(state.epoch);
        Ok(())
    }

    fn arm_keepalive(&self, epoch: u64) {
        let weak = self.weak.clone();
        let delay = Duration::from_secs(self.config.keepalive_interval);
        self.timers.schedule(TimerKey::Keepalive, delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_keepalive_due(epoch);
            }
        });
    }

    fn on_keepalive_due(&self, epoch: u64) {
        let mut state = self.locked();
        if state.epoch != epoch {
            return;
        }
        // Sending re-arms the keepalive timer.
        if self.send_message_locked(&mut state, build_keepalive()).is_err() {
            debug!("keepalive skipped; no transport");
        }
    }

    // ── Timeouts ─────────────────────────────────────────────

    fn arm_action_timeout(&self, epoch: u64, key: TimerKey) {
        let weak = self.weak.clone();
        let delay = Duration::from_secs(self.config.action_timeout);
        self.timers.schedule(key, delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_action_timeout(epoch, key);
            }
        });
    }

    fn on_action_timeout(&self, epoch: u64, key: TimerKey) {
        let (timeout_error, auth_waiters) = {
            let mut state = self.locked();
            if state.epoch != epoch {
                return;
            }
            let timeout_error = match key {
                TimerKey::SetupTimeout => ClientError::SetupTimeout(self.config.action_timeout),
                _ => ClientError::AuthTimeout(self.config.action_timeout),
            };
            warn!(error = %timeout_error, "handshake timeout");
            let _ = self.send_message_locked(
                &mut state,
                build_error(CONNECTION_CHANNEL, TIMEOUT_ERROR, &timeout_error.to_string()),
            );
            let auth_waiters = if matches!(key, TimerKey::AuthStateTimeout) {
                std::mem::take(&mut state.auth_waiters)
            } else {
                Vec::new()
            };
            (timeout_error, auth_waiters)
        };

        self.publish_error(&timeout_error);
        for waiter in auth_waiters {
            let _ = waiter.send(Err(ClientError::AuthTimeout(self.config.action_timeout)));
        }
        self.disconnect();
    }

    fn liveness_budget(&self, state: &EngineState) -> Duration {
        let secs = state
            .details
            .server_keepalive_timeout
            .unwrap_or(self.config.keepalive_timeout);
        Duration::from_secs(secs)
    }

    fn arm_liveness(&self, epoch: u64, delay: Duration) {
        let weak = self.weak.clone();
        let delay = delay.max(LIVENESS_FLOOR);
        self.timers.schedule(TimerKey::Timeout, delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_liveness_timeout(epoch);
            }
        });
    }

    fn on_liveness_timeout(&self, epoch: u64) {
        let timed_out = {
            let mut state = self.locked();
            if state.epoch != epoch {
                return;
            }
            let budget = self.liveness_budget(&state);
            let idle = state.last_received.map_or(budget, |at| at.elapsed());
            if idle >= budget {
                let elapsed_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
                let timeout_error = ClientError::KeepaliveTimeout { elapsed_ms };
                warn!(elapsed_ms, "peer liveness timeout");
                let _ = self.send_message_locked(
                    &mut state,
                    build_error(CONNECTION_CHANNEL, TIMEOUT_ERROR, &timeout_error.to_string()),
                );
                true
            } else {
                self.arm_liveness(epoch, budget.saturating_sub(idle));
                false
            }
        };
        if timed_out {
            self.reconnect();
        }
    }

    // ── State transitions & publication ──────────────────────

    fn set_connection_state_locked(
        &self,
        state: &mut EngineState,
        next: ConnectionState,
    ) -> ConnectionTransition {
        if state.connection_state == next {
            return ConnectionTransition::none();
        }
        let previous = std::mem::replace(&mut state.connection_state, next);
        let (waiters, ok) = match next {
            ConnectionState::Connected => (std::mem::take(&mut state.connect_waiters), true),
            ConnectionState::NotConnected => (std::mem::take(&mut state.connect_waiters), false),
            ConnectionState::Connecting => (Vec::new(), true),
        };
        ConnectionTransition {
            change: Some((next, previous)),
            waiters,
            ok,
        }
    }

    fn finish_connection_transition(&self, transition: ConnectionTransition) {
        if let Some((next, previous)) = transition.change {
            debug!(?previous, ?next, "connection state changed");
            self.connection_listeners.notify(|l| l(next, previous));
        }
        for waiter in transition.waiters {
            let result = if transition.ok {
                Ok(())
            } else {
                Err(ClientError::Disconnected)
            };
            let _ = waiter.send(result);
        }
    }

    fn set_auth_state_locked(
        &self,
        state: &mut EngineState,
        next: AuthState,
    ) -> Option<(AuthState, AuthState)> {
        if state.auth_state == next {
            return None;
        }
        let previous = std::mem::replace(&mut state.auth_state, next);
        Some((next, previous))
    }

    fn dispatch_auth_change(&self, change: Option<(AuthState, AuthState)>) {
        if let Some((next, previous)) = change {
            debug!(%previous, %next, "auth state changed");
            self.auth_listeners.notify(|l| l(next, previous));
        }
    }

    pub(crate) fn publish_error(&self, client_error: &ClientError) {
        if self.error_listeners.is_empty() {
            error!(error = %client_error, "unhandled client error");
        } else {
            self.error_listeners.notify(|l| l(client_error));
        }
    }
}
