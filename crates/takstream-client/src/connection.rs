//! The streaming connection engine.
//!
//! A [`Connection`] owns one transport at a time, the inbound frame buffer,
//! the outbound [`WriteQueue`] and the heartbeat. Transport events arrive on a
//! channel and are handled by one dispatch task per transport, in order.
//! Liveness replies and the server version announcement are consumed here;
//! every other CoT message is emitted on [`Signal::Cot`].
//!
//! Mutable state sits behind one `parking_lot::Mutex` that is never held
//! across an await. Background tasks hold a `Weak` reference, so dropping the
//! last `Connection` handle tears everything down.

use crate::events::{EventBus, ListenerId, Signal, StreamEvent};
use crate::frame::drain_messages;
use crate::queue::WriteQueue;
use crate::state::{ConnectionState, ConnectionStatus, MetricsSnapshot};
use crate::transport::{
    default_transport_factory, Transport, TransportEvent, TransportFactory, TransportHandlers,
    TransportOptions, TransportParams,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use takstream_core::{
    ConfigError, ConnectionError, ConnectionId, IdGenerator, RandomIdGenerator, Result, ServerEntry,
    ServerUrl, TakAuth, TakStreamError, TimeoutError,
};
use takstream_cot::{classify, parse_cot, ping, serialize_event, ControlKind, Event};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Default period between heartbeat pings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default limit on the TLS handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Type tag used when none is given
pub const DEFAULT_CONNECTION_TYPE: &str = "unknown";

/// Options for [`Connection::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
    /// Connection id; drawn from `id_generator` when absent
    pub id: Option<ConnectionId>,
    /// Free-form type tag
    pub connection_type: String,
    /// Period between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Limit on the TLS handshake. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Builds the transport for each connect; the platform default when absent
    pub transport_factory: Option<TransportFactory>,
    /// Source of connection ids
    pub id_generator: Option<Arc<dyn IdGenerator>>,
    /// Pins and idle timeout handed to the transport
    pub transport: TransportOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            id: None,
            connection_type: DEFAULT_CONNECTION_TYPE.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            transport_factory: None,
            id_generator: None,
            transport: TransportOptions::default(),
        }
    }
}

impl ConnectOptions {
    /// Options for one configured server: its name becomes the id.
    pub fn from_server_entry(entry: &ServerEntry) -> Self {
        let mut options = Self::default()
            .with_id(entry.name.as_str())
            .with_heartbeat_interval(entry.heartbeat_interval())
            .with_connect_timeout(Some(entry.connect_timeout()))
            .with_pins(entry.pins.clone());
        if let Some(connection_type) = &entry.connection_type {
            options = options.with_type(connection_type.clone());
        }
        options
    }

    pub fn with_id(mut self, id: impl Into<ConnectionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = connection_type.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    pub fn with_pins(mut self, pins: Vec<String>) -> Self {
        self.transport.pins = pins;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.transport.idle_timeout = Some(idle);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("id", &self.id)
            .field("connection_type", &self.connection_type)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("custom_transport_factory", &self.transport_factory.is_some())
            .field("transport", &self.transport)
            .finish()
    }
}

/// Mutable engine state.
#[derive(Default)]
struct Inner {
    /// A liveness reply arrived on the current transport
    open: bool,
    destroyed: bool,
    version: Option<String>,
    /// Text received but not yet framed
    buffer: String,
    transport: Option<Arc<dyn Transport>>,
    /// `connect` resolved on the current transport
    ready: bool,
    /// Bumped whenever a transport is replaced or torn down
    generation: u64,
    heartbeat: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    /// Latest drain task and the generation it writes to
    drain: Option<(u64, JoinHandle<()>)>,
}

struct Shared {
    id: ConnectionId,
    connection_type: String,
    url: ServerUrl,
    auth: TakAuth,
    heartbeat_interval: Duration,
    connect_timeout: Option<Duration>,
    transport_options: TransportOptions,
    factory: TransportFactory,
    bus: EventBus,
    queue: WriteQueue,
    status: ConnectionStatus,
    inner: Mutex<Inner>,
}

/// A streaming connection to a TAK server.
///
/// Cloning is cheap; all clones drive the same connection. Every method that
/// touches the network or schedules work must be called inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a connection and completes the TLS handshake.
    ///
    /// Only `ssl://` URLs are accepted, and the credential bundle must carry
    /// a certificate and a key. Listeners registered on the returned handle
    /// miss `secureConnect`; use [`Connection::new`] and
    /// [`Connection::start`] to subscribe first.
    pub async fn connect(url: &str, auth: TakAuth, options: ConnectOptions) -> Result<Self> {
        let connection = Self::new(url, auth, options)?;
        connection.start().await?;
        Ok(connection)
    }

    /// Creates a connection without opening it.
    pub fn new(url: &str, auth: TakAuth, options: ConnectOptions) -> Result<Self> {
        let url = ServerUrl::parse(url)?;
        if !url.is_ssl() {
            return Err(ConfigError::UnsupportedProtocol {
                scheme: url.scheme().to_string(),
            }
            .into());
        }
        auth.validate()?;

        let id = match options.id {
            Some(id) => id,
            None => {
                let generator = options
                    .id_generator
                    .unwrap_or_else(|| Arc::new(RandomIdGenerator));
                ConnectionId::generate(generator.as_ref())
            }
        };

        debug!(connection_id = %id, url = %url, "Created connection");

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                connection_type: options.connection_type,
                url,
                auth,
                heartbeat_interval: options.heartbeat_interval,
                connect_timeout: options.connect_timeout,
                transport_options: options.transport,
                factory: options
                    .transport_factory
                    .unwrap_or_else(default_transport_factory),
                bus: EventBus::new(),
                queue: WriteQueue::new(),
                status: ConnectionStatus::new(),
                inner: Mutex::new(Inner::default()),
            }),
        })
    }

    /// Builds a fresh transport and waits for its handshake.
    ///
    /// Any previous transport is torn down first. The heartbeat starts once
    /// the handshake is done, and queued messages start draining.
    pub async fn start(&self) -> Result<()> {
        Shared::start(&self.shared).await
    }

    /// Tears the current session down and starts a new one.
    ///
    /// The inbound buffer is discarded; the outbound queue is kept and drains
    /// on the new transport.
    #[instrument(skip(self), fields(connection_id = %self.shared.id))]
    pub async fn reconnect(&self) -> Result<()> {
        info!("Reconnecting");
        self.shared.status.set_state(ConnectionState::Reconnecting);
        self.shared.status.metrics().record_reconnect();
        self.shared.teardown();
        Shared::start(&self.shared).await
    }

    /// Closes the transport and stops the heartbeat. Queued messages stay
    /// queued.
    pub fn destroy(&self) {
        self.shared.teardown();
        self.shared.status.set_state(ConnectionState::Disconnected);
        self.shared.status.metrics().mark_disconnected();
        info!(connection_id = %self.shared.id, "Connection destroyed");
    }

    /// Encodes and queues `events`.
    ///
    /// Fails with `NotConnected`, queueing nothing, when no transport is
    /// active.
    pub fn write(&self, events: &[Event]) -> Result<()> {
        self.shared
            .enqueue(events.iter().map(serialize_event).collect())
    }

    /// Queues an already serialized message.
    pub fn write_raw(&self, xml: impl Into<String>) -> Result<()> {
        self.shared.enqueue(vec![xml.into()])
    }

    /// Queues one keep-alive ping.
    pub fn ping(&self) -> Result<()> {
        self.write(&[ping()])
    }

    /// Registers a listener. See [`EventBus::on`].
    pub fn on<F>(&self, signal: Signal, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.shared.bus.on(signal, listener)
    }

    /// Removes a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.bus.off(id)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    pub fn connection_type(&self) -> &str {
        &self.shared.connection_type
    }

    pub fn url(&self) -> &ServerUrl {
        &self.shared.url
    }

    /// Server version from the version announcement, once received.
    pub fn version(&self) -> Option<String> {
        self.shared.inner.lock().version.clone()
    }

    /// True once the server answered a ping on the current transport.
    pub fn is_open(&self) -> bool {
        self.shared.inner.lock().open
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.inner.lock().destroyed
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.state()
    }

    /// Message of the last failed connect attempt.
    pub fn last_error(&self) -> Option<String> {
        self.shared.status.error_message()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.status.metrics().snapshot()
    }

    /// Number of messages waiting to be written.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("url", &self.shared.url.to_string())
            .field("state", &self.shared.status.state())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl Shared {
    #[instrument(skip(shared), fields(connection_id = %shared.id, server = %shared.url.authority()))]
    async fn start(shared: &Arc<Shared>) -> Result<()> {
        shared.status.set_state(ConnectionState::Connecting);
        shared.status.clear_error();

        let transport = match (shared.factory)(TransportParams {
            id: shared.id.clone(),
            url: shared.url.clone(),
            auth: shared.auth.clone(),
            options: shared.transport_options.clone(),
        }) {
            Ok(transport) => transport,
            Err(e) => {
                shared.status.set_error(e.to_string());
                return Err(e);
            }
        };

        let (handlers, events) = TransportHandlers::channel();
        let generation = {
            let mut inner = shared.inner.lock();
            inner.generation += 1;
            inner.destroyed = false;
            inner.open = false;
            inner.ready = false;
            inner.buffer.clear();

            if let Some(previous) = inner.transport.replace(Arc::clone(&transport)) {
                previous.destroy();
            }
            if let Some(previous) = inner.heartbeat.take() {
                previous.abort();
            }
            if let Some((_, previous)) = &inner.drain {
                previous.abort();
            }

            let dispatcher = tokio::spawn(dispatch(Arc::downgrade(shared), inner.generation, events));
            if let Some(previous) = inner.dispatcher.replace(dispatcher) {
                previous.abort();
            }
            inner.generation
        };
        transport.set_handlers(handlers);

        let outcome = match shared.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, transport.connect()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "TLS handshake timed out");
                    shared.bus.emit(&StreamEvent::Timeout);
                    shared.teardown();
                    let error: TakStreamError = TimeoutError::Handshake {
                        host: shared.url.host().to_string(),
                        timeout_secs: limit.as_secs(),
                    }
                    .into();
                    shared.status.set_error(error.to_string());
                    return Err(error);
                }
            },
            None => transport.connect().await,
        };

        if let Err(e) = outcome {
            warn!(error = %e, permanent = e.is_permanent(), "Connect failed");
            // The dispatcher stays up to deliver the error the transport
            // already reported
            let current = {
                let mut inner = shared.inner.lock();
                if inner.generation == generation {
                    inner.transport.take()
                } else {
                    None
                }
            };
            if let Some(current) = current {
                current.destroy();
            }
            shared.status.set_error(e.to_string());
            return Err(e);
        }

        {
            let mut inner = shared.inner.lock();
            if inner.generation != generation || inner.destroyed {
                debug!("Connection torn down during handshake");
                return Err(ConnectionError::Destroyed.into());
            }
            inner.ready = true;

            let heartbeat = tokio::spawn(heartbeat(Arc::downgrade(shared), shared.heartbeat_interval));
            if let Some(previous) = inner.heartbeat.replace(heartbeat) {
                previous.abort();
            }
        }

        shared.status.set_state(ConnectionState::Connected);
        shared.status.metrics().mark_connected();
        info!("Connected");

        shared.schedule_drain();
        Ok(())
    }

    /// Drops the transport, its tasks and the inbound buffer.
    fn teardown(&self) {
        let (transport, heartbeat, dispatcher) = {
            let mut inner = self.inner.lock();
            inner.destroyed = true;
            inner.open = false;
            inner.ready = false;
            inner.buffer.clear();
            inner.generation += 1;
            (
                inner.transport.take(),
                inner.heartbeat.take(),
                inner.dispatcher.take(),
            )
        };

        for task in [heartbeat, dispatcher].into_iter().flatten() {
            task.abort();
        }
        self.abort_drain();
        if let Some(transport) = transport {
            transport.destroy();
        }
    }

    /// Cancels a drain stuck on a transport that is going away. The handle
    /// stays so the next drain can wait for the `writing` flag to be released.
    fn abort_drain(&self) {
        if let Some((_, task)) = &self.inner.lock().drain {
            task.abort();
        }
    }

    fn enqueue(self: &Arc<Self>, messages: Vec<String>) -> Result<()> {
        let ready = {
            let inner = self.inner.lock();
            if inner.transport.is_none() {
                return Err(ConnectionError::NotConnected.into());
            }
            for message in messages {
                self.queue.push(message);
            }
            inner.ready
        };

        // Before the handshake finishes, `start` drains once it does
        if ready {
            self.schedule_drain();
        }
        Ok(())
    }

    /// Spawns a drain cycle on the current transport unless one is running.
    ///
    /// A drain left over from a replaced transport may still hold the
    /// `writing` flag until its abort lands, so the new cycle waits for it
    /// to finish first.
    fn schedule_drain(self: &Arc<Self>) {
        if self.queue.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        let transport = match (&inner.transport, inner.ready) {
            (Some(transport), true) => Arc::clone(transport),
            _ => return,
        };
        let generation = inner.generation;

        let previous = match inner.drain.take() {
            Some((owner, task)) if owner == generation && self.queue.is_writing() => {
                // The running cycle picks up what was just queued
                inner.drain = Some((owner, task));
                return;
            }
            other => other.map(|(_, task)| task),
        };

        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let result = shared
                .queue
                .drain(transport.as_ref(), shared.status.metrics())
                .await;

            if let Err(e) = result {
                if shared.inner.lock().generation != generation {
                    debug!(connection_id = %shared.id, error = %e, "Write to a replaced transport failed");
                    return;
                }
                warn!(connection_id = %shared.id, error = %e, "Write failed, message kept at the head of the queue");
                shared.status.metrics().record_error();
                shared.bus.emit(&StreamEvent::Error(Arc::new(e)));
            }
        });
        inner.drain = Some((generation, task));
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connect => {
                debug!(connection_id = %self.id, "TCP connected");
            }
            TransportEvent::SecureConnect => {
                debug!(connection_id = %self.id, "TLS session established");
                // No ping here: only the heartbeat and callers put payloads on the wire
                self.bus.emit(&StreamEvent::SecureConnect);
            }
            TransportEvent::Data(text) => {
                self.status.metrics().record_bytes_received(text.len() as u64);
                let messages = {
                    let mut inner = self.inner.lock();
                    inner.buffer.push_str(&text);
                    drain_messages(&mut inner.buffer)
                };
                for message in &messages {
                    self.handle_message(message);
                }
            }
            TransportEvent::Timeout => {
                debug!(connection_id = %self.id, "Transport idle");
                self.bus.emit(&StreamEvent::Timeout);
            }
            TransportEvent::Error(e) => {
                warn!(connection_id = %self.id, error = %e, "Transport error");
                self.status.metrics().record_error();
                self.bus.emit(&StreamEvent::Error(Arc::new(e)));
            }
            TransportEvent::End => {
                info!(connection_id = %self.id, "Stream ended");
                let (transport, heartbeat) = {
                    let mut inner = self.inner.lock();
                    inner.open = false;
                    inner.ready = false;
                    (inner.transport.take(), inner.heartbeat.take())
                };
                if let Some(heartbeat) = heartbeat {
                    heartbeat.abort();
                }
                self.abort_drain();
                if let Some(transport) = transport {
                    transport.destroy();
                }
                self.status.set_state(ConnectionState::Disconnected);
                self.status.metrics().mark_disconnected();
                self.bus.emit(&StreamEvent::End);
            }
        }
    }

    fn handle_message(&self, message: &str) {
        let event = match parse_cot(message) {
            Ok(event) => event,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Skipping undecodable CoT message");
                self.status.metrics().record_decode_error();
                return;
            }
        };
        self.status.metrics().record_message_received();

        match classify(&event) {
            ControlKind::Pong => {
                self.inner.lock().open = true;
                self.bus.emit(&StreamEvent::Ping);
            }
            ControlKind::Version(Some(version)) => {
                info!(connection_id = %self.id, version, "Server version");
                self.inner.lock().version = Some(version.to_string());
            }
            ControlKind::Version(None) => {
                debug!(connection_id = %self.id, "Version announcement without a server version");
            }
            ControlKind::Application => {
                self.bus.emit(&StreamEvent::Cot(Arc::new(event)));
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handles one transport's events in arrival order until its channel closes
/// or the transport is replaced.
async fn dispatch(connection: Weak<Shared>, generation: u64, mut events: UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let shared = match connection.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        if shared.inner.lock().generation != generation {
            break;
        }
        shared.handle_transport_event(event);
    }
}

/// Queues a ping every `period`, first one `period` after the handshake.
async fn heartbeat(connection: Weak<Shared>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let shared = match connection.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        if let Err(e) = shared.enqueue(vec![serialize_event(&ping())]) {
            debug!(connection_id = %shared.id, error = %e, "Heartbeat skipped");
        }
    }
}
