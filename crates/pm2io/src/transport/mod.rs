//! Connection manager for the collector stream
//!
//! The [`Transporter`] owns the single stream to the collector and keeps it
//! usable for the whole process lifetime: it resolves the endpoint, performs
//! the handshake, runs the heartbeat and inbound dispatcher for each
//! connection, re-verifies the endpoint periodically, and reconnects on any
//! failure.
//!
//! # Concurrency
//!
//! - `state` (a short-lived sync mutex) is the single source of truth for
//!   "may I write right now". The `connecting` flag is claimed and released
//!   under it, so at most one connect loop exists at any time.
//! - `writer` (an async mutex) serializes every write. It is held for one
//!   write (bounded by the write timeout) and never across a read.
//! - Every established connection gets a new epoch. Retiring a connection
//!   advances the epoch, which ends the heartbeat and dispatcher bound to
//!   it; a failure reported with a stale epoch is ignored.

mod dispatch;
mod heartbeat;
mod refresh;
mod stream;

#[cfg(test)]
pub(crate) mod tests;

pub use stream::{
    Dial, Frame, FrameSink, FrameStream, Handshake, WsDialer, HEADER_AGENT_VERSION,
    HEADER_PROTOCOL_VERSION, HEADER_PUBLIC_KEY, HEADER_SECRET_KEY, HEADER_SERVER,
};

use crate::config::{Config, TransportOptions};
use crate::error::ConnectionError;
use crate::host::{local_ip, HostFacts};
use crate::metrics::*;
use crate::protocol::{Envelope, Payload, ProcessIdentity};
use crate::reconnect::Attempts;
use crate::registry::ActionRegistry;
use crate::resolver::Resolve;
use futures::SinkExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::*;

/// Handle to the connection manager; cheap to clone
#[derive(Clone)]
pub struct Transporter {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    server_name: String,
    internal_ip: Option<IpAddr>,
    options: TransportOptions,
    resolver: Arc<dyn Resolve>,
    dialer: Arc<dyn Dial>,
    actions: Arc<ActionRegistry>,
    state: Mutex<ConnectionState>,
    writer: AsyncMutex<Option<FrameSink>>,
    link: watch::Sender<Link>,
    shutdown: watch::Sender<bool>,
    loops: LoopCounters,
    stats: Counters,
}

#[derive(Debug, Default)]
struct ConnectionState {
    /// Cached stream endpoint
    endpoint: Option<String>,
    connected: bool,
    /// Reentrancy guard: a connect loop is running
    connecting: bool,
    closed_by_peer: bool,
    /// The dispatcher of the current connection is running
    handling: bool,
    refresh_started: bool,
    shutdown: bool,
    epoch: u64,
}

/// Published view of the connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    epoch: u64,
    connected: bool,
}

#[derive(Debug, Default)]
struct LoopCounters {
    heartbeat: AtomicUsize,
    dispatcher: AtomicUsize,
    refresh: AtomicUsize,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    reconnects: AtomicU64,
    discovery_failures: AtomicU64,
    handshake_failures: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Number of background loops currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveLoops {
    pub heartbeat: usize,
    pub dispatcher: usize,
    pub refresh: usize,
}

/// Lifetime counters of one transporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    pub connections: u64,
    pub reconnects: u64,
    pub discovery_failures: u64,
    pub handshake_failures: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// Outcome of a write attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Written {
    Sent,
    /// No usable connection, the frame was discarded
    Dropped,
}

/// What became of a successfully dialed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Installed {
    Live,
    /// The cached endpoint changed during the dial
    EndpointMoved,
    ShutDown,
}

/// Keeps a loop counter incremented while a loop runs
struct LoopGuard<'a>(&'a AtomicUsize);

impl<'a> LoopGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transporter {
    pub fn new(
        config: Config,
        options: TransportOptions,
        host: &HostFacts,
        resolver: Arc<dyn Resolve>,
        dialer: Arc<dyn Dial>,
        actions: Arc<ActionRegistry>,
    ) -> Self {
        let (link, _) = watch::channel(Link {
            epoch: 0,
            connected: false,
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                server_name: host.machine_name.clone(),
                internal_ip: local_ip(),
                options,
                resolver,
                dialer,
                actions,
                state: Mutex::new(ConnectionState::default()),
                writer: AsyncMutex::new(None),
                link,
                shutdown,
                loops: LoopCounters::default(),
                stats: Counters::default(),
            }),
        }
    }

    /// Start connecting in the background
    ///
    /// Returns immediately. Does nothing if a connect loop is already
    /// running, the stream is connected, or the transporter was shut down.
    pub fn connect(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.connecting || state.connected || state.shutdown {
                debug!("Connect ignored, connection already active or in progress");
                return;
            }
            state.connecting = true;
        }

        self.spawn_connect_loop();
    }

    /// Drop the current stream and start a new connect loop
    ///
    /// Safe to call concurrently from any task: only the first caller while
    /// no connect loop runs proceeds, every other call returns immediately.
    pub async fn close_and_reconnect(&self, reason: &str) {
        self.reconnect(None, reason).await;
    }

    /// Send `data` on `channel`, wrapped with timestamp and process identity
    ///
    /// Best-effort: returns `false` when the frame was dropped because no
    /// connection is usable or the write failed.
    pub async fn send<T: Serialize>(&self, channel: &str, data: T) -> bool {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize data for channel {}: {}", channel, e);
                return false;
            }
        };

        let envelope = Envelope::new(channel, self.payload(data));
        match envelope.to_json() {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Send an already shaped message as is
    pub async fn send_json<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                false
            }
        }
    }

    async fn send_text(&self, text: String) -> bool {
        matches!(
            self.write_frame(Frame::Text(text), None).await,
            Ok(Written::Sent)
        )
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Whether the inbound dispatcher of the current connection is running
    pub fn is_handling(&self) -> bool {
        self.shared.state.lock().handling
    }

    pub fn current_endpoint(&self) -> Option<String> {
        self.shared.state.lock().endpoint.clone()
    }

    /// Resolves once a connection is established
    pub async fn wait_connected(&self) {
        let mut link = self.shared.link.subscribe();
        let _ = link.wait_for(|link| link.connected).await;
    }

    pub fn active_loops(&self) -> ActiveLoops {
        let loops = &self.shared.loops;
        ActiveLoops {
            heartbeat: loops.heartbeat.load(Ordering::SeqCst),
            dispatcher: loops.dispatcher.load(Ordering::SeqCst),
            refresh: loops.refresh.load(Ordering::SeqCst),
        }
    }

    pub fn stats(&self) -> TransportStats {
        let stats = &self.shared.stats;
        TransportStats {
            connections: stats.connections.load(Ordering::Relaxed),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            discovery_failures: stats.discovery_failures.load(Ordering::Relaxed),
            handshake_failures: stats.handshake_failures.load(Ordering::Relaxed),
            frames_sent: stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    pub fn options(&self) -> &TransportOptions {
        &self.shared.options
    }

    pub(crate) fn actions(&self) -> &ActionRegistry {
        &self.shared.actions
    }

    /// Stop every loop and close the stream; no reconnect happens afterwards
    pub async fn shutdown(&self) {
        let closed_by_peer = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.connected = false;
            state.epoch += 1;
            self.publish(&state);
            state.closed_by_peer
        };

        self.shared.shutdown.send_replace(true);
        self.close_stream(closed_by_peer).await;
        info!("Collector transport shut down");
    }

    /// Resolves once `shutdown` has been called
    pub(crate) async fn shutdown_signal(&self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the connection of `epoch` is no longer current
    async fn retired(&self, epoch: u64) {
        let mut link = self.shared.link.subscribe();
        loop {
            if link.borrow_and_update().epoch != epoch {
                return;
            }
            if link.changed().await.is_err() {
                return;
            }
        }
    }

    fn payload(&self, data: Value) -> Payload {
        let at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or_default();

        Payload {
            at,
            process: ProcessIdentity {
                pm_id: 0,
                name: self.shared.config.name.clone(),
                server: self.shared.server_name.clone(),
            },
            data,
            active: true,
            server_name: self.shared.server_name.clone(),
            protected: false,
            rev_con: true,
            internal_ip: self.shared.internal_ip,
        }
    }

    /// Write one frame under the write lock
    ///
    /// With `epoch` set, the frame is only written if that connection is
    /// still current. A failed write starts a reconnect before returning.
    pub(crate) async fn write_frame(
        &self,
        frame: Frame,
        epoch: Option<u64>,
    ) -> Result<Written, ConnectionError> {
        if !self.is_connected() {
            return Ok(self.dropped());
        }

        let (written_epoch, result) = {
            let mut writer = self.shared.writer.lock().await;

            let current = {
                let state = self.shared.state.lock();
                (state.connected && epoch.map_or(true, |epoch| epoch == state.epoch))
                    .then_some(state.epoch)
            };

            let (Some(current), Some(sink)) = (current, writer.as_mut()) else {
                return Ok(self.dropped());
            };

            let write_timeout = self.shared.options.write_timeout;
            let result = match timeout(write_timeout, sink.send(frame)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout {
                    operation: "write".to_string(),
                    timeout: write_timeout,
                }),
            };
            (current, result)
        };

        match result {
            Ok(()) => {
                self.shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                TRANSPORT_FRAMES_SENT.inc();
                Ok(Written::Sent)
            }
            Err(e) => {
                TRANSPORT_WRITE_FAILURES.inc();
                warn!("Write to collector failed: {}", e);
                self.reconnect(Some(written_epoch), e.kind()).await;
                Err(e)
            }
        }
    }

    fn dropped(&self) -> Written {
        self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        TRANSPORT_FRAMES_DROPPED.inc();
        trace!("No usable connection, frame dropped");
        Written::Dropped
    }

    /// Reconnect, unless a connect loop already runs or `epoch` is stale
    pub(crate) async fn reconnect(&self, epoch: Option<u64>, reason: &str) {
        let closed_by_peer = {
            let mut state = self.shared.state.lock();
            if state.connecting || state.shutdown {
                trace!("Reconnect ({}) ignored, already reconnecting", reason);
                return;
            }
            if epoch.is_some_and(|epoch| epoch != state.epoch) {
                trace!("Reconnect ({}) ignored, connection already replaced", reason);
                return;
            }

            state.connecting = true;
            state.connected = false;
            state.handling = false;
            state.epoch += 1;
            self.publish(&state);
            std::mem::take(&mut state.closed_by_peer)
        };

        info!("Reconnecting to collector ({})", reason);
        self.shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        TRANSPORT_RECONNECTS.with_label_values(&[reason]).inc();

        self.close_stream(closed_by_peer).await;
        self.spawn_connect_loop();
    }

    /// Take the write handle out and close it unless the peer already did
    async fn close_stream(&self, closed_by_peer: bool) {
        let sink = self.shared.writer.lock().await.take();

        if let Some(mut sink) = sink {
            if closed_by_peer {
                return;
            }
            match timeout(self.shared.options.write_timeout, sink.close()).await {
                Ok(Ok(())) => trace!("Previous stream closed"),
                Ok(Err(e)) => debug!("Closing previous stream failed: {}", e),
                Err(_) => debug!("Closing previous stream timed out"),
            }
        }
    }

    fn publish(&self, state: &ConnectionState) {
        self.shared.link.send_replace(Link {
            epoch: state.epoch,
            connected: state.connected,
        });
        TRANSPORT_CONNECTED.set(state.connected as i64);
    }

    fn spawn_connect_loop(&self) {
        let transporter = self.clone();
        tokio::spawn(async move { transporter.run_connect_loop().await });
    }

    /// Resolve, dial and install a connection, retrying until one succeeds
    ///
    /// Runs with `connecting` held; it is released when the new connection
    /// is installed or the transporter shuts down.
    async fn run_connect_loop(self) {
        let options = &self.shared.options;
        let mut discovery = Attempts::default();
        let mut handshake = Attempts::default();

        loop {
            if self.shared.state.lock().shutdown {
                break;
            }

            let cached = self.current_endpoint();
            let endpoint = match cached {
                Some(endpoint) => endpoint,
                None => match self.shared.resolver.resolve().await {
                    Ok(endpoint) => {
                        discovery.reset();
                        debug!("Resolved collector endpoint {}", endpoint);
                        self.shared.state.lock().endpoint = Some(endpoint.clone());
                        endpoint
                    }
                    Err(e) => {
                        let delay = discovery.fail(&options.discovery_retry);
                        self.shared
                            .stats
                            .discovery_failures
                            .fetch_add(1, Ordering::Relaxed);
                        TRANSPORT_CONNECT_FAILURES
                            .with_label_values(&["discovery"])
                            .inc();
                        warn!("{}, retrying in {:?}", e, delay);
                        if self.sleep_unless_shutdown(delay).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            match self.dial(&endpoint).await {
                Ok((sink, stream)) => match self.install(&endpoint, sink, stream).await {
                    Installed::Live | Installed::ShutDown => return,
                    Installed::EndpointMoved => {
                        handshake.reset();
                        continue;
                    }
                },
                Err(e) => {
                    let delay = handshake.fail(&options.handshake_retry);
                    self.shared
                        .stats
                        .handshake_failures
                        .fetch_add(1, Ordering::Relaxed);
                    TRANSPORT_CONNECT_FAILURES
                        .with_label_values(&["handshake"])
                        .inc();
                    warn!("{}, retrying in {:?}", e, delay);

                    if handshake.failures() >= options.rediscover_after {
                        info!(
                            "{} consecutive handshake failures, resolving the endpoint again",
                            handshake.failures()
                        );
                        self.forget_endpoint(&endpoint);
                        handshake.reset();
                    }

                    if self.sleep_unless_shutdown(delay).await {
                        break;
                    }
                }
            }
        }

        self.shared.state.lock().connecting = false;
    }

    /// Sleep for `delay`; returns `true` if shutdown happened meanwhile
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_signal() => true,
        }
    }

    fn forget_endpoint(&self, endpoint: &str) {
        let mut state = self.shared.state.lock();
        if state.endpoint.as_deref() == Some(endpoint) {
            state.endpoint = None;
        }
    }

    async fn dial(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let handshake = Handshake::new(&self.shared.config, &self.shared.server_name);
        let handshake_timeout = self.shared.options.handshake_timeout;

        match timeout(
            handshake_timeout,
            self.shared.dialer.dial(endpoint, &handshake),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                operation: format!("handshake with {endpoint}"),
                timeout: handshake_timeout,
            }),
        }
    }

    /// Make a freshly dialed stream the current connection and start its loops
    ///
    /// A stream dialed to an endpoint that was replaced in the cache while
    /// the dial was in flight is closed instead; the connect loop then dials
    /// the cached endpoint.
    async fn install(&self, endpoint: &str, sink: FrameSink, stream: FrameStream) -> Installed {
        let mut writer = self.shared.writer.lock().await;

        let outcome = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                state.connecting = false;
                Err(Installed::ShutDown)
            } else if state.endpoint.as_deref() != Some(endpoint) {
                Err(Installed::EndpointMoved)
            } else {
                state.connecting = false;
                state.epoch += 1;
                state.connected = true;
                state.closed_by_peer = false;
                state.handling = true;
                let start_refresh = !std::mem::replace(&mut state.refresh_started, true);
                self.publish(&state);
                Ok((state.epoch, start_refresh))
            }
        };

        let (epoch, start_refresh) = match outcome {
            Ok(started) => started,
            Err(installed) => {
                drop(writer);
                if installed == Installed::EndpointMoved {
                    info!("Endpoint moved while dialing {}, dialing again", endpoint);
                }
                let mut sink = sink;
                let _ = sink.close().await;
                return installed;
            }
        };

        *writer = Some(sink);
        drop(writer);

        self.shared.stats.connections.fetch_add(1, Ordering::Relaxed);
        TRANSPORT_CONNECTIONS_ESTABLISHED.inc();
        info!("Connected to collector at {} (connection {})", endpoint, epoch);

        tokio::spawn(dispatch::run(self.clone(), stream, epoch));
        tokio::spawn(heartbeat::run(self.clone(), epoch));

        if start_refresh {
            tokio::spawn(refresh::run(self.clone()));
        }

        Installed::Live
    }

    fn mark_closed_by_peer(&self, epoch: u64) {
        let mut state = self.shared.state.lock();
        if state.epoch == epoch {
            state.closed_by_peer = true;
        }
    }

    fn mark_handling_stopped(&self, epoch: u64) {
        let mut state = self.shared.state.lock();
        if state.epoch == epoch {
            state.handling = false;
        }
    }
}
