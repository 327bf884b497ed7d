//! In-memory collector used by the transport tests

use crate::config::{Config, TransportOptions};
use crate::error::ConnectionError;
use crate::host::HostFacts;
use crate::registry::ActionRegistry;
use crate::resolver::Resolve;
use crate::transport::{Dial, Frame, FrameSink, FrameStream, Handshake, Transporter};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{future, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

pub const ENDPOINT_A: &str = "ws://collector-a.test";
pub const ENDPOINT_B: &str = "ws://collector-b.test";

pub fn test_config() -> Config {
    Config::new("public", "secret", "test-app", "root.collector.test").with_server_name("web-01")
}

pub fn test_host() -> HostFacts {
    HostFacts {
        machine_name: "web-01".to_string(),
        hostname: "web-01.local".to_string(),
        cpus: 2,
        memory: 1 << 30,
        version: "0.1.0".to_string(),
    }
}

/// Poll `condition` until it holds, panicking after a generous bound
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Discovery that returns whatever endpoint is currently scripted
pub struct ScriptedResolver {
    endpoint: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(endpoint: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: Mutex::new(endpoint.map(str::to_string)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, endpoint: Option<&str>) {
        *self.endpoint.lock() = endpoint.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for ScriptedResolver {
    async fn resolve(&self) -> Result<String, ConnectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.endpoint
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::DiscoveryFailed {
                server: "root.collector.test".to_string(),
                reason: "no endpoint scripted".to_string(),
            })
    }
}

/// Collector end of one accepted connection
pub struct CollectorSide {
    pub endpoint: String,
    pub handshake: Handshake,
    /// Frames written by the agent
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    /// Frames delivered to the agent
    pub inbound: mpsc::UnboundedSender<Result<Frame, ConnectionError>>,
}

impl CollectorSide {
    pub fn push(&self, message: Value) {
        self.push_raw(&message.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(Frame::Text(text.to_string())))
            .expect("agent side of the stream is gone");
    }

    /// Next text frame written by the agent, skipping control frames
    pub async fn next_text(&mut self) -> String {
        loop {
            let frame = timeout(Duration::from_secs(30), self.outbound.next())
                .await
                .expect("no frame from the agent in time")
                .expect("agent closed the stream");

            if let Frame::Text(text) = frame {
                return text;
            }
        }
    }

    pub async fn next_envelope(&mut self) -> Value {
        serde_json::from_str(&self.next_text().await).expect("agent sent invalid JSON")
    }

    /// Text frames already queued, without waiting
    pub fn queued_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(Some(frame)) = self.outbound.try_next() {
            if let Frame::Text(text) = frame {
                texts.push(text);
            }
        }
        texts
    }

    /// Number of pings already queued, consuming every queued frame
    pub fn drain_pings(&mut self) -> usize {
        let mut pings = 0;
        while let Ok(Some(frame)) = self.outbound.try_next() {
            if matches!(frame, Frame::Ping(_)) {
                pings += 1;
            }
        }
        pings
    }
}

/// Counts write handles that have not been dropped yet
struct HandleGuard {
    live: Arc<AtomicUsize>,
}

impl HandleGuard {
    fn new(live: Arc<AtomicUsize>, max_live: &AtomicUsize) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        max_live.fetch_max(now, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dialer that connects to an in-memory collector
pub struct MemoryDialer {
    accepted: mpsc::UnboundedSender<CollectorSide>,
    refuse: AtomicBool,
    delay: Mutex<Duration>,
    dials: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    endpoints: Mutex<Vec<String>>,
}

impl MemoryDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CollectorSide>) {
        let (accepted, connections) = mpsc::unbounded();
        let dialer = Arc::new(Self {
            accepted,
            refuse: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            dials: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
        });
        (dialer, connections)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl Dial for MemoryDialer {
    async fn dial(
        &self,
        endpoint: &str,
        handshake: &Handshake,
    ) -> Result<(FrameSink, FrameStream), ConnectionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().push(endpoint.to_string());

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::HandshakeFailed {
                endpoint: endpoint.to_string(),
                reason: "401 Unauthorized".to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Frame, ConnectionError>>();

        let handle = HandleGuard::new(self.live.clone(), &self.max_live);
        let sink = out_tx
            .sink_map_err(|e| ConnectionError::WriteFailed {
                reason: e.to_string(),
            })
            .with(move |frame: Frame| {
                let _handle = &handle;
                future::ready(Ok::<Frame, ConnectionError>(frame))
            });

        let _ = self.accepted.unbounded_send(CollectorSide {
            endpoint: endpoint.to_string(),
            handshake: handshake.clone(),
            outbound: out_rx,
            inbound: in_tx,
        });

        Ok((Box::pin(sink), Box::pin(in_rx)))
    }
}

/// A transporter wired to the in-memory collector
pub struct Fixture {
    pub transporter: Transporter,
    pub resolver: Arc<ScriptedResolver>,
    pub dialer: Arc<MemoryDialer>,
    pub actions: Arc<ActionRegistry>,
    connections: mpsc::UnboundedReceiver<CollectorSide>,
}

impl Fixture {
    pub fn new(endpoint: Option<&str>) -> Self {
        Self::with_options(endpoint, TransportOptions::default())
    }

    pub fn with_options(endpoint: Option<&str>, options: TransportOptions) -> Self {
        let resolver = ScriptedResolver::new(endpoint);
        let (dialer, connections) = MemoryDialer::new();
        let actions = Arc::new(ActionRegistry::new());

        let transporter = Transporter::new(
            test_config(),
            options,
            &test_host(),
            resolver.clone(),
            dialer.clone(),
            actions.clone(),
        );

        Self {
            transporter,
            resolver,
            dialer,
            actions,
            connections,
        }
    }

    /// Wait for the next connection the transporter opens
    pub async fn accept(&mut self) -> CollectorSide {
        timeout(Duration::from_secs(120), self.connections.next())
            .await
            .expect("transporter did not connect in time")
            .expect("dialer dropped")
    }

    /// Connect and wait until the transporter reports the connection usable
    pub async fn connected(&mut self) -> CollectorSide {
        self.transporter.connect();
        let collector = self.accept().await;
        self.wait_connected().await;
        collector
    }

    pub async fn wait_connected(&self) {
        timeout(Duration::from_secs(120), self.transporter.wait_connected())
            .await
            .expect("transporter did not report a connection");
    }
}
