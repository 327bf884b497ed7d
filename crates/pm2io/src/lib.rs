//! Agent side of the PM2.io collector protocol
//!
//! A process embeds [`Pm2Io`] to keep one authenticated WebSocket stream to
//! the collector. Over it the agent pushes logs, exceptions and periodic
//! status, and answers remote action triggers from its [`ActionRegistry`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), pm2io::Pm2IoError> {
//! use pm2io::{Config, Pm2Io};
//!
//! let agent = Pm2Io::new(Config::new("public", "secret", "my-app", "root.keymetrics.io"))?;
//! agent.actions().register_fn("ping", || "pong".to_string());
//! let requests = agent.metrics().create("requests", "req");
//! agent.start()?;
//!
//! requests.inc();
//! agent.notifier().log("ready").await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod metrics;
pub mod notifier;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod resolver;
pub mod status;
pub mod transport;

pub use config::{Config, TransportOptions};
pub use error::{ActionError, ConfigurationError, ConnectionError, Pm2IoError, ProtocolError};
pub use host::HostFacts;
pub use notifier::Notifier;
pub use reconnect::RetryPolicy;
pub use registry::{Action, ActionRegistry, Metric, MetricRegistry};
pub use resolver::{HttpResolver, Resolve};
pub use transport::{Dial, Transporter, WsDialer};

use status::StatusSampler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::*;

/// Entry point for the host process
pub struct Pm2Io {
    host: HostFacts,
    actions: Arc<ActionRegistry>,
    metrics: Arc<MetricRegistry>,
    transporter: Transporter,
    notifier: Notifier,
    started: AtomicBool,
}

impl Pm2Io {
    pub fn new(config: Config) -> Result<Self, Pm2IoError> {
        Self::with_options(config, TransportOptions::default())
    }

    pub fn with_options(config: Config, options: TransportOptions) -> Result<Self, Pm2IoError> {
        let host = HostFacts::detect(config.server_name.as_deref(), &config.version);
        let resolver = HttpResolver::new(&config, &host, options.discovery_timeout)?;

        Ok(Self::with_transport(
            config,
            options,
            host,
            Arc::new(resolver),
            Arc::new(WsDialer),
        ))
    }

    /// Wire the agent to a custom discovery and dialer
    pub fn with_transport(
        config: Config,
        options: TransportOptions,
        host: HostFacts,
        resolver: Arc<dyn Resolve>,
        dialer: Arc<dyn Dial>,
    ) -> Self {
        let actions = Arc::new(ActionRegistry::new());
        let metrics = Arc::new(MetricRegistry::new());
        let transporter =
            Transporter::new(config, options, &host, resolver, dialer, actions.clone());

        Self {
            host,
            actions,
            metrics,
            notifier: Notifier::new(transporter.clone()),
            transporter,
            started: AtomicBool::new(false),
        }
    }

    /// Validate the configuration, connect in the background and start the
    /// status sampler. Must be called from within a tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) -> Result<(), Pm2IoError> {
        self.transporter.config().validate()?;

        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Agent already started");
            return Ok(());
        }

        info!(
            "Starting agent for {} on {}",
            self.transporter.config().name,
            self.transporter.server_name()
        );
        self.transporter.connect();

        let sampler = StatusSampler::new(
            self.transporter.clone(),
            self.actions.clone(),
            self.metrics.clone(),
            self.host.clone(),
        );
        tokio::spawn(sampler.run());

        Ok(())
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn transporter(&self) -> &Transporter {
        &self.transporter
    }

    pub fn host(&self) -> &HostFacts {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.transporter.is_connected()
    }

    pub fn current_endpoint(&self) -> Option<String> {
        self.transporter.current_endpoint()
    }

    pub async fn shutdown(&self) {
        self.transporter.shutdown().await;
    }
}
