use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use pm2io::metrics::gather_metrics;
use pm2io::{Config, Pm2Io, TransportOptions};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

fn parse_seconds(s: &str) -> Result<Duration, eyre::Error> {
    let seconds = s
        .parse::<u64>()
        .map_err(|_err| eyre::Error::msg("Expected a number of seconds"))?;
    if seconds == 0 {
        return Err(eyre::Error::msg("Interval must be at least one second"));
    }
    Ok(Duration::from_secs(seconds))
}

#[derive(Parser, Debug)]
#[command(author, about = "PM2.io agent", long_about = None)]
pub struct App {
    #[arg(long = "public-key", env = "PM2_PUBLIC_KEY")]
    pub public_key: String,

    #[arg(long = "secret-key", env = "PM2_SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,

    /// Application name shown in the dashboard
    #[arg(long, env = "PM2_APP_NAME", default_value = "Rust App")]
    pub name: String,

    /// Collector hostname used for endpoint discovery
    #[arg(long, env = "PM2_SERVER", default_value = "root.keymetrics.io")]
    pub server: String,

    /// Machine name reported to the collector, defaults to the hostname
    #[arg(long = "server-name", env = "PM2_SERVER_NAME")]
    pub server_name: Option<String>,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    /// Seconds between demo log lines
    #[arg(long = "log-interval", default_value = "4", value_parser = parse_seconds)]
    pub log_interval: Duration,

    /// Seconds between heartbeat pings
    #[arg(long = "heartbeat-interval", default_value = "5", value_parser = parse_seconds)]
    pub heartbeat_interval: Duration,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(self.execute())
    }

    fn init_tracing(&self) {
        let rust_log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| Level::from_str(&level).ok())
            .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("app={rust_log_level},pm2io={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    fn config(&self) -> Config {
        let config = Config::new(
            self.public_key.as_str(),
            self.secret_key.as_str(),
            self.name.as_str(),
            self.server.as_str(),
        );
        match &self.server_name {
            Some(server_name) => config.with_server_name(server_name.as_str()),
            None => config,
        }
    }

    fn options(&self) -> TransportOptions {
        TransportOptions {
            heartbeat_interval: self.heartbeat_interval,
            ..Default::default()
        }
    }

    async fn execute(self) -> Result<()> {
        let agent = Pm2Io::with_options(self.config(), self.options())?;
        register_demo(&agent);
        agent.start()?;

        run_until_ctrl_c(log_forever(&agent, self.log_interval)).await?;

        agent.shutdown().await;
        debug!("Final transport metrics:\n{}", gather_metrics());
        Ok(())
    }
}

/// Metrics and actions the demo exposes to the dashboard
fn register_demo(agent: &Pm2Io) {
    agent.metrics().create("test", "unit");
    agent.metrics().create("nbreq", "req");

    agent.actions().register_fn("Test", || {
        info!("Action TEST");
        "I am the test answer".to_string()
    });
    agent.actions().register_noop("Tric");
    agent.actions().register_fn("Get env", || {
        std::env::vars()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("\n")
    });
}

async fn log_forever(agent: &Pm2Io, period: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Some(metric) = agent.metrics().get("test") {
            metric.inc();
        }
        if !agent.notifier().log("I love logging things").await {
            trace!("Collector not connected, log line dropped");
        }
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
