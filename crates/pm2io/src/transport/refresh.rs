//! Periodic endpoint re-verification
//!
//! Started once per process. Each tick re-runs discovery; when the collector
//! hands out a different endpoint the cache is updated and the stream is
//! moved over. A failed discovery leaves everything as it is.

use super::{LoopGuard, Transporter};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::*;

pub(super) async fn run(transporter: Transporter) {
    let _guard = LoopGuard::enter(&transporter.shared.loops.refresh);

    let period = transporter.shared.options.refresh_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = transporter.shutdown_signal() => return,
        }

        transporter.refresh_endpoint().await;
    }
}

impl Transporter {
    /// Re-resolve the endpoint; returns `true` if it changed
    pub async fn refresh_endpoint(&self) -> bool {
        let fresh = match self.shared.resolver.resolve().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!("Endpoint refresh failed, keeping the current one: {}", e);
                return false;
            }
        };

        let previous = {
            let mut state = self.shared.state.lock();
            if state.endpoint.as_deref() == Some(fresh.as_str()) {
                return false;
            }
            state.endpoint.replace(fresh.clone())
        };

        info!(
            "Collector endpoint moved from {} to {}",
            previous.as_deref().unwrap_or("<none>"),
            fresh
        );
        self.close_and_reconnect("migration").await;
        true
    }
}
