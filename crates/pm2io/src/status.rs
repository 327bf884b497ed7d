//! Periodic `status` frames
//!
//! Reports the current metric samples and the registered action names so the
//! collector can render them without waiting for a trigger.

use crate::host::HostFacts;
use crate::protocol::CHANNEL_STATUS;
use crate::registry::{ActionRegistry, MetricRegistry, MetricSample};
use crate::transport::Transporter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::*;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub process: Vec<ProcessStatus>,
    pub server: ServerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub pm_id: u32,
    pub name: String,
    pub server: String,
    pub axm_monitor: BTreeMap<String, MetricSample>,
    pub axm_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub hostname: String,
    pub cpus: usize,
    pub total_mem: u64,
}

pub struct StatusSampler {
    transporter: Transporter,
    actions: Arc<ActionRegistry>,
    metrics: Arc<MetricRegistry>,
    host: HostFacts,
}

impl StatusSampler {
    pub fn new(
        transporter: Transporter,
        actions: Arc<ActionRegistry>,
        metrics: Arc<MetricRegistry>,
        host: HostFacts,
    ) -> Self {
        Self {
            transporter,
            actions,
            metrics,
            host,
        }
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            process: vec![ProcessStatus {
                pm_id: 0,
                name: self.transporter.config().name.clone(),
                server: self.transporter.server_name().to_string(),
                axm_monitor: self.metrics.list(),
                axm_actions: self.actions.names(),
            }],
            server: ServerStatus {
                hostname: self.host.hostname.clone(),
                cpus: self.host.cpus,
                total_mem: self.host.memory,
            },
        }
    }

    /// Send a report every status interval until shutdown
    ///
    /// Ticks that find the stream disconnected are skipped rather than
    /// queued.
    pub async fn run(self) {
        let period = self.transporter.options().status_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.transporter.shutdown_signal() => {
                    debug!("Status sampler stopped");
                    return;
                }
            }

            if !self.transporter.is_connected() {
                continue;
            }
            self.transporter.send(CHANNEL_STATUS, self.report()).await;
        }
    }
}
