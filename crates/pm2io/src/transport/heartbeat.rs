//! Liveness pings for the current connection

use super::{Frame, LoopGuard, Transporter, Written};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::*;

/// Ping the collector every heartbeat interval until the connection of
/// `epoch` is retired or a ping fails.
pub(super) async fn run(transporter: Transporter, epoch: u64) {
    let _guard = LoopGuard::enter(&transporter.shared.loops.heartbeat);

    let period = transporter.shared.options.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = transporter.retired(epoch) => {
                trace!("Heartbeat of connection {} stopped", epoch);
                return;
            }
        }

        match transporter.write_frame(Frame::Ping(Vec::new()), Some(epoch)).await {
            Ok(Written::Sent) => trace!("Heartbeat sent on connection {}", epoch),
            Ok(Written::Dropped) => return,
            // the failed write already started the reconnect
            Err(e) => {
                warn!("Heartbeat on connection {} failed: {}", epoch, e);
                return;
            }
        }
    }
}
