//! Client-initiated PINGs and stale-connection detection.

use super::SessionEnd;
use crate::client::state::{PongAction, Shared};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(super) async fn keepalive_task(shared: Arc<Shared>, signals: mpsc::UnboundedSender<SessionEnd>) {
    let period = shared.options.ping_interval;
    if period.is_zero() {
        return;
    }
    let max_pings_out = shared.options.max_pings_out;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    interval.tick().await;

    loop {
        interval.tick().await;

        {
            let mut core = shared.lock();
            if core.pings_out >= max_pings_out {
                tracing::warn!(pings_out = core.pings_out, "no PONG from server, connection is stale");
                drop(core);
                let _ = signals.send(SessionEnd::Stale);
                return;
            }
            core.pings_out += 1;
            core.outbound.enqueue_ping(PongAction::Keepalive);
        }
        shared.wake_writer();
    }
}
