//! Background housekeeping for sessions and trace spans

use crate::AppState;
use hal_common::metrics;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Result of one housekeeping pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub sessions: Vec<String>,
    pub spans: usize,
}

/// Destroy expired sessions and evict spans past their lifetime
pub fn sweep(state: &AppState, now: Instant) -> Sweep {
    let sessions = state.sessions.reap(now);
    let spans = state.traces.evict_stale(state.config.span_ttl());

    metrics::set_active_sessions(state.sessions.len());
    if spans > 0 {
        info!(evicted = spans, "Evicted stale trace spans");
    }

    Sweep { sessions, spans }
}

/// Run [`sweep`] every `reap_interval_secs` until shutdown
pub fn spawn(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.session.reap_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = sweep(&state, Instant::now());
                    debug!(
                        sessions = swept.sessions.len(),
                        spans = swept.spans,
                        "Housekeeping pass"
                    );
                }
            }
        }
        debug!("Reaper stopped");
    })
}
