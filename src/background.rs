//! Background Tasks (C12): process-wide timers, each cancellable on
//! shutdown via a `tokio_util`-free `CancellationToken`-less approach --
//! a `tokio::sync::watch` boolean, matching the teacher's own shutdown
//! broadcast style.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use crate::alerter::Alerter;
use crate::channel::manager::ChannelManager;
use crate::persistence::Store;
use crate::session::SessionManager;

const DEDUP_GC_INTERVAL: Duration = Duration::from_secs(10);
const ALERTER_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Thresholds {
    serviced_wide_blocked: u64,
    max_wide_blocked: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            serviced_wide_blocked: 50,
            max_wide_blocked: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LastSample {
    serviced_wide_blocked: u64,
    max_wide_blocked: u64,
}

/// Spawns the four process-wide timers and returns the shutdown sender;
/// dropping or sending `true` on it cancels every loop below.
pub fn spawn<P: Store + 'static>(
    channel_manager: ChannelManager,
    sessions: SessionManager,
    alerter: Arc<Alerter<P>>,
    metrics_check_interval: Duration,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_dedup_gc(channel_manager.clone(), shutdown_rx.clone());
    spawn_alerter_housekeeping(alerter, shutdown_rx.clone());
    spawn_metric_sampling(channel_manager.clone(), metrics_check_interval, shutdown_rx.clone());
    spawn_session_sweep(sessions, shutdown_rx);

    shutdown_tx
}

fn spawn_dedup_gc(channel_manager: ChannelManager, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = interval(DEDUP_GC_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => channel_manager.cleanup_seen().await,
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn spawn_alerter_housekeeping<P: Store + 'static>(alerter: Arc<Alerter<P>>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = interval(ALERTER_HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => alerter.housekeeping().await,
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn spawn_metric_sampling(channel_manager: ChannelManager, interval_duration: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = interval(interval_duration);
        let mut last = LastSample::default();
        let thresholds = Thresholds::default();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = channel_manager.get_metrics().await;
                    if metrics.serviced_wide_blocked > thresholds.serviced_wide_blocked
                        && metrics.serviced_wide_blocked > last.serviced_wide_blocked
                    {
                        warn!(
                            "servicedWideBlocked crossed threshold: {} (was {})",
                            metrics.serviced_wide_blocked, last.serviced_wide_blocked
                        );
                    }
                    if metrics.max_wide_blocked > thresholds.max_wide_blocked
                        && metrics.max_wide_blocked > last.max_wide_blocked
                    {
                        warn!(
                            "maxWideBlocked crossed threshold: {} (was {})",
                            metrics.max_wide_blocked, last.max_wide_blocked
                        );
                    }
                    last = LastSample {
                        serviced_wide_blocked: metrics.serviced_wide_blocked,
                        max_wide_blocked: metrics.max_wide_blocked,
                    };
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn spawn_session_sweep(sessions: SessionManager, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Inactivity timeout itself is enforced inside each
                    // session task; this sweep just logs the live count for
                    // operational visibility.
                    let active = sessions.active_sessions().await;
                    info!("session sweep: {} active", active.len());
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbs::store::BbsStore;
    use crate::callsign::Callsign;
    use crate::persistence::MemStore;

    #[tokio::test]
    async fn shutdown_signal_stops_dedup_gc_loop() {
        let cm = ChannelManager::new();
        let sessions = SessionManager::new(cm.clone());
        let own: Callsign = "NA4WX-7".parse().unwrap();
        let store = Arc::new(BbsStore::<MemStore>::new());
        let alerter = Alerter::new(cm.clone(), store, own, None);
        let shutdown_tx = spawn(cm, sessions, alerter, Duration::from_secs(60));
        shutdown_tx.send(true).unwrap();
    }
}
