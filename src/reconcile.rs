use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use crate::dataplane::Dataplane;

/// Repair the dataplane every `period` until `stop` is set.
///
/// The kernel work runs on the blocking pool; a stop request is honored between ticks, never
/// during a kernel call.
pub async fn run(dataplane: Arc<Dataplane>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; bootup just did the work
    ticker.tick().await;

    info!("reconciling every {period:?}");
    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    // sender gone
                    break;
                }
                continue;
            }
        }

        let dp = dataplane.clone();
        match tokio::task::spawn_blocking(move || dp.reconcile()).await {
            Ok(Ok(())) => debug!("reconcile done"),
            Ok(Err(e)) => error!("reconcile failed: {e}"),
            Err(e) => error!("reconcile task failed: {e}"),
        }

        debug!("metrics: {:?}", dataplane.metrics().snapshot());
    }
    info!("reconcile loop stopped");
}
