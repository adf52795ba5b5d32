//! Periodic `TARGET_*` to `MONITOR_*` propagation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::store::PropertyStore;

/// Default propagation period.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Start the updater task. Each tick mirrors targets into monitors.
pub fn spawn_updater(store: Arc<Mutex<PropertyStore>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!("Monitor updater started (interval: {:?})", period);

        loop {
            ticker.tick().await;
            let changed = match store.lock() {
                Ok(mut store) => store.sync_monitors(),
                Err(_) => {
                    warn!("Property store lock poisoned, stopping updater");
                    return;
                }
            };
            if changed > 0 {
                debug!(changed, "Monitors updated");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOCATION: &str = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION";

    #[tokio::test]
    async fn test_monitor_follows_target_after_a_tick() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(PropertyStore::standard(LOCATION, dir.path()).unwrap()));
        let handle = spawn_updater(store.clone(), Duration::from_millis(50));

        store
            .lock()
            .unwrap()
            .put(&format!("{LOCATION}/TARGET_VOLTAGE"), "42")
            .unwrap();

        let monitor = format!("{LOCATION}/MONITOR_VOLTAGE");
        let mut seen = String::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            seen = store.lock().unwrap().get(&monitor).unwrap().reply.render();
            if seen == "42" {
                break;
            }
        }
        handle.abort();
        assert_eq!(seen, "42");
    }
}
