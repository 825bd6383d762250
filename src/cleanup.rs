// =============================================================================
// Retention cleanup - daily pruning of time-series and audit rows
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::storage::Storage;

/// Cleanup cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Run retention cleanup once immediately, then every 24 hours until
/// shutdown.
pub async fn run(storage: Arc<Storage>, retention_days: u32, mut shutdown: watch::Receiver<bool>) {
    info!(retention_days, "cleanup loop started (daily)");
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("cleanup loop stopping");
                return;
            }
        }

        match storage.cleanup_older_than(retention_days).await {
            Ok((deleted, None)) => {
                info!(deleted, retention_days, "retention cleanup complete");
            }
            Ok((deleted, Some(err))) => {
                warn!(deleted, error = %err, "retention cleanup partially failed");
            }
            Err(e) => {
                error!(error = %e, "retention cleanup failed");
                continue;
            }
        }

        if let Err(e) = storage
            .set_state("last_cleanup_at", &Utc::now().to_rfc3339())
            .await
        {
            warn!(error = %e, "failed to record cleanup timestamp");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AlertHistoryEntry;
    use crate::types::{PowerState, ResourceSnapshot};
    use chrono::TimeDelta;

    #[tokio::test]
    async fn first_run_is_immediate_and_records_timestamp() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());

        let old = Utc::now() - TimeDelta::days(20);
        storage
            .insert_snapshot(&ResourceSnapshot {
                id: 0,
                server_id: "s1".into(),
                timestamp: old,
                power_state: PowerState::Running,
                cpu_percent: 1.0,
                mem_bytes: 0,
                mem_limit: 0,
                disk_bytes: 0,
                disk_limit: 0,
                net_rx: 0,
                net_tx: 0,
                uptime_ms: 0,
            })
            .await
            .unwrap();
        storage
            .insert_alert_history(&AlertHistoryEntry {
                rule_id: "r".into(),
                user_uuid: "u".into(),
                server_id: "s1".into(),
                condition: "cpu_threshold".into(),
                value: 1.0,
                triggered_at: old,
            })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(storage.clone(), 7, rx));

        // The immediate pass prunes both tables without waiting a day.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if storage.snapshot_count().await.unwrap() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cleanup never pruned the old rows");

        assert_eq!(storage.alert_history_count().await.unwrap(), 0);
        assert!(storage.get_state("last_cleanup_at").await.unwrap().is_some());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
