use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::store::WalStore;

const CHECK_EVERY: Duration = Duration::from_secs(60);

/// Rewrite the event log whenever at least `threshold` records have been
/// appended since the last rewrite. Runs until the process exits.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_EVERY);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compaction check. Returns whether a rewrite happened.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appended = store.appends_since_compact().await;
    if appended < threshold {
        debug!(appended, threshold, "compaction not due");
        return false;
    }
    match store.compact().await {
        Ok(kept) => {
            info!(appended, kept, "event log compacted");
            true
        }
        Err(e) => {
            error!("event log compaction failed: {e}");
            false
        }
    }
}
