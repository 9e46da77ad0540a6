//! Background revision compaction.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::KvBackend;

/// Every `interval`, compact the backend up to the revision observed on the
/// previous tick. Watches get one full interval to catch up before their
/// history disappears.
pub async fn run_compactor(
    backend: Arc<dyn KvBackend>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(?interval, "compactor started");
    let mut last_seen: Option<i64> = None;
    let mut compacted = 0i64;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }

        if let Some(target) = last_seen.filter(|rev| *rev > compacted) {
            match backend.compact(target).await {
                Ok(()) => {
                    compacted = target;
                    debug!(revision = target, "compacted store history");
                }
                Err(e) => warn!(revision = target, error = %e, "compaction failed"),
            }
        }
        match backend.current_revision().await {
            Ok(rev) => last_seen = Some(rev),
            Err(e) => warn!(error = %e, "could not read current revision"),
        }
    }
    debug!("compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedBackend;
    use crate::error::StoreError;

    #[tokio::test(start_paused = true)]
    async fn compacts_previous_tick_revision() {
        let be = Arc::new(EmbeddedBackend::open_in_memory().unwrap());
        for i in 0..3u8 {
            be.put("/k", vec![i], 0).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_compactor(
            be.clone(),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        // First tick only observes revision 3, second tick compacts it.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(matches!(be.watch("/k", 1).await, Err(StoreError::Compacted(_))));
        assert!(be.watch("/k", 3).await.is_ok());

        cancel.cancel();
        task.await.unwrap();
    }
}
