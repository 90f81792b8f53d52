//! Periodic snapshot refresh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// A snapshot that can reload itself from its source
#[async_trait]
pub trait Refreshable: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> &'static str;

    /// Reload the snapshot, replacing it wholesale on success
    async fn refresh(&self) -> Result<()>;
}

/// Spawn a task that refreshes `target` every `interval` until cancelled
///
/// The first refresh happens after one interval; callers that need a
/// populated snapshot at startup should call `refresh` themselves first.
/// A failed refresh keeps the previous snapshot.
pub fn spawn_refresher(
    target: Arc<dyn Refreshable>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(snapshot = target.name(), "Refresher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = target.refresh().await {
                        warn!(snapshot = target.name(), error = %e, "Refresh failed, keeping previous snapshot");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Refreshable for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn refresh(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_interval_until_cancelled() {
        let target = Arc::new(Counting(AtomicUsize::new(0)));
        let cancel = CancellationToken::new();
        let handle = spawn_refresher(target.clone(), Duration::from_secs(10), cancel.clone());

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(target.0.load(Ordering::SeqCst), 3);
    }
}
