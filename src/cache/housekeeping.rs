use crate::cache::CacheInner;
use crate::core::{CacheError, Result};
use crate::factory::InstanceFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Background worker driving idle eviction and the store sweep.
pub(crate) struct HousekeepingWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl HousekeepingWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub(crate) async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| CacheError::Lifecycle(format!("housekeeping worker join: {}", err)))?;
        }

        Ok(())
    }
}

impl Drop for HousekeepingWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the housekeeping worker for a cache.
pub(crate) fn spawn_housekeeping_worker<F: InstanceFactory>(
    inner: Arc<CacheInner<F>>,
    interval: Duration,
) -> HousekeepingWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = inner.housekeep().await {
                        event!(Level::WARN, cache = %inner.name(), error = %err, "housekeeping pass failed");
                    }
                }
            }
        }
    });

    HousekeepingWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
