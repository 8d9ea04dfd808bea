//! The single task draining the backlog into the store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backlog::Backlog;
use crate::notify::ChangeNotifier;
use crate::store::Store;

const IDLE_WAIT: Duration = Duration::from_millis(200);
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Sole write path from the backlog into the store. Being the only mutator
/// serialises id assignment and column-dictionary updates without extra
/// locking.
pub struct Writer {
    store: Arc<Store>,
    backlog: Arc<Backlog>,
    notifier: ChangeNotifier,
    batch_size: usize,
}

impl Writer {
    pub fn new(
        store: Arc<Store>,
        backlog: Arc<Backlog>,
        notifier: ChangeNotifier,
        batch_size: usize,
    ) -> Self {
        Self { store, backlog, notifier, batch_size }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("writer started, batch size {}", self.batch_size);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.backlog.wait_nonempty(IDLE_WAIT) => {}
            }
            let batch = self.backlog.drain(self.batch_size);
            if batch.is_empty() {
                continue;
            }
            if !self.commit(&batch, &cancel).await {
                break;
            }
        }
        self.flush().await;
        tracing::info!("writer stopped");
    }

    /// Insert one batch, retrying with bounded exponential backoff until it
    /// lands or the writer is cancelled. Returns false when cancelled.
    async fn commit(&self, batch: &[crate::store::LogRecord], cancel: &CancellationToken) -> bool {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.store.insert(batch).await {
                Ok(written) => {
                    if written > 0 {
                        self.publish_max_id().await;
                    }
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to write batch of {} records, retrying in {:?}: {e}",
                        batch.len(),
                        backoff
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::warn!("cancelled mid-retry, {} records dropped", batch.len());
                            return false;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Drain whatever is left after cancellation, one attempt per batch.
    async fn flush(&self) {
        loop {
            let batch = self.backlog.drain(self.batch_size);
            if batch.is_empty() {
                break;
            }
            match self.store.insert(&batch).await {
                Ok(written) => {
                    if written > 0 {
                        self.publish_max_id().await;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "dropping {} records during shutdown flush: {e}",
                        batch.len()
                    );
                    break;
                }
            }
        }
    }

    async fn publish_max_id(&self) {
        match self.store.get_max_log_id().await {
            Ok(id) => self.notifier.set(id),
            Err(e) => tracing::warn!("failed to read max log id: {e}"),
        }
    }
}
