//! Last-inserted-id cell with fan-out wakeups.

use std::sync::Arc;

use tokio::sync::watch;

/// Atomic last-id cell driving SSE subscribers. `set` stores the latest id
/// and wakes every subscriber; a woken subscriber always observes an id at
/// least as new as the one that woke it. Unsubscribing is dropping the
/// receiver.
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<Option<i64>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Option<i64> {
        *self.tx.borrow()
    }

    pub fn set(&self, id: i64) {
        self.tx.send_replace(Some(id));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<i64>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
