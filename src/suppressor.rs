use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::current_timestamp_ms;
use crate::wire::MessageId;

/// Time-windowed record of recently seen message identifiers, used to realize
/// at-most-once processing of inbound messages.
///
/// The check-and-record step is atomic across concurrent callers: two callers
/// racing on the same identifier never both observe "not seen".
pub struct DuplicateSuppressor {
    seen: DashMap<[u8; 16], u64>,
    ttl: Duration,
    sweep_max_removals: usize,
    shutdown: AtomicBool,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DuplicateSuppressor {
    pub fn new(ttl: Duration, sweep_max_removals: usize) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            sweep_max_removals,
            shutdown: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Atomically check whether `id` has been seen; record it and return
    /// `true` when it has not. A `false` return means the caller must discard
    /// the message.
    pub fn should_process(&self, id: &MessageId) -> bool {
        match self.seen.entry(*id.as_bytes()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(current_timestamp_ms());
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Remove entries older than the TTL, bounded per pass so a large backlog
    /// cannot stall the sweeper. Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let now = current_timestamp_ms();
        let ttl_ms = self.ttl.as_millis() as u64;

        let expired: Vec<[u8; 16]> = self
            .seen
            .iter()
            .filter(|entry| now.saturating_sub(*entry.value()) >= ttl_ms)
            .map(|entry| *entry.key())
            .take(self.sweep_max_removals)
            .collect();

        let mut removed = 0;
        for key in expired {
            // Re-check under the shard lock so a concurrent re-insert survives.
            if self
                .seen
                .remove_if(&key, |_, seen_at| now.saturating_sub(*seen_at) >= ttl_ms)
                .is_some()
            {
                removed += 1;
            }
        }

        if removed == self.sweep_max_removals {
            warn!(
                removed,
                "sweep hit the per-pass removal bound, backlog remains"
            );
        }
        removed
    }

    /// Start the background sweep task. Runs until `stop()`.
    pub fn start_sweeper(self: &Arc<Self>, sweep_interval: Duration) {
        let suppressor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if suppressor.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let removed = suppressor.sweep();
                if removed > 0 {
                    debug!(removed, remaining = suppressor.len(), "swept expired message ids");
                }
            }
            info!("duplicate suppressor sweeper stopped");
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the sweep task; called on agent shutdown.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for DuplicateSuppressor {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
