//! Process-local intake state: attachments waiting for a tenant binding and
//! the message dedupe window.
//!
//! Both live from process start until restart; nothing here is persisted.
//! They sit behind traits so a durable store can replace them without
//! touching [`IntakeHandler`](super::IntakeHandler).

use std::time::Duration;

use moka::sync::Cache;

use crate::gateway::Attachment;

/// Attachments kept per submitter while waiting for the binding.
const MAX_STASHED_PER_SUBMITTER: usize = 20;

/// An attachment received before its sender was bound to a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashedAttachment {
    pub attachment: Attachment,
    pub message_id: String,
}

/// Attachments held until their submitter completes the fiscal-id handshake.
pub trait PendingBindings: Send + Sync {
    fn stash(&self, submitter_id: i64, item: StashedAttachment);

    /// Removes and returns everything stashed for the submitter, oldest first.
    fn take(&self, submitter_id: i64) -> Vec<StashedAttachment>;

    fn has_pending(&self, submitter_id: i64) -> bool;
}

/// Remembers recently seen message keys.
pub trait MessageDedupe: Send + Sync {
    /// True the first time a key is seen within the window.
    fn first_delivery(&self, key: &str) -> bool;

    /// Drops a key so the next delivery of that message is handled again.
    fn forget(&self, key: &str);
}

/// [`PendingBindings`] over a moka TTL cache. Entries expire `ttl` after the
/// last stash.
pub struct MemoryPendingBindings {
    cache: Cache<i64, Vec<StashedAttachment>>,
}

impl MemoryPendingBindings {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl PendingBindings for MemoryPendingBindings {
    fn stash(&self, submitter_id: i64, item: StashedAttachment) {
        let mut items = self.cache.get(&submitter_id).unwrap_or_default();
        if items.iter().any(|i| i.message_id == item.message_id) {
            return;
        }
        if items.len() >= MAX_STASHED_PER_SUBMITTER {
            items.remove(0);
        }
        items.push(item);
        self.cache.insert(submitter_id, items);
    }

    fn take(&self, submitter_id: i64) -> Vec<StashedAttachment> {
        self.cache.remove(&submitter_id).unwrap_or_default()
    }

    fn has_pending(&self, submitter_id: i64) -> bool {
        self.cache.contains_key(&submitter_id)
    }
}

/// [`MessageDedupe`] over a moka TTL cache.
pub struct MemoryMessageDedupe {
    cache: Cache<String, ()>,
}

impl MemoryMessageDedupe {
    pub fn new(window: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(window)
                .build(),
        }
    }
}

impl MessageDedupe for MemoryMessageDedupe {
    fn first_delivery(&self, key: &str) -> bool {
        self.cache.entry(key.to_string()).or_insert(()).is_fresh()
    }

    fn forget(&self, key: &str) {
        self.cache.invalidate(key);
    }
}
