use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::info;

/// Cooperative gate that pauses new merges and mutations, globally or per partition.
/// Running tasks observe it at their next step boundary.
#[derive(Debug, Default)]
pub struct ActionBlocker {
    global: AtomicUsize,
    forever: AtomicBool,
    partitions: Mutex<HashMap<String, usize>>,
}

impl ActionBlocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks every partition until the returned guard is dropped.
    pub fn cancel(self: &Arc<Self>) -> ActionLock {
        self.global.fetch_add(1, Ordering::AcqRel);
        ActionLock {
            blocker: Arc::clone(self),
            partition: None,
        }
    }

    pub fn cancel_for_partition(self: &Arc<Self>, partition_id: &str) -> ActionLock {
        *self
            .partitions
            .lock()
            .entry(partition_id.to_string())
            .or_insert(0) += 1;
        ActionLock {
            blocker: Arc::clone(self),
            partition: Some(partition_id.to_string()),
        }
    }

    /// Permanent block, used when the table is being dropped or shut down.
    pub fn cancel_forever(&self) {
        info!("merges and mutations blocked permanently");
        self.forever.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.forever.load(Ordering::Acquire) || self.global.load(Ordering::Acquire) > 0
    }

    pub fn is_cancelled_forever(&self) -> bool {
        self.forever.load(Ordering::Acquire)
    }

    pub fn is_cancelled_for_partition(&self, partition_id: &str) -> bool {
        self.is_cancelled()
            || self
                .partitions
                .lock()
                .get(partition_id)
                .is_some_and(|n| *n > 0)
    }
}

/// Releases one block when dropped.
#[derive(Debug)]
pub struct ActionLock {
    blocker: Arc<ActionBlocker>,
    partition: Option<String>,
}

impl Drop for ActionLock {
    fn drop(&mut self) {
        match &self.partition {
            None => {
                self.blocker.global.fetch_sub(1, Ordering::AcqRel);
            }
            Some(partition_id) => {
                let mut partitions = self.blocker.partitions.lock();
                if let Some(count) = partitions.get_mut(partition_id) {
                    *count -= 1;
                    if *count == 0 {
                        partitions.remove(partition_id);
                    }
                }
            }
        }
    }
}
