use crate::error::MutationError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: Option<String>,
    waiting_exclusive: usize,
}

/// Table-level read/write lock. Share mode admits mutations and reads together; exclusive
/// mode is taken by operations that replace the whole part set without atomic swaps.
/// A waiting exclusive request blocks new share requests so it cannot starve.
#[derive(Debug)]
pub struct TableLock {
    table: String,
    state: Mutex<LockState>,
    cv: Condvar,
}

impl TableLock {
    pub fn new(table: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            table: table.into(),
            state: Mutex::new(LockState::default()),
            cv: Condvar::new(),
        })
    }

    pub fn lock_for_share(
        self: &Arc<Self>,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableLockHolder, MutationError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.exclusive.is_some() || state.waiting_exclusive > 0 {
            if self.cv.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive.is_some() || state.waiting_exclusive > 0)
            {
                warn!(table = %self.table, query_id, "share lock acquisition timed out");
                return Err(self.timeout(query_id, "share"));
            }
        }
        state.shared += 1;
        Ok(TableLockHolder {
            lock: Arc::clone(self),
            query_id: query_id.to_string(),
        })
    }

    pub fn lock_exclusively(
        self: &Arc<Self>,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableExclusiveLockHolder, MutationError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiting_exclusive += 1;
        while state.exclusive.is_some() || state.shared > 0 {
            if self.cv.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive.is_some() || state.shared > 0)
            {
                state.waiting_exclusive -= 1;
                drop(state);
                // Share waiters parked behind this request may proceed now.
                self.cv.notify_all();
                warn!(table = %self.table, query_id, "exclusive lock acquisition timed out");
                return Err(self.timeout(query_id, "exclusive"));
            }
        }
        state.waiting_exclusive -= 1;
        state.exclusive = Some(query_id.to_string());
        Ok(TableExclusiveLockHolder {
            lock: Arc::clone(self),
            query_id: query_id.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn share_holders(&self) -> usize {
        self.state.lock().shared
    }

    pub fn exclusive_holder(&self) -> Option<String> {
        self.state.lock().exclusive.clone()
    }

    fn timeout(&self, query_id: &str, mode: &'static str) -> MutationError {
        MutationError::LockTimeout {
            table: self.table.clone(),
            query_id: query_id.to_string(),
            mode,
        }
    }
}

/// Share-mode lock token. Mutations borrow it for their whole lifetime.
#[derive(Debug)]
pub struct TableLockHolder {
    lock: Arc<TableLock>,
    query_id: String,
}

impl TableLockHolder {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn table(&self) -> &str {
        &self.lock.table
    }
}

impl Drop for TableLockHolder {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.shared = state.shared.saturating_sub(1);
        drop(state);
        self.lock.cv.notify_all();
    }
}

#[derive(Debug)]
pub struct TableExclusiveLockHolder {
    lock: Arc<TableLock>,
    query_id: String,
}

impl TableExclusiveLockHolder {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl Drop for TableExclusiveLockHolder {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.exclusive = None;
        drop(state);
        self.lock.cv.notify_all();
    }
}

/// Lock under which a truncate runs.
#[derive(Debug, Clone, Copy)]
pub enum TruncateLock<'a> {
    Shared(&'a TableLockHolder),
    Exclusive(&'a TableExclusiveLockHolder),
}

impl TruncateLock<'_> {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, TruncateLock::Exclusive(_))
    }

    pub fn query_id(&self) -> &str {
        match self {
            TruncateLock::Shared(h) => h.query_id(),
            TruncateLock::Exclusive(h) => h.query_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TableLock;
    use crate::error::MutationError;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn share_locks_coexist() {
        let lock = TableLock::new("db.t");
        let a = lock
            .lock_for_share("q1", Duration::ZERO)
            .expect("first share");
        let b = lock
            .lock_for_share("q2", Duration::ZERO)
            .expect("second share");
        assert_eq!(lock.share_holders(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.share_holders(), 0);
    }

    #[test]
    fn exclusive_times_out_while_shared_is_held() {
        let lock = TableLock::new("db.t");
        let _reader = lock.lock_for_share("reader", Duration::ZERO).expect("share");
        let err = lock
            .lock_exclusively("truncate", Duration::from_millis(20))
            .expect_err("timeout");
        assert!(matches!(
            err,
            MutationError::LockTimeout {
                mode: "exclusive",
                ..
            }
        ));
        // The failed request must not keep blocking share requests.
        assert!(lock.lock_for_share("after", Duration::ZERO).is_ok());
    }

    #[test]
    fn exclusive_waits_for_share_release() {
        let lock = TableLock::new("db.t");
        let reader = lock.lock_for_share("reader", Duration::ZERO).expect("share");
        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.lock_exclusively("truncate", Duration::from_secs(5))
                    .map(|h| h.query_id().to_string())
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(reader);
        assert_eq!(writer.join().expect("join").expect("exclusive"), "truncate");
    }

    #[test]
    fn share_times_out_while_exclusive_is_held() {
        let lock = TableLock::new("db.t");
        let _excl = lock
            .lock_exclusively("truncate", Duration::ZERO)
            .expect("exclusive");
        assert_eq!(lock.exclusive_holder().as_deref(), Some("truncate"));
        let err = lock
            .lock_for_share("reader", Duration::from_millis(10))
            .expect_err("timeout");
        assert_eq!(err.code().as_str(), "lock_timeout");
    }
}
