use crate::error::MutationError;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct DiskState {
    used_bytes: u64,
    reserved_bytes: u64,
}

/// A directory with a byte budget. Parts account for `used`, in-flight writers for
/// `reserved`.
#[derive(Debug)]
pub struct Disk {
    name: String,
    path: PathBuf,
    capacity_bytes: u64,
    state: Mutex<DiskState>,
    cv: Condvar,
}

impl Disk {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        capacity_bytes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            path: path.into(),
            capacity_bytes,
            state: Mutex::new(DiskState::default()),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved_bytes
    }

    pub fn unreserved_bytes(&self) -> u64 {
        let state = self.state.lock();
        self.capacity_bytes
            .saturating_sub(state.used_bytes)
            .saturating_sub(state.reserved_bytes)
    }

    /// Reserves `bytes`, waiting up to `timeout` for other reservations to be released.
    /// A request larger than everything not occupied by parts fails immediately.
    pub fn reserve(
        self: &Arc<Self>,
        bytes: u64,
        timeout: Duration,
    ) -> Result<Reservation, MutationError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let free_of_parts = self.capacity_bytes.saturating_sub(state.used_bytes);
            if bytes > free_of_parts {
                return Err(MutationError::OutOfSpace {
                    disk: self.name.clone(),
                    requested: bytes,
                    available: free_of_parts.saturating_sub(state.reserved_bytes),
                });
            }
            if state.reserved_bytes + bytes <= free_of_parts {
                state.reserved_bytes += bytes;
                debug!(disk = %self.name, bytes, "reserved disk space");
                return Ok(Reservation {
                    disk: Arc::clone(self),
                    bytes,
                });
            }
            if Instant::now() >= deadline {
                return Err(MutationError::Timeout(format!(
                    "waiting for {bytes} bytes on disk '{}'",
                    self.name
                )));
            }
            self.cv.wait_until(&mut state, deadline);
        }
    }

    pub(crate) fn account_part(&self, bytes: u64) {
        self.state.lock().used_bytes += bytes;
    }

    pub(crate) fn release_part(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.used_bytes = state.used_bytes.saturating_sub(bytes);
        drop(state);
        self.cv.notify_all();
    }

    fn release_reserved(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.reserved_bytes = state.reserved_bytes.saturating_sub(bytes);
        drop(state);
        self.cv.notify_all();
    }
}

/// Scoped disk-space reservation, released on drop.
#[derive(Debug)]
pub struct Reservation {
    disk: Arc<Disk>,
    bytes: u64,
}

impl Reservation {
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    pub fn size(&self) -> u64 {
        self.bytes
    }

    /// Shrinks the reservation once the writer knows it needs less.
    pub fn shrink_to(&mut self, bytes: u64) {
        if bytes < self.bytes {
            self.disk.release_reserved(self.bytes - bytes);
            self.bytes = bytes;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.disk.release_reserved(self.bytes);
            debug!(disk = %self.disk.name, bytes = self.bytes, "released disk reservation");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    disks: Vec<Arc<Disk>>,
}

impl Volume {
    pub fn new(disks: Vec<Arc<Disk>>) -> Result<Self, MutationError> {
        if disks.is_empty() {
            return Err(MutationError::InvalidConfig {
                message: "volume needs at least one disk".into(),
            });
        }
        Ok(Self { disks })
    }

    pub fn single(disk: Arc<Disk>) -> Self {
        Self { disks: vec![disk] }
    }

    pub fn disks(&self) -> &[Arc<Disk>] {
        &self.disks
    }

    pub fn disk(&self, name: &str) -> Option<&Arc<Disk>> {
        self.disks.iter().find(|d| d.name == name)
    }

    /// Reserves on the disk with the most unreserved space.
    pub fn reserve(&self, bytes: u64, timeout: Duration) -> Result<Reservation, MutationError> {
        let best = self
            .disks
            .iter()
            .max_by_key(|d| d.unreserved_bytes())
            .ok_or_else(|| MutationError::Logical("volume has no disks".into()))?;
        best.reserve(bytes, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::{Disk, Volume};
    use crate::error::MutationError;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reservation_is_released_on_drop() {
        let disk = Disk::new("d0", "/tmp/unused", 100);
        {
            let r = disk.reserve(60, Duration::ZERO).expect("reserve");
            assert_eq!(r.size(), 60);
            assert_eq!(disk.unreserved_bytes(), 40);
        }
        assert_eq!(disk.unreserved_bytes(), 100);
    }

    #[test]
    fn impossible_request_is_out_of_space() {
        let disk = Disk::new("d0", "/tmp/unused", 100);
        disk.account_part(50);
        let err = disk.reserve(60, Duration::from_secs(5)).expect_err("oos");
        assert!(matches!(err, MutationError::OutOfSpace { requested: 60, .. }));
    }

    #[test]
    fn contended_request_times_out() {
        let disk = Disk::new("d0", "/tmp/unused", 100);
        let _held = disk.reserve(80, Duration::ZERO).expect("first");
        let err = disk
            .reserve(30, Duration::from_millis(20))
            .expect_err("timeout");
        assert!(matches!(err, MutationError::Timeout(_)));
    }

    #[test]
    fn waiter_proceeds_when_space_is_released() {
        let disk = Disk::new("d0", "/tmp/unused", 100);
        let held = disk.reserve(80, Duration::ZERO).expect("first");
        let waiter = {
            let disk = disk.clone();
            thread::spawn(move || disk.reserve(50, Duration::from_secs(5)).map(|r| r.size()))
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().expect("join").expect("reserve"), 50);
    }

    #[test]
    fn volume_prefers_emptier_disk() {
        let a = Disk::new("a", "/tmp/a", 100);
        let b = Disk::new("b", "/tmp/b", 100);
        a.account_part(70);
        let volume = Volume::new(vec![a, b]).expect("volume");
        let r = volume.reserve(10, Duration::ZERO).expect("reserve");
        assert_eq!(r.disk().name(), "b");
    }
}
