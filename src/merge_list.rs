use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live progress counters of one running merge or mutation.
#[derive(Debug)]
pub struct MergeListElement {
    pub table: String,
    pub partition_id: String,
    pub source_part_names: Vec<String>,
    pub result_part_name: String,
    pub is_mutation: bool,
    started_at: Instant,
    total_rows: AtomicU64,
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl MergeListElement {
    pub fn set_total_rows(&self, rows: u64) {
        self.total_rows.store(rows, Ordering::Relaxed);
    }

    pub fn add_read(&self, rows: u64, bytes: u64) {
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, rows: u64, bytes: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn info(&self) -> MergeInfo {
        let total_rows = self.total_rows.load(Ordering::Relaxed);
        let rows_read = self.rows_read.load(Ordering::Relaxed);
        let progress = if total_rows == 0 {
            0.0
        } else {
            (rows_read as f64 / total_rows as f64).min(1.0)
        };
        MergeInfo {
            table: self.table.clone(),
            partition_id: self.partition_id.clone(),
            source_part_names: self.source_part_names.clone(),
            result_part_name: self.result_part_name.clone(),
            is_mutation: self.is_mutation,
            elapsed: self.started_at.elapsed(),
            progress,
            total_rows,
            rows_read,
            rows_written: self.rows_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeInfo {
    pub table: String,
    pub partition_id: String,
    pub source_part_names: Vec<String>,
    pub result_part_name: String,
    pub is_mutation: bool,
    pub elapsed: Duration,
    pub progress: f64,
    pub total_rows: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Process-wide listing of running merges and mutations.
#[derive(Debug, Default)]
pub struct MergeList {
    entries: Mutex<BTreeMap<u64, Arc<MergeListElement>>>,
    next_id: AtomicU64,
}

impl MergeList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_mutation(
        self: &Arc<Self>,
        table: &str,
        partition_id: &str,
        source_part: &str,
        result_part: &str,
    ) -> MergeListEntry {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let element = Arc::new(MergeListElement {
            table: table.to_string(),
            partition_id: partition_id.to_string(),
            source_part_names: vec![source_part.to_string()],
            result_part_name: result_part.to_string(),
            is_mutation: true,
            started_at: Instant::now(),
            total_rows: AtomicU64::new(0),
            rows_read: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        });
        self.entries.lock().insert(id, Arc::clone(&element));
        MergeListEntry {
            list: Arc::clone(self),
            id,
            element,
        }
    }

    pub fn get(&self) -> Vec<MergeInfo> {
        self.entries.lock().values().map(|e| e.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Registration in a [`MergeList`]; removed from the listing when dropped.
#[derive(Debug)]
pub struct MergeListEntry {
    list: Arc<MergeList>,
    id: u64,
    element: Arc<MergeListElement>,
}

impl MergeListEntry {
    pub fn element(&self) -> &MergeListElement {
        &self.element
    }
}

impl Drop for MergeListEntry {
    fn drop(&mut self) {
        self.list.entries.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::MergeList;

    #[test]
    fn entry_reports_progress_and_unregisters_on_drop() {
        let list = MergeList::new();
        let entry = list.insert_mutation("db.t", "all", "all_1_1_0", "all_1_1_0_2");
        entry.element().set_total_rows(10);
        entry.element().add_read(5, 100);
        entry.element().add_written(4, 80);
        let infos = list.get();
        assert_eq!(infos.len(), 1);
        assert!((infos[0].progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(infos[0].rows_written, 4);
        assert!(infos[0].is_mutation);
        drop(entry);
        assert!(list.is_empty());
    }
}
