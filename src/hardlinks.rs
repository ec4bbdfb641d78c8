use std::collections::BTreeMap;

/// Per-file outcome of a mutation: `true` when the file was hardlinked unchanged from the
/// source part, `false` when it was written by the mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardlinkedFiles {
    files: BTreeMap<String, bool>,
}

impl HardlinkedFiles {
    pub fn is_reused(&self, file: &str) -> Option<bool> {
        self.files.get(file).copied()
    }

    pub fn reused(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|(_, reused)| **reused)
            .map(|(name, _)| name.as_str())
    }

    pub fn rewritten(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|(_, reused)| !**reused)
            .map(|(name, _)| name.as_str())
    }

    pub fn reused_count(&self) -> usize {
        self.files.values().filter(|r| **r).count()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct HardlinkTracker {
    files: BTreeMap<String, bool>,
}

impl HardlinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_reused(&mut self, file: &str) {
        self.record(file, true);
    }

    pub fn mark_rewritten(&mut self, file: &str) {
        self.record(file, false);
    }

    /// Panics when a file is recorded with two different outcomes: that would mean the
    /// output part holds a file that is both shared and rewritten.
    fn record(&mut self, file: &str, reused: bool) {
        if let Some(previous) = self.files.get(file) {
            assert_eq!(
                *previous, reused,
                "file '{file}' recorded as both reused and rewritten"
            );
            return;
        }
        self.files.insert(file.to_string(), reused);
    }

    pub fn contains(&self, file: &str) -> bool {
        self.files.contains_key(file)
    }

    pub fn snapshot(&self) -> HardlinkedFiles {
        HardlinkedFiles {
            files: self.files.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HardlinkTracker;

    #[test]
    fn snapshot_splits_reused_and_rewritten() {
        let mut tracker = HardlinkTracker::new();
        tracker.mark_reused("a.col");
        tracker.mark_rewritten("b.col");
        tracker.mark_reused("a.col");
        let snap = tracker.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.reused().collect::<Vec<_>>(), vec!["a.col"]);
        assert_eq!(snap.rewritten().collect::<Vec<_>>(), vec!["b.col"]);
        assert_eq!(snap.is_reused("b.col"), Some(false));
        assert_eq!(snap.is_reused("c.col"), None);
    }

    #[test]
    #[should_panic(expected = "both reused and rewritten")]
    fn conflicting_outcomes_fail_fast() {
        let mut tracker = HardlinkTracker::new();
        tracker.mark_reused("a.col");
        tracker.mark_rewritten("a.col");
    }
}
