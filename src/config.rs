use crate::error::MutationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What a lightweight delete does when the table carries projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    /// Reject the delete with `UnsupportedWithProjections`.
    #[default]
    Throw,
    /// Run the delete. Parts keep no projection data, so nothing is left to rebuild.
    Drop,
}

/// Server-wide toggles. Snapshotted into the router at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub disable_insertion_and_mutation: bool,
}

/// Per-query settings snapshot. Decisions made from it are reproducible because nothing
/// reads mutable global state after the snapshot is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationSettings {
    pub enable_lightweight_delete: bool,
    /// 0 queues the lightweight delete, anything else waits for it.
    pub lightweight_deletes_sync: u8,
    /// 0 queues mutations, anything else waits for them.
    pub mutations_sync: u8,
    pub lock_acquire_timeout_ms: u64,
    /// 0 disables the limit.
    pub max_table_size_to_drop: u64,
    pub rows_per_step: usize,
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            enable_lightweight_delete: true,
            lightweight_deletes_sync: 2,
            mutations_sync: 0,
            lock_acquire_timeout_ms: 120_000,
            max_table_size_to_drop: 50 * 1024 * 1024 * 1024,
            rows_per_step: 8192,
        }
    }
}

impl MutationSettings {
    /// Every mutation waits for completion and locks fail fast.
    pub fn synchronous() -> Self {
        Self {
            mutations_sync: 2,
            lightweight_deletes_sync: 2,
            lock_acquire_timeout_ms: 5_000,
            ..Self::default()
        }
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn mutations_are_sync(&self) -> bool {
        self.mutations_sync > 0
    }

    pub fn validate(&self) -> Result<(), MutationError> {
        if self.rows_per_step == 0 {
            return Err(MutationError::InvalidConfig {
                message: "rows_per_step must be greater than zero".into(),
            });
        }
        if self.mutations_sync > 2 || self.lightweight_deletes_sync > 2 {
            return Err(MutationError::InvalidConfig {
                message: "sync levels must be 0, 1 or 2".into(),
            });
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self, MutationError> {
        let bytes = std::fs::read(path)?;
        let settings: Self = serde_json::from_slice(&bytes).map_err(MutationError::decode)?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Per-table settings, fixed when the table is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    pub lightweight_mutation_projection_mode: ProjectionMode,
    pub reservation_timeout_ms: u64,
    pub allow_full_delete: bool,
    pub allow_lightweight_delete: bool,
    pub read_only: bool,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            lightweight_mutation_projection_mode: ProjectionMode::Throw,
            reservation_timeout_ms: 10_000,
            allow_full_delete: true,
            allow_lightweight_delete: true,
            read_only: false,
        }
    }
}

impl TableSettings {
    /// A table whose DELETE statements can only become lightweight deletes.
    pub fn lightweight_only() -> Self {
        Self {
            allow_full_delete: false,
            ..Self::default()
        }
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{MutationSettings, ProjectionMode, TableSettings};
    use tempfile::tempdir;

    #[test]
    fn settings_load_from_partial_json() {
        let dir = tempdir().expect("temp");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, br#"{"mutations_sync": 1, "rows_per_step": 16}"#).expect("write");
        let settings = MutationSettings::from_json_file(&path).expect("load");
        assert!(settings.mutations_are_sync());
        assert_eq!(settings.rows_per_step, 16);
        assert!(settings.enable_lightweight_delete);
    }

    #[test]
    fn zero_rows_per_step_is_rejected() {
        let settings = MutationSettings {
            rows_per_step: 0,
            ..MutationSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn projection_mode_uses_snake_case() {
        let settings: TableSettings =
            serde_json::from_str(r#"{"lightweight_mutation_projection_mode": "drop"}"#)
                .expect("decode");
        assert_eq!(
            settings.lightweight_mutation_projection_mode,
            ProjectionMode::Drop
        );
        assert!(settings.allow_full_delete);
    }

    #[test]
    fn unknown_projection_mode_is_rejected() {
        let decoded: Result<TableSettings, _> =
            serde_json::from_str(r#"{"lightweight_mutation_projection_mode": "rebuild"}"#);
        assert!(decoded.is_err());
    }
}
