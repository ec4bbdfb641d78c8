use crate::commands::MutationCommands;
use crate::config::TableSettings;
use crate::error::{MutationError, ResourceType};
use crate::lock::{TableExclusiveLockHolder, TableLock, TableLockHolder, TruncateLock};
use crate::storage::{MutationSubmission, QueryContext, Storage, StorageCapabilities};
use crate::task::apply_commands;
use crate::types::{Block, ROW_EXISTS_COLUMN, TableSchema};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// In-memory table holding one block. Mutations rewrite the block copy-on-write and swap
/// it in; truncation replaces it wholesale and therefore needs the exclusive lock.
#[derive(Debug)]
pub struct MemoryTable {
    schema: RwLock<Arc<TableSchema>>,
    settings: TableSettings,
    lock: Arc<TableLock>,
    data: RwLock<Arc<Block>>,
    next_version: AtomicU64,
    dropped: AtomicBool,
}

impl MemoryTable {
    pub fn new(schema: TableSchema, settings: TableSettings) -> Self {
        Self {
            lock: TableLock::new(schema.full_name()),
            schema: RwLock::new(Arc::new(schema)),
            settings,
            data: RwLock::new(Arc::new(Block::default())),
            next_version: AtomicU64::new(1),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, block: Block) -> Result<(), MutationError> {
        let schema = self.metadata();
        for def in &schema.columns {
            if !block.has_column(&def.name) {
                return Err(MutationError::Validation(format!(
                    "insert is missing column '{}'",
                    def.name
                )));
            }
        }
        let mut data = self.data.write();
        let mut next = (**data).clone();
        next.append(block)?;
        *data = Arc::new(next);
        Ok(())
    }

    /// Snapshot of the current rows.
    pub fn snapshot(&self) -> Arc<Block> {
        Arc::clone(&self.data.read())
    }

    fn check_writable(&self) -> Result<(), MutationError> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(MutationError::not_found(
                ResourceType::Table,
                self.metadata().full_name(),
            ));
        }
        if self.settings.read_only {
            return Err(MutationError::ReadOnly {
                table: self.metadata().full_name(),
            });
        }
        Ok(())
    }
}

impl Storage for MemoryTable {
    fn engine_name(&self) -> &'static str {
        "Memory"
    }

    fn metadata(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema.read())
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            delete: self.settings.allow_full_delete,
            lightweight_delete: false,
            truncate_under_share_lock: false,
            read_only: self.settings.read_only,
        }
    }

    fn table_settings(&self) -> &TableSettings {
        &self.settings
    }

    fn lock_for_share(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableLockHolder, MutationError> {
        self.lock.lock_for_share(query_id, timeout)
    }

    fn lock_exclusively(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableExclusiveLockHolder, MutationError> {
        self.lock.lock_exclusively(query_id, timeout)
    }

    fn mutate(
        &self,
        commands: MutationCommands,
        ctx: &QueryContext,
        lock: &TableLockHolder,
    ) -> Result<MutationSubmission, MutationError> {
        self.check_writable()?;
        if commands
            .touched_columns()
            .contains(ROW_EXISTS_COLUMN)
        {
            return Err(MutationError::UnsupportedOperation(format!(
                "lightweight delete is not supported by {} tables",
                self.engine_name()
            )));
        }
        let schema = self.metadata();
        let resulting = commands.resulting_schema(&schema)?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);

        let mut data = self.data.write();
        let mut next = (**data).clone();
        apply_commands(&commands, &mut next, &schema)?;
        *data = Arc::new(next);
        if commands.changes_schema() {
            *self.schema.write() = Arc::new(resulting);
        }
        drop(data);
        info!(
            table = %schema.full_name(),
            query_id = %ctx.query_id,
            lock_query_id = lock.query_id(),
            version,
            "memory table mutated"
        );
        Ok(MutationSubmission {
            version,
            parts_mutated: 1,
            is_done: true,
        })
    }

    fn truncate(&self, ctx: &QueryContext, lock: TruncateLock<'_>) -> Result<(), MutationError> {
        self.check_writable()?;
        if !lock.is_exclusive() {
            return Err(MutationError::Logical(format!(
                "truncating {} requires an exclusive lock",
                self.metadata().full_name()
            )));
        }
        *self.data.write() = Arc::new(Block::default());
        info!(table = %self.metadata().full_name(), query_id = %ctx.query_id, "memory table truncated");
        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        // Rough in-memory footprint.
        let data = self.data.read();
        (data.rows() * data.column_names().count() * std::mem::size_of::<crate::types::Value>())
            as u64
    }

    fn drop_table(&self) {
        self.dropped.store(true, Ordering::Release);
    }
}
