use crate::access::CallerContext;
use crate::blocker::ActionBlocker;
use crate::commands::{MutationCommand, MutationCommands};
use crate::config::{MutationSettings, TableSettings};
use crate::error::{MutationError, ResourceType};
use crate::lock::{TableExclusiveLockHolder, TableLock, TableLockHolder, TruncateLock};
use crate::merge_list::MergeList;
use crate::part::{DataPart, INSERT_TEMP_PREFIX, PartColumn, PartName, TemporaryPart};
use crate::registry::PartRegistry;
use crate::reservation::Volume;
use crate::task::{FutureMutatedPart, MutateTask, MutateTaskArgs, TransactionHandle, execute_here};
use crate::types::{Block, ColumnDef, TableSchema, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// What a storage engine can do. The router dispatches on these flags instead of engine
/// types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCapabilities {
    pub delete: bool,
    pub lightweight_delete: bool,
    /// Truncation may run under a share lock because parts are swapped atomically.
    pub truncate_under_share_lock: bool,
    pub read_only: bool,
}

/// Per-query state handed to storages.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: String,
    pub caller: CallerContext,
    pub settings: MutationSettings,
    pub txn: Option<Arc<TransactionHandle>>,
}

impl QueryContext {
    pub fn new(query_id: impl Into<String>, caller: CallerContext) -> Self {
        Self {
            query_id: query_id.into(),
            caller,
            settings: MutationSettings::default(),
            txn: None,
        }
    }

    pub fn with_settings(mut self, settings: MutationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_transaction(mut self, txn: Arc<TransactionHandle>) -> Self {
        self.txn = Some(txn);
        self
    }
}

/// Outcome of submitting a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSubmission {
    pub version: u64,
    pub parts_mutated: usize,
    pub is_done: bool,
}

/// One entry of a table's mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationStatus {
    pub version: u64,
    pub query_id: String,
    pub commands: MutationCommands,
    pub create_time_secs: u64,
    pub parts_to_do: Vec<String>,
    pub is_done: bool,
    pub is_killed: bool,
    pub latest_failed_part: Option<String>,
    pub latest_fail_reason: Option<String>,
}

pub trait Storage: Send + Sync + std::fmt::Debug {
    fn engine_name(&self) -> &'static str;

    fn metadata(&self) -> Arc<TableSchema>;

    fn capabilities(&self) -> StorageCapabilities;

    fn table_settings(&self) -> &TableSettings;

    fn lock_for_share(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableLockHolder, MutationError>;

    fn lock_exclusively(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableExclusiveLockHolder, MutationError>;

    /// Rejects commands that would rewrite partition or sorting key columns.
    fn check_mutation_is_possible(&self, commands: &MutationCommands) -> Result<(), MutationError> {
        let schema = self.metadata();
        for command in commands {
            let column = match command {
                MutationCommand::UpdateColumn { column, .. }
                | MutationCommand::DropColumn { column } => column,
                MutationCommand::RenameColumn { from, .. } => from,
                _ => continue,
            };
            if schema.is_key_column(column) {
                return Err(MutationError::Validation(format!(
                    "cannot {} key column '{column}' of {}",
                    command.kind(),
                    schema.full_name()
                )));
            }
        }
        Ok(())
    }

    fn mutate(
        &self,
        commands: MutationCommands,
        ctx: &QueryContext,
        lock: &TableLockHolder,
    ) -> Result<MutationSubmission, MutationError>;

    fn truncate(&self, ctx: &QueryContext, lock: TruncateLock<'_>) -> Result<(), MutationError>;

    fn total_bytes(&self) -> u64;

    /// Refuses to drop or truncate tables larger than `max_table_size_to_drop` (0 disables).
    fn check_table_can_be_dropped(&self, max_table_size_to_drop: u64) -> Result<(), MutationError> {
        let size = self.total_bytes();
        if max_table_size_to_drop > 0 && size > max_table_size_to_drop {
            return Err(MutationError::Prohibited(format!(
                "table {} is {size} bytes, larger than max_table_size_to_drop ({max_table_size_to_drop})",
                self.metadata().full_name()
            )));
        }
        Ok(())
    }

    /// Marks the table dropped; running mutations cancel at their next step.
    fn drop_table(&self);
}

#[derive(Debug)]
struct MutationEntry {
    status: MutationStatus,
    settings: MutationSettings,
    txn: Option<Arc<TransactionHandle>>,
}

/// Columnar table of immutable on-disk parts. Mutations rewrite parts through
/// [`MutateTask`]s; truncation swaps the part set out under a share lock.
#[derive(Debug)]
pub struct PartTable {
    registry: Arc<PartRegistry>,
    settings: TableSettings,
    lock: Arc<TableLock>,
    blocker: Arc<ActionBlocker>,
    merge_list: Arc<MergeList>,
    mutations: Mutex<BTreeMap<u64, MutationEntry>>,
    /// One runner applies queued mutations at a time.
    runner: Mutex<()>,
    /// Inserts hold this for reading until they publish. Schema-changing mutations hold it
    /// for writing, so every part they must rewrite is published before they scan.
    schema_gate: RwLock<()>,
    dropped: AtomicBool,
}

impl PartTable {
    /// Opens (or creates) the table under `<disk>/<database>/<table>` on every disk of
    /// `volume`.
    pub fn open(
        schema: TableSchema,
        volume: &Volume,
        settings: TableSettings,
        merge_list: Arc<MergeList>,
    ) -> Result<Self, MutationError> {
        if schema.columns.is_empty() {
            return Err(MutationError::Validation(format!(
                "table {} has no columns",
                schema.full_name()
            )));
        }
        let relative: PathBuf = [schema.database.as_str(), schema.table_name.as_str()]
            .iter()
            .collect();
        let table = schema.full_name();
        let registry = PartRegistry::open(schema, volume, &relative)?;
        info!(table = %table, parts = registry.active_parts().len(), "opened table");
        Ok(Self {
            lock: TableLock::new(table),
            registry,
            settings,
            blocker: ActionBlocker::new(),
            merge_list,
            mutations: Mutex::new(BTreeMap::new()),
            runner: Mutex::new(()),
            schema_gate: RwLock::new(()),
            dropped: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<PartRegistry> {
        &self.registry
    }

    pub fn blocker(&self) -> &Arc<ActionBlocker> {
        &self.blocker
    }

    pub fn merge_list(&self) -> &Arc<MergeList> {
        &self.merge_list
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn active_parts(&self) -> Vec<Arc<DataPart>> {
        self.registry.active_parts()
    }

    fn check_writable(&self) -> Result<(), MutationError> {
        if self.is_dropped() {
            return Err(MutationError::not_found(
                ResourceType::Table,
                self.registry.table(),
            ));
        }
        if self.settings.read_only {
            return Err(MutationError::ReadOnly {
                table: self.registry.table().to_string(),
            });
        }
        Ok(())
    }

    /// Writes `block` as new parts, one per partition. The block uses the current column
    /// names; renames and drops still queued are applied to the written parts.
    pub fn insert(&self, query_id: &str, block: &Block) -> Result<Vec<Arc<DataPart>>, MutationError> {
        self.check_writable()?;
        let _lock = self.lock.lock_for_share(
            query_id,
            MutationSettings::default().lock_acquire_timeout(),
        )?;
        let _gate = self.schema_gate.read();
        let schema = self.registry.schema();
        for name in block.column_names() {
            if schema.get(name).is_none() {
                return Err(schema.unknown_column(name));
            }
        }
        let mut columns = Vec::with_capacity(schema.columns.len());
        for def in &schema.columns {
            let values = block.column(&def.name).ok_or_else(|| {
                MutationError::Validation(format!("insert is missing column '{}'", def.name))
            })?;
            let mut coerced = Vec::with_capacity(values.len());
            for value in values {
                let actual = value.type_name();
                match value.clone().coerce_to(def.col_type) {
                    Some(v) if !v.is_null() || def.nullable => coerced.push(v),
                    _ => {
                        return Err(MutationError::TypeMismatch {
                            table: schema.full_name(),
                            column: def.name.clone(),
                            expected: def.col_type.to_string(),
                            actual,
                        });
                    }
                }
            }
            columns.push(coerced);
        }

        let mut partitions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for row in 0..block.rows() {
            let key = match &schema.partition_by {
                Some(column) => {
                    let key = block
                        .value(column, row)
                        .map(Value::partition_key)
                        .unwrap_or_default();
                    if key.is_empty() { "-".to_string() } else { key }
                }
                None => "all".to_string(),
            };
            partitions.entry(key).or_default().push(row);
        }

        // Numbering and the queued-change lookup share the log lock with submission, so a
        // rename either gets a later version than these parts or is applied to them.
        let log = self.mutations.lock();
        let numbered: Vec<(u64, String, Vec<usize>)> = partitions
            .into_iter()
            .map(|(partition_id, rows)| (self.registry.allocate_block(), partition_id, rows))
            .collect();
        let mut layout: Vec<(ColumnDef, Vec<Value>)> =
            schema.columns.iter().cloned().zip(columns).collect();
        apply_queued_schema_changes(&log, &mut layout);
        drop(log);

        let mut written = Vec::with_capacity(numbered.len());
        for (block_number, partition_id, rows) in numbered {
            let name = PartName::new(partition_id, block_number, block_number);
            let estimate = (rows.len() * layout.len() * 32) as u64;
            let reservation = self
                .registry
                .volume()
                .reserve(estimate, self.settings.reservation_timeout())?;
            let disk = Arc::clone(reservation.disk());
            let mut part = TemporaryPart::create(
                &disk,
                &self.registry.table_dir(&disk),
                name,
                Some(INSERT_TEMP_PREFIX),
            )?;
            for (def, values) in &layout {
                part.create_column(PartColumn {
                    name: def.name.clone(),
                    col_type: def.col_type,
                    nullable: def.nullable,
                })?;
                let selected: Vec<Value> = rows.iter().map(|r| values[*r].clone()).collect();
                part.write_column(&def.name, &selected)?;
            }
            part.add_rows(rows.len() as u64);
            part.finalize()?;
            written.push(self.registry.publish(part, None)?);
            drop(reservation);
        }
        Ok(written)
    }

    /// Visible rows of `columns` across all active parts. Columns a part lacks read as NULL.
    pub fn select(&self, columns: &[&str]) -> Result<Block, MutationError> {
        let mut out = Block::default();
        for part in self.registry.active_parts() {
            let present: Vec<&str> = columns
                .iter()
                .copied()
                .filter(|c| part.has_column(c))
                .collect();
            let mut block = part.read_visible(&present)?;
            for column in columns {
                if !block.has_column(column) {
                    block.insert_column(*column, vec![Value::Null; block.rows()]);
                }
            }
            out.append(block)?;
        }
        Ok(out)
    }

    pub fn select_all(&self) -> Result<Block, MutationError> {
        let schema = self.registry.schema();
        let columns: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        self.select(&columns)
    }

    pub fn mutations(&self) -> Vec<MutationStatus> {
        self.mutations
            .lock()
            .values()
            .map(|e| e.status.clone())
            .collect()
    }

    /// Stops a mutation that has not finished. Parts already rewritten stay rewritten.
    /// Renames and drops cannot be killed: parts inserted meanwhile already use the new
    /// layout.
    pub fn kill_mutation(&self, version: u64) -> Result<(), MutationError> {
        let mut log = self.mutations.lock();
        let entry = log.get_mut(&version).ok_or_else(|| {
            MutationError::not_found(ResourceType::Mutation, version.to_string())
        })?;
        if !entry.status.is_done && entry.status.commands.changes_schema() {
            return Err(MutationError::UnsupportedOperation(format!(
                "mutation {version} of {} changes the schema and cannot be killed",
                self.registry.table()
            )));
        }
        if !entry.status.is_done {
            entry.status.is_killed = true;
            info!(table = %self.registry.table(), version, "mutation killed");
        }
        Ok(())
    }

    /// Applies every queued mutation in version order. Returns the number of parts rewritten.
    pub fn run_pending_mutations(&self, query_id: &str) -> Result<usize, MutationError> {
        self.check_writable()?;
        let lock = self.lock.lock_for_share(
            query_id,
            MutationSettings::default().lock_acquire_timeout(),
        )?;
        self.run_mutations_up_to(u64::MAX, &lock)
    }

    /// Deletes outdated parts no reader holds any more.
    pub fn clear_old_parts(&self) -> usize {
        self.registry.clear_old_parts()
    }

    fn run_mutations_up_to(
        &self,
        version: u64,
        lock: &TableLockHolder,
    ) -> Result<usize, MutationError> {
        let _runner = self.runner.lock();
        let pending: Vec<u64> = self
            .mutations
            .lock()
            .iter()
            .filter(|(v, e)| **v <= version && !e.status.is_done && !e.status.is_killed)
            .map(|(v, _)| *v)
            .collect();
        let mut total = 0;
        for v in pending {
            total += self.apply_mutation(v, lock)?;
        }
        Ok(total)
    }

    fn apply_mutation(&self, version: u64, lock: &TableLockHolder) -> Result<usize, MutationError> {
        let (commands, settings, txn) = {
            let log = self.mutations.lock();
            let Some(entry) = log.get(&version) else {
                return Ok(0);
            };
            (
                entry.status.commands.clone(),
                entry.settings.clone(),
                entry.txn.clone(),
            )
        };
        let _gate = commands.changes_schema().then(|| self.schema_gate.write());
        let schema = self.registry.schema();
        let mut mutated = 0;
        for part in self.parts_to_mutate(&commands, version) {
            if self.is_killed(version) {
                return Ok(mutated);
            }
            match self.mutate_part(&part, version, &commands, &schema, lock, &settings, txn.clone()) {
                Ok(new_part) => {
                    mutated += 1;
                    let mut log = self.mutations.lock();
                    if let Some(entry) = log.get_mut(&version) {
                        let done = part.name_string();
                        entry.status.parts_to_do.retain(|p| p != &done);
                        entry.status.latest_failed_part = None;
                        entry.status.latest_fail_reason = None;
                    }
                    drop(log);
                    debug!(version, part = %new_part.name(), "part mutated");
                }
                Err(e) => {
                    warn!(
                        table = %self.registry.table(),
                        version,
                        part = %part.name(),
                        error = %e,
                        "mutation of part failed"
                    );
                    if let Some(entry) = self.mutations.lock().get_mut(&version) {
                        entry.status.latest_failed_part = Some(part.name_string());
                        entry.status.latest_fail_reason = Some(e.to_string());
                    }
                    return Err(e);
                }
            }
        }
        let resulting = if commands.changes_schema() {
            Some(commands.resulting_schema(&schema)?)
        } else {
            None
        };
        let mut log = self.mutations.lock();
        if let Some(resulting) = resulting {
            self.registry.set_schema(resulting);
        }
        if let Some(entry) = log.get_mut(&version) {
            entry.status.is_done = true;
            entry.status.parts_to_do.clear();
        }
        drop(log);
        info!(table = %self.registry.table(), version, parts = mutated, "mutation done");
        Ok(mutated)
    }

    fn is_killed(&self, version: u64) -> bool {
        self.mutations
            .lock()
            .get(&version)
            .is_some_and(|e| e.status.is_killed)
    }

    /// Active parts older than `version` that at least one command applies to.
    fn parts_to_mutate(&self, commands: &MutationCommands, version: u64) -> Vec<Arc<DataPart>> {
        self.registry
            .active_parts()
            .into_iter()
            .filter(|p| p.name().data_version() < version)
            .filter(|p| !commands.for_partition(p.partition_id()).is_empty())
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn mutate_part(
        &self,
        part: &Arc<DataPart>,
        version: u64,
        commands: &MutationCommands,
        schema: &Arc<TableSchema>,
        lock: &TableLockHolder,
        settings: &MutationSettings,
        txn: Option<Arc<TransactionHandle>>,
    ) -> Result<Arc<DataPart>, MutationError> {
        let reservation = part
            .disk()
            .reserve(part.bytes_on_disk(), self.settings.reservation_timeout())?;
        let future_part = FutureMutatedPart::new(Arc::clone(part), version);
        let merge_entry = self.merge_list.insert_mutation(
            self.registry.table(),
            part.partition_id(),
            &part.name_string(),
            &future_part.name.to_string(),
        );
        let task = MutateTask::new(MutateTaskArgs {
            future_part,
            metadata: Arc::clone(schema),
            commands: commands.clone(),
            merge_entry,
            time_of_mutation: SystemTime::now(),
            settings: settings.clone(),
            reservation,
            table_lock: lock,
            txn,
            storage: self,
            blocker: &self.blocker,
            need_prefix: true,
        })?;
        execute_here(task)
    }
}

/// Renames and drops from mutations not yet applied, in version order.
fn apply_queued_schema_changes(
    log: &BTreeMap<u64, MutationEntry>,
    layout: &mut Vec<(ColumnDef, Vec<Value>)>,
) {
    let queued = log
        .values()
        .filter(|e| !e.status.is_done && !e.status.is_killed)
        .flat_map(|e| &e.status.commands);
    for command in queued {
        match command {
            MutationCommand::RenameColumn { from, to } => {
                if let Some((def, _)) = layout.iter_mut().find(|(d, _)| &d.name == from) {
                    def.name = to.clone();
                }
            }
            MutationCommand::DropColumn { column } => layout.retain(|(d, _)| &d.name != column),
            _ => {}
        }
    }
}

impl Storage for PartTable {
    fn engine_name(&self) -> &'static str {
        "PartTable"
    }

    fn metadata(&self) -> Arc<TableSchema> {
        self.registry.schema()
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            delete: self.settings.allow_full_delete,
            lightweight_delete: self.settings.allow_lightweight_delete,
            truncate_under_share_lock: true,
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
        if lock.table() != self.registry.table() {
            return Err(MutationError::Logical(format!(
                "lock of {} used to mutate {}",
                lock.table(),
                self.registry.table()
            )));
        }
        ctx.settings.validate()?;
        commands.validate(&self.registry.schema())?;

        let mut log = self.mutations.lock();
        let version = self.registry.allocate_block();
        let parts_to_do = self
            .parts_to_mutate(&commands, version)
            .iter()
            .map(|p| p.name_string())
            .collect();
        info!(
            table = %self.registry.table(),
            query_id = %ctx.query_id,
            version,
            commands = commands.len(),
            "mutation submitted"
        );
        log.insert(
            version,
            MutationEntry {
                status: MutationStatus {
                    version,
                    query_id: ctx.query_id.clone(),
                    commands,
                    create_time_secs: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                    parts_to_do,
                    is_done: false,
                    is_killed: false,
                    latest_failed_part: None,
                    latest_fail_reason: None,
                },
                settings: ctx.settings.clone(),
                txn: ctx.txn.clone(),
            },
        );
        drop(log);

        if !ctx.settings.mutations_are_sync() {
            return Ok(MutationSubmission {
                version,
                parts_mutated: 0,
                is_done: false,
            });
        }
        let parts_mutated = self.run_mutations_up_to(version, lock)?;
        Ok(MutationSubmission {
            version,
            parts_mutated,
            is_done: true,
        })
    }

    fn truncate(&self, ctx: &QueryContext, lock: TruncateLock<'_>) -> Result<(), MutationError> {
        self.check_writable()?;
        // Running mutations observe the block and abort instead of publishing.
        let _blocked = self.blocker.cancel();
        let removed = self.registry.truncate();
        for entry in self.mutations.lock().values_mut() {
            if !entry.status.is_done {
                entry.status.is_done = true;
                entry.status.parts_to_do.clear();
            }
        }
        let cleared = self.registry.clear_old_parts();
        info!(
            table = %self.registry.table(),
            query_id = %ctx.query_id,
            lock_query_id = lock.query_id(),
            exclusive = lock.is_exclusive(),
            parts = removed,
            cleared,
            "table truncated"
        );
        Ok(())
    }

    fn total_bytes(&self) -> u64 {
        self.registry.total_bytes()
    }

    fn drop_table(&self) {
        self.dropped.store(true, Ordering::Release);
        self.blocker.cancel_forever();
        info!(table = %self.registry.table(), "table dropped");
    }
}
