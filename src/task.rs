use crate::blocker::ActionBlocker;
use crate::commands::{MutationCommand, MutationCommands};
use crate::config::MutationSettings;
use crate::error::MutationError;
use crate::expr::Expr;
use crate::hardlinks::{HardlinkTracker, HardlinkedFiles};
use crate::lock::TableLockHolder;
use crate::merge_list::MergeListEntry;
use crate::part::{
    ColumnReader, DataPart, FORMAT_VERSION, META_FILE, MUTATION_TEMP_PREFIX, PartColumn,
    PartName, TemporaryPart,
};
use crate::registry::PartClaim;
use crate::reservation::Reservation;
use crate::storage::PartTable;
use crate::types::{Block, ColumnType, ROW_EXISTS_COLUMN, TableSchema, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Planned output of one mutation of one part.
#[derive(Debug, Clone)]
pub struct FutureMutatedPart {
    pub source: Arc<DataPart>,
    pub name: PartName,
    pub format_version: u32,
}

impl FutureMutatedPart {
    pub fn new(source: Arc<DataPart>, mutation_version: u64) -> Self {
        let name = source.name().with_mutation(mutation_version);
        Self {
            source,
            name,
            format_version: FORMAT_VERSION,
        }
    }
}

/// Transaction the mutation runs in. Rolling it back cancels the task at its next step.
#[derive(Debug)]
pub struct TransactionHandle {
    tid: u64,
    query_id: String,
    rolled_back: AtomicBool,
}

impl TransactionHandle {
    pub fn new(tid: u64, query_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            tid,
            query_id: query_id.into(),
            rolled_back: AtomicBool::new(false),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn rollback(&self) {
        self.rolled_back.store(true, Ordering::Release);
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::Acquire)
    }
}

/// Cancels a task from any thread; the task notices at its next step boundary.
#[derive(Debug, Clone, Default)]
pub struct TaskCanceller {
    flag: Arc<AtomicBool>,
}

impl TaskCanceller {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

type PartResult = Result<Arc<DataPart>, MutationError>;

/// Consume-once handle to the task's result.
#[derive(Debug)]
pub struct MutationFuture {
    rx: oneshot::Receiver<PartResult>,
}

impl MutationFuture {
    /// Returns the result if the task has resolved, without waiting.
    pub fn try_take(&mut self) -> Option<PartResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped_task())),
        }
    }
}

impl Future for MutationFuture {
    type Output = PartResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(dropped_task())))
    }
}

fn dropped_task() -> MutationError {
    MutationError::Cancelled("mutate task dropped before completion".into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NeedPrepare,
    NeedExecute,
    Finished,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Everything a [`MutateTask`] is built from.
pub struct MutateTaskArgs<'a> {
    pub future_part: FutureMutatedPart,
    pub metadata: Arc<TableSchema>,
    pub commands: MutationCommands,
    pub merge_entry: MergeListEntry,
    pub time_of_mutation: SystemTime,
    pub settings: MutationSettings,
    pub reservation: Reservation,
    pub table_lock: &'a TableLockHolder,
    pub txn: Option<Arc<TransactionHandle>>,
    pub storage: &'a PartTable,
    pub blocker: &'a ActionBlocker,
    /// False when resuming: the directory carries the final name from the start.
    pub need_prefix: bool,
}

/// Compiled form of one command, resolved against the part's columns.
#[derive(Debug, Clone)]
enum Step {
    /// Removes rows matching the predicate.
    Filter(Expr),
    Assign {
        column: String,
        col_type: ColumnType,
        nullable: bool,
        predicate: Option<Expr>,
        value: Expr,
        fill: Value,
    },
    Drop(String),
    Rename { from: String, to: String },
}

#[derive(Debug, Clone)]
struct PlannedColumn {
    name: String,
    col_type: ColumnType,
    nullable: bool,
    /// Source column holding the same bytes, while nothing rewrote it.
    unchanged_from: Option<String>,
    /// Source column whose values seed this column when rewritten.
    seeded_from: Option<String>,
}

#[derive(Debug)]
struct Plan {
    steps: Vec<Step>,
    columns: Vec<PlannedColumn>,
    read: BTreeSet<String>,
}

#[derive(Debug)]
struct ExecuteContext {
    part: TemporaryPart,
    plan: Plan,
    readers: BTreeMap<String, ColumnReader>,
    rewritten: Vec<String>,
    rows_done: u64,
    rows_total: u64,
    bytes_read: u64,
}

/// Rewrites one source part into a new part by applying an ordered command list.
///
/// Driven by repeated calls to [`MutateTask::execute`]; the first call prepares, later calls
/// each process at most `rows_per_step` rows, and the last one publishes the part and
/// resolves the future. The task borrows the table lock, so it cannot outlive it.
#[derive(Debug)]
pub struct MutateTask<'a> {
    state: TaskState,
    future_part: FutureMutatedPart,
    metadata: Arc<TableSchema>,
    commands: MutationCommands,
    merge_entry: MergeListEntry,
    time_of_mutation: SystemTime,
    settings: MutationSettings,
    reservation: Option<Reservation>,
    table_lock: &'a TableLockHolder,
    txn: Option<Arc<TransactionHandle>>,
    storage: &'a PartTable,
    blocker: &'a ActionBlocker,
    need_prefix: bool,
    canceller: TaskCanceller,
    hardlinks: HardlinkTracker,
    ctx: Option<ExecuteContext>,
    claim: Option<PartClaim>,
    promise: Option<oneshot::Sender<PartResult>>,
    future: Option<MutationFuture>,
    started_at: Instant,
}

impl<'a> MutateTask<'a> {
    /// Claims the source part. A part already claimed by another task is a `Conflict`.
    pub fn new(args: MutateTaskArgs<'a>) -> Result<Self, MutationError> {
        args.settings.validate()?;
        let claim = args
            .storage
            .registry()
            .claim(&args.future_part.source.name_string())?;
        let (tx, rx) = oneshot::channel();
        Ok(Self {
            state: TaskState::NeedPrepare,
            future_part: args.future_part,
            metadata: args.metadata,
            commands: args.commands,
            merge_entry: args.merge_entry,
            time_of_mutation: args.time_of_mutation,
            settings: args.settings,
            reservation: Some(args.reservation),
            table_lock: args.table_lock,
            txn: args.txn,
            storage: args.storage,
            blocker: args.blocker,
            need_prefix: args.need_prefix,
            canceller: TaskCanceller::default(),
            hardlinks: HardlinkTracker::new(),
            ctx: None,
            claim: Some(claim),
            promise: Some(tx),
            future: Some(MutationFuture { rx }),
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn future_part(&self) -> &FutureMutatedPart {
        &self.future_part
    }

    pub fn canceller(&self) -> TaskCanceller {
        self.canceller.clone()
    }

    /// The result handle. Can be taken once.
    pub fn get_future(&mut self) -> Result<MutationFuture, MutationError> {
        self.future.take().ok_or_else(|| {
            MutationError::Logical(format!(
                "result future of mutation to {} already taken",
                self.future_part.name
            ))
        })
    }

    /// Files reused from the source part versus rewritten. Available after prepare.
    pub fn hardlinked_files(&self) -> Result<HardlinkedFiles, MutationError> {
        if self.state == TaskState::NeedPrepare {
            return Err(MutationError::Logical(
                "hardlinked files are known only after prepare".into(),
            ));
        }
        Ok(self.hardlinks.snapshot())
    }

    /// Runs one step. Returns true while more work remains.
    pub fn execute(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if let Some(reason) = self.cancel_reason() {
            self.abort(MutationError::Cancelled(reason));
            return false;
        }
        let outcome = match self.state {
            TaskState::NeedPrepare => self.prepare().map(|()| {
                self.state = TaskState::NeedExecute;
                true
            }),
            TaskState::NeedExecute => self.step(),
            _ => Ok(false),
        };
        match outcome {
            Ok(more) => more,
            Err(e) => {
                self.abort(e);
                false
            }
        }
    }

    fn cancel_reason(&self) -> Option<String> {
        if self.canceller.is_cancelled() {
            return Some("mutation cancelled".into());
        }
        if self.storage.is_dropped() {
            return Some(format!("table {} was dropped", self.metadata.full_name()));
        }
        if self
            .blocker
            .is_cancelled_for_partition(self.future_part.source.partition_id())
        {
            return Some("merges and mutations are blocked".into());
        }
        if self.txn.as_ref().is_some_and(|t| t.is_rolled_back()) {
            return Some("transaction rolled back".into());
        }
        None
    }

    fn prepare(&mut self) -> Result<(), MutationError> {
        let source = Arc::clone(&self.future_part.source);
        let registry = self.storage.registry();
        if !registry.is_active(source.name()) {
            return Err(MutationError::Cancelled(format!(
                "source part {} is no longer active",
                source.name()
            )));
        }
        if registry.is_active(&self.future_part.name) {
            return Err(MutationError::Conflict(format!(
                "part {} is already active",
                self.future_part.name
            )));
        }
        let commands = self.commands.for_partition(source.partition_id());
        info!(
            table = %self.metadata.full_name(),
            query_id = self.table_lock.query_id(),
            source = %source.name(),
            result = %self.future_part.name,
            commands = commands.len(),
            "mutating part"
        );
        let plan = compile(&commands, source.columns(), &self.metadata)?;

        let prefix = self.need_prefix.then_some(MUTATION_TEMP_PREFIX);
        let mut part = TemporaryPart::create(
            source.disk(),
            &registry.table_dir(source.disk()),
            self.future_part.name.clone(),
            prefix,
        )?;
        part.set_created_by_tid(self.txn.as_ref().map(|t| t.tid()));
        part.set_modification_time(self.time_of_mutation);

        let mut rewritten = Vec::new();
        for column in &plan.columns {
            let target = PartColumn {
                name: column.name.clone(),
                col_type: column.col_type,
                nullable: column.nullable,
            };
            match &column.unchanged_from {
                Some(from) => {
                    let file = part.hardlink_column(&source, from, target)?;
                    self.hardlinks.mark_reused(&file);
                }
                None => {
                    let file = part.create_column(target)?;
                    self.hardlinks.mark_rewritten(&file);
                    rewritten.push(column.name.clone());
                }
            }
        }
        self.hardlinks.mark_rewritten(META_FILE);

        let mut readers = BTreeMap::new();
        if !rewritten.is_empty() {
            for column in &plan.read {
                readers.insert(column.clone(), source.column_reader(column)?);
            }
        }
        self.merge_entry.element().set_total_rows(source.rows());
        debug!(
            result = %self.future_part.name,
            reused = self.hardlinks.snapshot().reused_count(),
            rewritten = rewritten.len(),
            "mutation plan ready"
        );
        self.ctx = Some(ExecuteContext {
            part,
            plan,
            readers,
            rewritten,
            rows_done: 0,
            rows_total: source.rows(),
            bytes_read: 0,
        });
        Ok(())
    }

    fn step(&mut self) -> Result<bool, MutationError> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| MutationError::Logical("mutate task executed before prepare".into()))?;

        if ctx.rewritten.is_empty() || ctx.rows_done >= ctx.rows_total {
            if ctx.rewritten.is_empty() && ctx.rows_done < ctx.rows_total {
                // Every file is hardlinked; rows carry over unchanged.
                ctx.part.add_rows(ctx.rows_total);
                self.merge_entry
                    .element()
                    .add_read(ctx.rows_total, 0);
                ctx.rows_done = ctx.rows_total;
            }
            self.finish()?;
            return Ok(false);
        }

        let chunk = (ctx.rows_total - ctx.rows_done).min(self.settings.rows_per_step as u64);
        let mut block = Block::with_rows(chunk as usize);
        for (column, reader) in ctx.readers.iter_mut() {
            let values = reader.read_chunk(chunk as usize)?;
            if values.len() as u64 != chunk {
                return Err(MutationError::IntegrityError {
                    message: format!(
                        "column '{column}' of part {} ended early",
                        self.future_part.source.name()
                    ),
                });
            }
            block.insert_column(column.clone(), values);
        }
        let read_bytes: u64 = ctx.readers.values().map(ColumnReader::bytes_read).sum();
        let bytes_delta = read_bytes - ctx.bytes_read;
        ctx.bytes_read = read_bytes;

        for step in &ctx.plan.steps {
            apply_step(step, &mut block, &self.metadata)?;
        }

        let mut written = 0;
        for column in &ctx.rewritten {
            let values = block.column(column).ok_or_else(|| {
                MutationError::Logical(format!("mutation produced no values for '{column}'"))
            })?;
            written += ctx.part.write_column(column, values)?;
        }
        ctx.part.add_rows(block.rows() as u64);
        ctx.rows_done += chunk;
        self.merge_entry.element().add_read(chunk, bytes_delta);
        self.merge_entry
            .element()
            .add_written(block.rows() as u64, written);
        Ok(true)
    }

    fn finish(&mut self) -> Result<(), MutationError> {
        let Some(mut ctx) = self.ctx.take() else {
            return Err(MutationError::Logical("mutate task finished twice".into()));
        };
        ctx.readers.clear();
        let rows = ctx.part.rows();
        ctx.part.finalize()?;
        let published = self
            .storage
            .registry()
            .publish(ctx.part, Some(self.future_part.source.name()))
            .map_err(|e| match e {
                MutationError::NotFound { .. } => MutationError::Cancelled(format!(
                    "source part {} was removed during mutation",
                    self.future_part.source.name()
                )),
                other => other,
            })?;
        self.state = TaskState::Finished;
        self.release();
        info!(
            table = %self.metadata.full_name(),
            part = %published.name(),
            rows,
            reused_files = self.hardlinks.snapshot().reused_count(),
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "mutation finished"
        );
        if let Some(promise) = self.promise.take() {
            let _ = promise.send(Ok(published));
        }
        Ok(())
    }

    fn abort(&mut self, error: MutationError) {
        // Dropping the context removes the temporary directory.
        self.ctx = None;
        self.state = if error.is_cancelled() {
            TaskState::Cancelled
        } else {
            TaskState::Failed
        };
        self.release();
        warn!(
            table = %self.metadata.full_name(),
            source = %self.future_part.source.name(),
            result = %self.future_part.name,
            error = %error,
            "mutation aborted"
        );
        if let Some(promise) = self.promise.take() {
            let _ = promise.send(Err(error));
        }
    }

    fn release(&mut self) {
        self.reservation = None;
        self.claim = None;
    }
}

impl Drop for MutateTask<'_> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.abort(MutationError::Cancelled("mutate task dropped".into()));
        }
    }
}

/// Drives `task` to completion on the current thread and returns its result.
pub fn execute_here(mut task: MutateTask<'_>) -> Result<Arc<DataPart>, MutationError> {
    let mut future = task.get_future()?;
    while task.execute() {}
    future.try_take().unwrap_or_else(|| {
        Err(MutationError::Logical(
            "mutate task stopped without a result".into(),
        ))
    })
}

/// Applies `commands` to a block holding every column of `metadata`, in one pass.
pub(crate) fn apply_commands(
    commands: &MutationCommands,
    block: &mut Block,
    metadata: &TableSchema,
) -> Result<(), MutationError> {
    let columns: Vec<PartColumn> = metadata
        .columns
        .iter()
        .map(|c| PartColumn {
            name: c.name.clone(),
            col_type: c.col_type,
            nullable: c.nullable,
        })
        .collect();
    let plan = compile(commands, &columns, metadata)?;
    for step in &plan.steps {
        apply_step(step, block, metadata)?;
    }
    Ok(())
}

/// Resolves `commands` against the columns of the source part into a single-pass plan:
/// which output columns are hardlinked, which are rewritten and which source columns to
/// read.
fn compile(
    commands: &MutationCommands,
    source_columns: &[PartColumn],
    metadata: &TableSchema,
) -> Result<Plan, MutationError> {
    let mut columns: Vec<PlannedColumn> = source_columns
        .iter()
        .map(|c| PlannedColumn {
            name: c.name.clone(),
            col_type: c.col_type,
            nullable: c.nullable,
            unchanged_from: Some(c.name.clone()),
            seeded_from: Some(c.name.clone()),
        })
        .collect();
    let mut steps = Vec::new();
    let mut referenced: BTreeSet<String> = BTreeSet::new();

    let deletes_rows = commands
        .iter()
        .any(|c| matches!(c, MutationCommand::Delete { .. }));
    let has_lightweight_deletes = source_columns.iter().any(|c| c.name == ROW_EXISTS_COLUMN);
    if deletes_rows && has_lightweight_deletes {
        // A physical rewrite also purges rows hidden by lightweight deletes.
        referenced.insert(ROW_EXISTS_COLUMN.to_string());
        steps.push(Step::Filter(
            Expr::col(ROW_EXISTS_COLUMN).eq(Expr::lit(false)),
        ));
        steps.push(Step::Drop(ROW_EXISTS_COLUMN.to_string()));
        columns.retain(|c| c.name != ROW_EXISTS_COLUMN);
    }

    let reference = |expr: &Expr, columns: &[PlannedColumn], referenced: &mut BTreeSet<String>| {
        for name in expr.columns() {
            if let Some(c) = columns.iter().find(|c| c.name == name)
                && let Some(seed) = &c.seeded_from
            {
                referenced.insert(seed.clone());
            }
        }
    };

    for command in commands {
        match command {
            MutationCommand::Delete { predicate, .. } => {
                reference(predicate, &columns, &mut referenced);
                steps.push(Step::Filter(predicate.clone()));
            }
            MutationCommand::UpdateColumn {
                column,
                predicate,
                value,
                ..
            } => {
                if let Some(predicate) = predicate {
                    reference(predicate, &columns, &mut referenced);
                }
                reference(value, &columns, &mut referenced);
                let planned = planned_column(&mut columns, column, metadata)?;
                planned.unchanged_from = None;
                steps.push(Step::Assign {
                    column: column.clone(),
                    col_type: planned.col_type,
                    nullable: planned.nullable,
                    predicate: predicate.clone(),
                    value: value.clone(),
                    fill: fill_value(column),
                });
            }
            MutationCommand::MaterializeColumn { column } => {
                let default = metadata
                    .get(column)
                    .and_then(|d| d.default.clone())
                    .ok_or_else(|| {
                        MutationError::Validation(format!(
                            "column '{column}' has no default expression to materialize"
                        ))
                    })?;
                reference(&default, &columns, &mut referenced);
                let planned = planned_column(&mut columns, column, metadata)?;
                planned.unchanged_from = None;
                steps.push(Step::Assign {
                    column: column.clone(),
                    col_type: planned.col_type,
                    nullable: planned.nullable,
                    predicate: None,
                    value: default,
                    fill: Value::Null,
                });
            }
            MutationCommand::DropColumn { column } => {
                columns.retain(|c| &c.name != column);
                steps.push(Step::Drop(column.clone()));
            }
            MutationCommand::RenameColumn { from, to } => {
                let Some(planned) = columns.iter_mut().find(|c| &c.name == from) else {
                    return Err(metadata.unknown_column(from));
                };
                planned.name = to.clone();
                steps.push(Step::Rename {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
    }

    if deletes_rows {
        for column in &mut columns {
            column.unchanged_from = None;
        }
    }
    let mut read = referenced;
    for column in &columns {
        if column.unchanged_from.is_none()
            && let Some(seed) = &column.seeded_from
        {
            read.insert(seed.clone());
        }
    }
    Ok(Plan {
        steps,
        columns,
        read,
    })
}

/// The planned column named `name`, appended if the part does not have it yet.
fn planned_column<'c>(
    columns: &'c mut Vec<PlannedColumn>,
    name: &str,
    metadata: &TableSchema,
) -> Result<&'c mut PlannedColumn, MutationError> {
    let idx = match columns.iter().position(|c| c.name == name) {
        Some(idx) => idx,
        None => {
            let (col_type, nullable) = if name == ROW_EXISTS_COLUMN {
                (ColumnType::Boolean, false)
            } else {
                let def = metadata
                    .get(name)
                    .ok_or_else(|| metadata.unknown_column(name))?;
                (def.col_type, def.nullable)
            };
            columns.push(PlannedColumn {
                name: name.to_string(),
                col_type,
                nullable,
                unchanged_from: None,
                seeded_from: None,
            });
            columns.len() - 1
        }
    };
    Ok(&mut columns[idx])
}

/// Value a column takes in rows no command assigned, when the part lacks the column.
fn fill_value(column: &str) -> Value {
    if column == ROW_EXISTS_COLUMN {
        Value::Boolean(true)
    } else {
        Value::Null
    }
}

fn apply_step(step: &Step, block: &mut Block, metadata: &TableSchema) -> Result<(), MutationError> {
    match step {
        Step::Filter(predicate) => {
            let mut keep = Vec::with_capacity(block.rows());
            for row in 0..block.rows() {
                keep.push(!predicate.eval_predicate(block, row)?);
            }
            block.retain_rows(&keep);
        }
        Step::Assign {
            column,
            col_type,
            nullable,
            predicate,
            value,
            fill,
        } => {
            let current = block.remove_column(column);
            let mut out = Vec::with_capacity(block.rows());
            for row in 0..block.rows() {
                let matches = match predicate {
                    Some(p) => p.eval_predicate(block, row)?,
                    None => true,
                };
                if !matches {
                    out.push(
                        current
                            .as_ref()
                            .and_then(|c| c.get(row).cloned())
                            .unwrap_or_else(|| fill.clone()),
                    );
                    continue;
                }
                let computed = value.eval(block, row)?;
                let actual = computed.type_name();
                let coerced = computed.coerce_to(*col_type).ok_or_else(|| {
                    MutationError::TypeMismatch {
                        table: metadata.full_name(),
                        column: column.clone(),
                        expected: col_type.to_string(),
                        actual: actual.clone(),
                    }
                })?;
                if coerced.is_null() && !nullable {
                    return Err(MutationError::TypeMismatch {
                        table: metadata.full_name(),
                        column: column.clone(),
                        expected: col_type.to_string(),
                        actual,
                    });
                }
                out.push(coerced);
            }
            block.insert_column(column.clone(), out);
        }
        Step::Drop(column) => {
            block.remove_column(column);
        }
        Step::Rename { from, to } => {
            if let Some(values) = block.remove_column(from) {
                block.insert_column(to.clone(), values);
            }
        }
    }
    Ok(())
}
