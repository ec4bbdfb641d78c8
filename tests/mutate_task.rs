use partmut::commands::{MutationCommand, MutationCommands};
use partmut::config::{MutationSettings, TableSettings};
use partmut::error::MutationError;
use partmut::expr::Expr;
use partmut::lock::TableLockHolder;
use partmut::merge_list::MergeList;
use partmut::part::MUTATION_TEMP_PREFIX;
use partmut::reservation::{Disk, Volume};
use partmut::storage::{PartTable, Storage};
use partmut::task::{FutureMutatedPart, MutateTask, MutateTaskArgs, TaskState, TransactionHandle};
use partmut::types::{Block, ColumnDef, ColumnType, TableSchema, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

fn open_table(root: &Path) -> PartTable {
    let schema = TableSchema::new("db", "t")
        .column(ColumnDef::new("x", ColumnType::Integer))
        .column(ColumnDef::new("y", ColumnType::Integer))
        .column(ColumnDef::new("z", ColumnType::Text));
    PartTable::open(
        schema,
        &Volume::single(Disk::new("d", root, u64::MAX)),
        TableSettings::default(),
        MergeList::new(),
    )
    .expect("open")
}

fn seed(table: &PartTable, rows: i64) {
    let block = Block::from_rows(
        &["x", "y", "z"],
        (0..rows)
            .map(|i| {
                vec![
                    Value::Integer(i),
                    Value::Integer(i * 10),
                    Value::Text(format!("r{i}")),
                ]
            })
            .collect(),
    )
    .expect("block");
    table.insert("seed", &block).expect("insert");
}

fn table_dir(root: &Path) -> PathBuf {
    root.join("db").join("t")
}

fn temporary_dirs(root: &Path) -> Vec<String> {
    fs::read_dir(table_dir(root))
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("tmp_"))
        .collect()
}

fn settings(rows_per_step: usize) -> MutationSettings {
    MutationSettings {
        rows_per_step,
        ..MutationSettings::default()
    }
}

fn build_task<'a>(
    table: &'a PartTable,
    lock: &'a TableLockHolder,
    commands: MutationCommands,
    settings: MutationSettings,
    txn: Option<Arc<TransactionHandle>>,
    need_prefix: bool,
) -> Result<MutateTask<'a>, MutationError> {
    let source = table.active_parts().into_iter().next().expect("source part");
    let version = table.registry().allocate_block();
    let future_part = FutureMutatedPart::new(Arc::clone(&source), version);
    let reservation = source
        .disk()
        .reserve(source.bytes_on_disk(), Duration::from_secs(1))?;
    let merge_entry = table.merge_list().insert_mutation(
        table.registry().table(),
        source.partition_id(),
        &source.name_string(),
        &future_part.name.to_string(),
    );
    MutateTask::new(MutateTaskArgs {
        future_part,
        metadata: table.registry().schema(),
        commands,
        merge_entry,
        time_of_mutation: SystemTime::now(),
        settings,
        reservation,
        table_lock: lock,
        txn,
        storage: table,
        blocker: table.blocker(),
        need_prefix,
    })
}

fn update_and_lightweight_delete() -> MutationCommands {
    vec![
        MutationCommand::update("x", Expr::col("x").add(Expr::lit(100))),
        MutationCommand::lightweight_delete(Expr::col("y").gte(Expr::lit(50))),
    ]
    .into()
}

#[tokio::test]
async fn untouched_columns_are_hardlinked_from_the_source_part() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 10);
    let source = table.active_parts()[0].clone();
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let mut task = build_task(
        &table,
        &lock,
        update_and_lightweight_delete(),
        settings(4),
        None,
        true,
    )
    .expect("task");
    let future = task.get_future().expect("future");
    let version = task.future_part().name.mutation;
    while task.execute() {}
    assert_eq!(task.state(), TaskState::Finished);

    let files = task.hardlinked_files().expect("files");
    assert_eq!(files.is_reused("y.col"), Some(true));
    assert_eq!(files.is_reused("z.col"), Some(true));
    assert_eq!(files.is_reused("x.col"), Some(false));
    assert_eq!(files.is_reused("_row_exists.col"), Some(false));
    assert_eq!(files.is_reused("meta.json"), Some(false));
    drop(task);

    let part = future.await.expect("mutated part");
    assert_eq!(part.name().mutation, version);
    assert_eq!(table.active_parts()[0].name(), part.name());
    assert_eq!(part.rows(), 10);
    assert!(part.has_lightweight_deletes());

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        for file in ["y.col", "z.col"] {
            let old = fs::metadata(source.dir().join(file)).expect("old");
            let new = fs::metadata(part.dir().join(file)).expect("new");
            assert_eq!(old.ino(), new.ino(), "{file} should share an inode");
        }
        let old = fs::metadata(source.dir().join("x.col")).expect("old");
        let new = fs::metadata(part.dir().join("x.col")).expect("new");
        assert_ne!(old.ino(), new.ino());
    }

    drop(lock);
    let block = table.select(&["x", "y"]).expect("select");
    assert_eq!(block.rows(), 5);
    assert_eq!(
        block.column("x").expect("x").first(),
        Some(&Value::Integer(100))
    );
    assert!(temporary_dirs(dir.path()).is_empty());
    assert_eq!(table.merge_list().len(), 0);
    assert_eq!(source.disk().reserved_bytes(), 0);
}

#[test]
fn readers_see_the_source_part_until_publish() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 9);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands =
        vec![MutationCommand::update("y", Expr::lit(0))].into();
    let mut task = build_task(&table, &lock, commands, settings(2), None, true).expect("task");

    let reader_snapshot = table.active_parts();
    let mut steps = 0;
    while task.execute() {
        steps += 1;
        if task.state() == TaskState::NeedExecute {
            let parts = table.active_parts();
            assert_eq!(parts.len(), 1);
            assert_eq!(parts[0].name(), reader_snapshot[0].name());
            assert_eq!(temporary_dirs(dir.path()).len(), 1);
            assert!(temporary_dirs(dir.path())[0].starts_with(MUTATION_TEMP_PREFIX));
            let ys = table.select(&["y"]).expect("select");
            assert!(ys.column("y").expect("y").iter().any(|v| v != &Value::Integer(0)));
        }
    }
    assert!(steps >= 5, "expected several steps, got {steps}");
    assert_eq!(task.state(), TaskState::Finished);
    drop(task);

    // The old part stays readable through the snapshot until the last reader lets go.
    let old = reader_snapshot[0].read_columns(&["y"]).expect("old read");
    assert_eq!(old.column("y").expect("y")[3], Value::Integer(30));
    assert_eq!(table.clear_old_parts(), 0);
    drop(reader_snapshot);
    assert_eq!(table.clear_old_parts(), 1);

    let ys = table.select(&["y"]).expect("select");
    assert!(ys.column("y").expect("y").iter().all(|v| v == &Value::Integer(0)));
}

#[test]
fn canceller_stops_the_task_and_removes_its_directory() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 10);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands =
        vec![MutationCommand::delete(Expr::col("x").lt(Expr::lit(3)))].into();
    let mut task = build_task(&table, &lock, commands, settings(2), None, true).expect("task");
    let mut future = task.get_future().expect("future");
    let canceller = task.canceller();

    assert!(task.execute());
    assert!(task.execute());
    assert_eq!(temporary_dirs(dir.path()).len(), 1);
    canceller.cancel();
    assert!(!task.execute());
    assert_eq!(task.state(), TaskState::Cancelled);

    let err = future.try_take().expect("resolved").expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(temporary_dirs(dir.path()).is_empty());
    assert_eq!(table.active_parts()[0].name().mutation, 0);
    assert_eq!(table.select_all().expect("select").rows(), 10);
}

#[test]
fn partition_blocker_and_rollback_cancel_at_the_next_step() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 6);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");

    let commands: MutationCommands = vec![MutationCommand::update("y", Expr::lit(1))].into();
    let mut task =
        build_task(&table, &lock, commands.clone(), settings(2), None, true).expect("task");
    let mut future = task.get_future().expect("future");
    assert!(task.execute());
    let blocked = table.blocker().cancel_for_partition("all");
    assert!(!task.execute());
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(future.try_take().expect("resolved").expect_err("err").is_cancelled());
    drop(task);
    drop(blocked);

    let txn = TransactionHandle::new(7, "q-txn");
    let mut task = build_task(&table, &lock, commands, settings(2), Some(Arc::clone(&txn)), true)
        .expect("task after blocker released");
    let mut future = task.get_future().expect("future");
    assert!(task.execute());
    txn.rollback();
    assert!(!task.execute());
    let err = future.try_take().expect("resolved").expect_err("err");
    assert!(format!("{err}").contains("rolled back"));
    assert!(temporary_dirs(dir.path()).is_empty());
}

#[test]
fn dropping_the_table_cancels_a_running_mutation() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 6);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands = vec![MutationCommand::update("y", Expr::lit(1))].into();
    let mut task = build_task(&table, &lock, commands, settings(2), None, true).expect("task");
    let mut future = task.get_future().expect("future");
    assert!(task.execute());
    table.drop_table();
    assert!(!task.execute());
    let err = future.try_take().expect("resolved").expect_err("err");
    assert!(err.is_cancelled());
    assert!(format!("{err}").contains("dropped"));
    assert!(temporary_dirs(dir.path()).is_empty());
}

#[test]
fn failed_evaluation_leaves_no_trace() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 6);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands =
        vec![MutationCommand::update("y", Expr::col("y").mul(Expr::lit(i64::MAX)))].into();
    let mut task = build_task(&table, &lock, commands, settings(2), None, true).expect("task");
    let mut future = task.get_future().expect("future");
    while task.execute() {}
    assert_eq!(task.state(), TaskState::Failed);
    let err = future.try_take().expect("resolved").expect_err("overflow");
    assert!(matches!(err, MutationError::Validation(_)));
    assert!(temporary_dirs(dir.path()).is_empty());
    drop(task);
    assert_eq!(table.active_parts()[0].name().mutation, 0);
    assert_eq!(table.merge_list().len(), 0);
}

#[test]
fn type_mismatch_in_assignment_fails_the_task() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 3);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands =
        vec![MutationCommand::update("y", Expr::lit(Value::Text("nope".into())))].into();
    let task = build_task(&table, &lock, commands, settings(8), None, true).expect("task");
    let err = partmut::execute_here(task).expect_err("type mismatch");
    assert!(matches!(err, MutationError::TypeMismatch { .. }));
    assert!(temporary_dirs(dir.path()).is_empty());
}

#[test]
fn future_can_be_taken_once_and_source_claimed_once() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 3);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands = vec![MutationCommand::update("y", Expr::lit(1))].into();
    let mut task =
        build_task(&table, &lock, commands.clone(), settings(8), None, true).expect("task");
    assert!(matches!(
        task.hardlinked_files(),
        Err(MutationError::Logical(_))
    ));
    let _future = task.get_future().expect("first");
    assert!(matches!(task.get_future(), Err(MutationError::Logical(_))));

    let second = build_task(&table, &lock, commands.clone(), settings(8), None, true);
    assert!(matches!(second, Err(MutationError::Conflict(_))));

    // Dropping an unfinished task releases the claim and cancels the result.
    drop(task);
    assert!(!table.registry().is_claimed(&table.active_parts()[0].name_string()));
    let task = build_task(&table, &lock, commands, settings(8), None, true).expect("reclaim");
    partmut::execute_here(task).expect("mutate");
}

#[test]
fn zero_rows_per_step_is_rejected_before_claiming() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 3);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let source = table.active_parts()[0].clone();
    let commands: MutationCommands = vec![MutationCommand::update("y", Expr::lit(1))].into();

    let err = build_task(&table, &lock, commands, settings(0), None, true).expect_err("settings");
    assert!(matches!(err, MutationError::InvalidConfig { .. }));
    assert!(!table.registry().is_claimed(&source.name_string()));
    assert_eq!(table.merge_list().len(), 0);
    assert_eq!(source.disk().reserved_bytes(), 0);
}

#[test]
fn resumed_task_writes_under_the_final_name() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 4);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let source = table.active_parts()[0].clone();
    let leftover = table_dir(dir.path()).join(source.name().with_mutation(2).to_string());
    fs::create_dir_all(&leftover).expect("leftover");
    fs::write(leftover.join("junk.col"), b"half written").expect("junk");

    let commands: MutationCommands = vec![MutationCommand::update("y", Expr::lit(2))].into();
    let task = build_task(&table, &lock, commands, settings(8), None, false).expect("task");
    assert_eq!(task.future_part().name.mutation, 2);
    let part = partmut::execute_here(task).expect("mutate");
    assert_eq!(part.dir(), leftover.as_path());
    assert!(!leftover.join("junk.col").exists());
    assert!(temporary_dirs(dir.path()).is_empty());
}

#[test]
fn progress_is_visible_in_the_merge_list() {
    let dir = tempdir().expect("temp");
    let table = open_table(dir.path());
    seed(&table, 10);
    let lock = table
        .lock_for_share("q", Duration::from_secs(1))
        .expect("lock");
    let commands: MutationCommands = vec![MutationCommand::update("y", Expr::lit(5))].into();
    let mut task = build_task(&table, &lock, commands, settings(4), None, true).expect("task");
    assert!(task.execute());
    assert!(task.execute());
    let infos = table.merge_list().get();
    assert_eq!(infos.len(), 1);
    let info = &infos[0];
    assert!(info.is_mutation);
    assert_eq!(info.total_rows, 10);
    assert_eq!(info.rows_read, 4);
    assert_eq!(info.rows_written, 4);
    assert!(info.progress > 0.0 && info.progress < 1.0);
    while task.execute() {}
    drop(task);
    assert!(table.merge_list().is_empty());
}
