use parking_lot::Mutex;
use partmut::access::{AccessType, CallerContext, Permission};
use partmut::catalog::{Catalog, DdlReplicator, ReplicatedDdlHandle};
use partmut::config::{MutationSettings, ProjectionMode, ServerSettings, TableSettings};
use partmut::error::MutationError;
use partmut::expr::Expr;
use partmut::merge_list::MergeList;
use partmut::reservation::{Disk, Volume};
use partmut::router::{DeleteStatement, DeleteStrategy, MutationRouter, QueryResultHandle};
use partmut::storage::{PartTable, QueryContext, Storage};
use partmut::types::{Block, ColumnDef, ColumnType, TableSchema, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn people_schema(table: &str) -> TableSchema {
    TableSchema::new("db", table)
        .column(ColumnDef::new("id", ColumnType::Integer))
        .column(ColumnDef::new("age", ColumnType::Integer))
        .order_by(&["id"])
}

fn people() -> Block {
    Block::from_rows(
        &["id", "age"],
        [(1, 25), (2, 31), (3, 18), (4, 44)]
            .iter()
            .map(|(id, age)| vec![Value::Integer(*id), Value::Integer(*age)])
            .collect(),
    )
    .expect("block")
}

fn open(root: &Path, schema: TableSchema, settings: TableSettings) -> Arc<PartTable> {
    let table = PartTable::open(
        schema,
        &Volume::single(Disk::new("d", root, u64::MAX)),
        settings,
        MergeList::new(),
    )
    .expect("open");
    table.insert("seed", &people()).expect("insert");
    Arc::new(table)
}

fn router_with(tables: Vec<Arc<PartTable>>) -> MutationRouter {
    let catalog = Arc::new(Catalog::new());
    catalog.create_database("db").expect("db");
    for table in tables {
        catalog.attach_table(table).expect("attach");
    }
    MutationRouter::new(catalog, ServerSettings::default())
}

fn admin(query_id: &str) -> QueryContext {
    QueryContext::new(query_id, CallerContext::admin("alice"))
}

#[test]
fn delete_of_every_row_truncates_without_a_mutation() {
    let dir = tempdir().expect("temp");
    let table = open(dir.path(), people_schema("t"), TableSettings::default());
    let router = router_with(vec![Arc::clone(&table)]);
    let stmt = DeleteStatement::new("db", "t", Expr::lit(1));
    let ctx = admin("q1");

    let first = router.classify(&stmt, &ctx).expect("classify");
    assert_eq!(first, router.classify(&stmt, &ctx).expect("classify again"));
    assert_eq!(
        first,
        DeleteStrategy::Truncate {
            exclusive_lock: false
        }
    );

    let handle = router.execute_delete(&stmt, &ctx).expect("delete");
    assert_eq!(handle, QueryResultHandle::Truncated);
    assert!(table.mutations().is_empty());
    assert!(table.active_parts().is_empty());
    assert_eq!(table.select_all().expect("select").rows(), 0);
    assert_eq!(table.total_bytes(), 0);
}

#[test]
fn disabled_lightweight_delete_is_rejected_before_any_mutation() {
    let dir = tempdir().expect("temp");
    let table = open(dir.path(), people_schema("t"), TableSettings::lightweight_only());
    let router = router_with(vec![Arc::clone(&table)]);
    let stmt = DeleteStatement::new("db", "t", Expr::col("age").lt(Expr::lit(30)));
    let ctx = admin("q1").with_settings(MutationSettings {
        enable_lightweight_delete: false,
        ..MutationSettings::default()
    });

    let err = router.execute_delete(&stmt, &ctx).expect_err("disabled");
    assert!(matches!(err, MutationError::UnsupportedOperation(_)));
    assert!(format!("{err}").contains("enable_lightweight_delete"));
    assert!(table.mutations().is_empty());
    assert!(table.merge_list().is_empty());
    assert_eq!(table.select_all().expect("select").rows(), 4);
}

#[test]
fn lightweight_delete_hides_rows_and_reuses_other_columns() {
    let dir = tempdir().expect("temp");
    let table = open(dir.path(), people_schema("t"), TableSettings::lightweight_only());
    let source = table.active_parts()[0].clone();
    let router = router_with(vec![Arc::clone(&table)]);
    let stmt = DeleteStatement::new("db", "t", Expr::col("age").lt(Expr::lit(30)));

    let handle = router.execute_delete(&stmt, &admin("q1")).expect("delete");
    let QueryResultHandle::Mutation {
        submission,
        lightweight,
    } = handle
    else {
        panic!("expected a mutation handle");
    };
    assert!(lightweight);
    assert!(submission.is_done);
    assert_eq!(submission.parts_mutated, 1);

    let block = table.select(&["id"]).expect("select");
    assert_eq!(
        block.column("id"),
        Some(&[Value::Integer(2), Value::Integer(4)][..])
    );
    let part = table.active_parts()[0].clone();
    assert!(part.has_lightweight_deletes());
    assert_eq!(part.rows(), 4);
    assert_eq!(part.checksum("id.col"), source.checksum("id.col"));
    assert_eq!(part.checksum("age.col"), source.checksum("age.col"));
}

#[test]
fn queued_full_delete_runs_with_pending_mutations() {
    let dir = tempdir().expect("temp");
    let table = open(dir.path(), people_schema("t"), TableSettings::default());
    let router = router_with(vec![Arc::clone(&table)]);

    let stmt = DeleteStatement::new("db", "t", Expr::col("age").gt(Expr::lit(40)));
    assert_eq!(
        router.classify(&stmt, &admin("q1")).expect("classify"),
        DeleteStrategy::FullMutation
    );
    let handle = router.execute_delete(&stmt, &admin("q1")).expect("delete");
    let QueryResultHandle::Mutation { submission, .. } = handle else {
        panic!("expected a mutation handle");
    };
    assert!(!submission.is_done);
    assert_eq!(table.select_all().expect("select").rows(), 4);
    assert_eq!(table.run_pending_mutations("bg").expect("run"), 1);
    assert_eq!(table.select_all().expect("select").rows(), 3);
    assert!(!table.active_parts()[0].has_lightweight_deletes());
}

#[test]
fn projections_block_lightweight_delete_unless_dropped() {
    let dir = tempdir().expect("temp");
    let throwing = open(
        &dir.path().join("a"),
        people_schema("throwing").projection("by_age", &["age"]),
        TableSettings::lightweight_only(),
    );
    let dropping = open(
        &dir.path().join("b"),
        people_schema("dropping").projection("by_age", &["age"]),
        TableSettings {
            lightweight_mutation_projection_mode: ProjectionMode::Drop,
            ..TableSettings::lightweight_only()
        },
    );
    let router = router_with(vec![throwing, dropping]);
    let predicate = Expr::col("age").lt(Expr::lit(30));

    let err = router
        .classify(&DeleteStatement::new("db", "throwing", predicate.clone()), &admin("q"))
        .expect_err("projections");
    assert!(matches!(err, MutationError::UnsupportedWithProjections { .. }));
    assert_eq!(
        router
            .classify(&DeleteStatement::new("db", "dropping", predicate), &admin("q"))
            .expect("classify"),
        DeleteStrategy::LightweightDelete
    );
}

#[test]
fn partition_scoped_delete_of_every_row_is_a_mutation() {
    let dir = tempdir().expect("temp");
    let schema = TableSchema::new("db", "events")
        .column(ColumnDef::new("day", ColumnType::Integer))
        .column(ColumnDef::new("v", ColumnType::Integer))
        .partition_by("day");
    let table = Arc::new(
        PartTable::open(
            schema,
            &Volume::single(Disk::new("d", dir.path(), u64::MAX)),
            TableSettings::default(),
            MergeList::new(),
        )
        .expect("open"),
    );
    let rows = Block::from_rows(
        &["day", "v"],
        vec![
            vec![Value::Integer(1), Value::Integer(10)],
            vec![Value::Integer(2), Value::Integer(20)],
        ],
    )
    .expect("block");
    table.insert("seed", &rows).expect("insert");
    let router = router_with(vec![Arc::clone(&table)]);

    let stmt = DeleteStatement::new("db", "events", Expr::lit(true)).in_partition("1");
    let ctx = admin("q").with_settings(MutationSettings::synchronous());
    assert_eq!(
        router.classify(&stmt, &ctx).expect("classify"),
        DeleteStrategy::FullMutation
    );
    router.execute_delete(&stmt, &ctx).expect("delete");
    let left = table.select(&["day"]).expect("select");
    assert_eq!(left.column("day"), Some(&[Value::Integer(2)][..]));
}

#[test]
fn truncate_requires_its_own_grant_and_respects_the_size_guard() {
    let dir = tempdir().expect("temp");
    let table = open(dir.path(), people_schema("t"), TableSettings::default());
    let router = router_with(vec![Arc::clone(&table)]);
    let stmt = DeleteStatement::new("db", "t", Expr::lit(1));

    let writer = QueryContext::new(
        "q1",
        CallerContext::new("writer").with_permission(Permission::table(
            "db",
            "t",
            AccessType::AlterDelete,
        )),
    );
    assert!(matches!(
        router.execute_delete(&stmt, &writer),
        Err(MutationError::PermissionDenied(_))
    ));

    let guarded = admin("q2").with_settings(MutationSettings {
        max_table_size_to_drop: 1,
        ..MutationSettings::default()
    });
    assert!(matches!(
        router.execute_delete(&stmt, &guarded),
        Err(MutationError::Prohibited(_))
    ));
    assert_eq!(table.select_all().expect("select").rows(), 4);
}

#[test]
fn read_only_table_rejects_delete() {
    let dir = tempdir().expect("temp");
    let table = Arc::new(
        PartTable::open(
            people_schema("t"),
            &Volume::single(Disk::new("d", dir.path(), u64::MAX)),
            TableSettings {
                read_only: true,
                ..TableSettings::default()
            },
            MergeList::new(),
        )
        .expect("open"),
    );
    let router = router_with(vec![table]);
    let stmt = DeleteStatement::new("db", "t", Expr::col("id").eq(Expr::lit(1)));
    assert!(matches!(
        router.execute_delete(&stmt, &admin("q")),
        Err(MutationError::ReadOnly { .. })
    ));
}

#[derive(Debug, Default)]
struct RecordingReplicator {
    statements: Mutex<Vec<DeleteStatement>>,
}

impl DdlReplicator for RecordingReplicator {
    fn enqueue_delete(
        &self,
        statement: &DeleteStatement,
        _ctx: &QueryContext,
    ) -> Result<ReplicatedDdlHandle, MutationError> {
        let mut statements = self.statements.lock();
        statements.push(statement.clone());
        Ok(ReplicatedDdlHandle {
            database: statement.database.clone(),
            entry_id: format!("query-{:010}", statements.len()),
        })
    }
}

#[test]
fn replicated_database_forwards_unless_internal() {
    let dir = tempdir().expect("temp");
    let table = open(dir.path(), people_schema("t"), TableSettings::default());
    let replicator = Arc::new(RecordingReplicator::default());
    let catalog = Arc::new(Catalog::new());
    catalog
        .create_replicated_database("db", Arc::clone(&replicator) as Arc<dyn DdlReplicator>)
        .expect("db");
    catalog.attach_table(Arc::clone(&table) as Arc<dyn Storage>).expect("attach");
    let router = MutationRouter::new(catalog, ServerSettings::default());
    let stmt = DeleteStatement::new("db", "t", Expr::col("age").lt(Expr::lit(30)))
        .on_cluster("main");

    let handle = router.execute_delete(&stmt, &admin("q1")).expect("forward");
    assert_eq!(
        handle,
        QueryResultHandle::Forwarded(ReplicatedDdlHandle {
            database: "db".into(),
            entry_id: "query-0000000001".into(),
        })
    );
    assert_eq!(replicator.statements.lock().len(), 1);
    assert!(table.mutations().is_empty());

    let internal = QueryContext::new("q2", CallerContext::system_internal())
        .with_settings(MutationSettings::synchronous());
    assert_eq!(
        router.classify(&stmt, &internal).expect("classify"),
        DeleteStrategy::FullMutation
    );
    router.execute_delete(&stmt, &internal).expect("local delete");
    assert_eq!(table.select_all().expect("select").rows(), 2);
    assert_eq!(replicator.statements.lock().len(), 1);
}
