use partmut::access::CallerContext;
use partmut::commands::MutationCommand;
use partmut::config::{MutationSettings, TableSettings};
use partmut::expr::Expr;
use partmut::merge_list::MergeList;
use partmut::offline;
use partmut::reservation::{Disk, Volume};
use partmut::storage::{PartTable, QueryContext, Storage};
use partmut::types::{Block, ColumnDef, ColumnType, TableSchema, Value};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn schema() -> TableSchema {
    TableSchema::new("db", "t")
        .column(ColumnDef::new("id", ColumnType::Integer))
        .column(ColumnDef::new("name", ColumnType::Text).nullable())
}

fn open(root: &std::path::Path) -> PartTable {
    PartTable::open(
        schema(),
        &Volume::single(Disk::new("d", root, u64::MAX)),
        TableSettings::default(),
        MergeList::new(),
    )
    .expect("open")
}

#[test]
fn listing_reports_superseded_and_temporary_parts() {
    let data_dir = tempdir().expect("data");
    let table_dir = data_dir.path().join("db").join("t");
    {
        let table = open(data_dir.path());
        table
            .insert(
                "seed",
                &Block::from_rows(
                    &["id", "name"],
                    vec![
                        vec![Value::Integer(1), Value::Text("a".into())],
                        vec![Value::Integer(2), Value::Null],
                    ],
                )
                .expect("block"),
            )
            .expect("insert");
        let snapshot = table.active_parts();
        let lock = table
            .lock_for_share("q", Duration::from_secs(1))
            .expect("lock");
        let ctx = QueryContext::new("q", CallerContext::admin("ops"))
            .with_settings(MutationSettings::synchronous());
        table
            .mutate(
                vec![MutationCommand::lightweight_delete(
                    Expr::col("name").is_null(),
                )]
                .into(),
                &ctx,
                &lock,
            )
            .expect("mutate");
        drop(lock);

        let report = offline::list_parts(&table_dir).expect("list");
        assert_eq!(report.parts.len(), 2);
        let old = report
            .parts
            .iter()
            .find(|p| p.name == snapshot[0].name_string())
            .expect("old part");
        assert!(old.superseded);
        let new = report.parts.iter().find(|p| !p.superseded).expect("new part");
        assert!(new.lightweight_deletes);
        assert_eq!(new.rows, 2);
        assert!(new.columns.contains(&"_row_exists".to_string()));
    }

    // Reopening drops the superseded part left behind by the open snapshot.
    drop(open(data_dir.path()));
    let report = offline::list_parts(&table_dir).expect("list");
    assert_eq!(report.parts.len(), 1);
    assert!(report.temporary.is_empty());

    fs::create_dir_all(table_dir.join("tmp_mut_all_1_1_0_9")).expect("tmp");
    fs::create_dir_all(table_dir.join("tmp_insert_all_7_7_0")).expect("tmp");
    let report = offline::list_parts(&table_dir).expect("list");
    assert_eq!(report.temporary.len(), 2);
    let removed = offline::remove_temporary_parts(&table_dir).expect("clean");
    assert_eq!(removed.len(), 2);
    assert!(offline::list_parts(&table_dir).expect("list").temporary.is_empty());
}

#[test]
fn verify_detects_tampered_column_files() {
    let data_dir = tempdir().expect("data");
    let table_dir = data_dir.path().join("db").join("t");
    let table = open(data_dir.path());
    table
        .insert(
            "seed",
            &Block::from_rows(
                &["id", "name"],
                vec![vec![Value::Integer(1), Value::Text("a".into())]],
            )
            .expect("block"),
        )
        .expect("insert");
    let part_dir = table.active_parts()[0].dir().to_path_buf();
    drop(table);

    let report = offline::verify_parts(&table_dir).expect("verify");
    assert!(report.ok, "violations: {:?}", report.violations);
    assert_eq!(report.parts_checked, 1);
    assert_eq!(report.files_checked, 2);

    fs::write(part_dir.join("name.col"), b"{\"Text\":\"b\"}\n").expect("tamper");
    let report = offline::verify_parts(&table_dir).expect("verify");
    assert!(!report.ok);
    assert_eq!(report.violations.len(), 1);
    assert!(report.violations[0].contains("name.col"));
}
