use crate::error::MutationError;
use crate::part::{DataPart, INSERT_TEMP_PREFIX, MUTATION_TEMP_PREFIX, PartName};
use crate::reservation::Disk;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartSummary {
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
    pub columns: Vec<String>,
    pub lightweight_deletes: bool,
    pub created_by_tid: Option<u64>,
    /// A newer mutation of the same block range exists in the directory.
    pub superseded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDirReport {
    pub parts: Vec<PartSummary>,
    pub temporary: Vec<String>,
    pub invalid: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: bool,
    pub parts_checked: u64,
    pub files_checked: u64,
    pub violations: Vec<String>,
}

fn offline_disk(table_dir: &Path) -> Arc<Disk> {
    Disk::new("offline", table_dir, u64::MAX)
}

/// Reads every part directory of a table without opening the table.
pub fn list_parts(table_dir: &Path) -> Result<TableDirReport, MutationError> {
    let disk = offline_disk(table_dir);
    let mut report = TableDirReport::default();
    let mut entries = fs::read_dir(table_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.file_name());

    let mut loaded: Vec<DataPart> = Vec::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(MUTATION_TEMP_PREFIX) || name.starts_with(INSERT_TEMP_PREFIX) {
            report.temporary.push(name);
            continue;
        }
        if let Err(e) = PartName::parse(&name) {
            report.invalid.push((name, e.to_string()));
            continue;
        }
        match DataPart::load(&disk, &entry.path()) {
            Ok(part) => loaded.push(part),
            Err(e) => report.invalid.push((name, e.to_string())),
        }
    }

    for part in &loaded {
        let superseded = loaded.iter().any(|other| {
            let (a, b) = (other.name(), part.name());
            a.partition_id == b.partition_id
                && a.min_block == b.min_block
                && a.max_block == b.max_block
                && a.mutation > b.mutation
        });
        report.parts.push(PartSummary {
            name: part.name_string(),
            rows: part.rows(),
            bytes: part.bytes_on_disk(),
            columns: part.columns().iter().map(|c| c.name.clone()).collect(),
            lightweight_deletes: part.has_lightweight_deletes(),
            created_by_tid: part.meta().created_by_tid,
            superseded,
        });
    }
    Ok(report)
}

/// Recomputes the checksum of every file of every committed part.
pub fn verify_parts(table_dir: &Path) -> Result<VerifyReport, MutationError> {
    let disk = offline_disk(table_dir);
    let listing = list_parts(table_dir)?;
    let mut report = VerifyReport {
        ok: true,
        ..VerifyReport::default()
    };
    for (name, reason) in &listing.invalid {
        report.violations.push(format!("{name}: {reason}"));
    }
    for summary in &listing.parts {
        let part = DataPart::load(&disk, &table_dir.join(&summary.name))?;
        report.parts_checked += 1;
        report.files_checked += part.file_names().count() as u64;
        if let Err(e) = part.verify_checksums() {
            report.violations.push(format!("{}: {e}", summary.name));
        }
    }
    report.ok = report.violations.is_empty();
    Ok(report)
}

/// Removes leftover temporary part directories. Only safe while the table is closed.
pub fn remove_temporary_parts(table_dir: &Path) -> Result<Vec<String>, MutationError> {
    let listing = list_parts(table_dir)?;
    for name in &listing.temporary {
        fs::remove_dir_all(table_dir.join(name))?;
    }
    Ok(listing.temporary)
}
