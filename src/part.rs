use crate::error::{MutationError, ResourceType};
use crate::reservation::Disk;
use crate::types::{Block, ColumnType, ROW_EXISTS_COLUMN, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::warn;

pub const MUTATION_TEMP_PREFIX: &str = "tmp_mut_";
pub const INSERT_TEMP_PREFIX: &str = "tmp_insert_";
pub const META_FILE: &str = "meta.json";
pub const FORMAT_VERSION: u32 = 1;

pub fn column_file_name(column: &str) -> String {
    format!("{column}.col")
}

/// `<partition>_<min_block>_<max_block>_<level>[_<mutation>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartName {
    pub partition_id: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
    pub mutation: u64,
}

impl PartName {
    pub fn new(partition_id: impl Into<String>, min_block: u64, max_block: u64) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level: 0,
            mutation: 0,
        }
    }

    /// Name of the part produced by applying mutation `version` to this one.
    pub fn with_mutation(&self, version: u64) -> Self {
        Self {
            mutation: version,
            ..self.clone()
        }
    }

    /// Data version: the mutation version if mutated, otherwise the first block.
    pub fn data_version(&self) -> u64 {
        if self.mutation > 0 {
            self.mutation
        } else {
            self.min_block
        }
    }

    pub fn parse(name: &str) -> Result<Self, MutationError> {
        let bad = || MutationError::Validation(format!("invalid part name '{name}'"));
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(bad());
        }
        if fields[0].is_empty() {
            return Err(bad());
        }
        let number = |s: &str| s.parse::<u64>().map_err(|_| bad());
        let min_block = number(fields[1])?;
        let max_block = number(fields[2])?;
        let level = fields[3].parse::<u32>().map_err(|_| bad())?;
        let mutation = match fields.get(4) {
            Some(m) => number(m)?,
            None => 0,
        };
        if min_block > max_block {
            return Err(bad());
        }
        Ok(Self {
            partition_id: fields[0].to_string(),
            min_block,
            max_block,
            level,
            mutation,
        })
    }
}

impl std::fmt::Display for PartName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )?;
        if self.mutation > 0 {
            write!(f, "_{}", self.mutation)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartColumn {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub size: u64,
    pub sha256_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
    pub format_version: u32,
    pub name: PartName,
    pub rows: u64,
    pub columns: Vec<PartColumn>,
    pub checksums: BTreeMap<String, FileChecksum>,
    #[serde(default)]
    pub created_by_tid: Option<u64>,
    pub modification_time_secs: u64,
}

/// An immutable, published part. Shared through `Arc`; the directory is removed only after
/// the registry marks it outdated and the last reader drops its handle.
#[derive(Debug)]
pub struct DataPart {
    dir: PathBuf,
    disk: Arc<Disk>,
    meta: PartMeta,
}

impl DataPart {
    pub fn load(disk: &Arc<Disk>, dir: &Path) -> Result<Self, MutationError> {
        let bytes = fs::read(dir.join(META_FILE))?;
        let meta: PartMeta = serde_json::from_slice(&bytes).map_err(MutationError::decode)?;
        if meta.format_version != FORMAT_VERSION {
            return Err(MutationError::Decode(format!(
                "unsupported part format version {}",
                meta.format_version
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            disk: Arc::clone(disk),
            meta,
        })
    }

    pub(crate) fn from_parts(dir: PathBuf, disk: Arc<Disk>, meta: PartMeta) -> Self {
        Self { dir, disk, meta }
    }

    pub fn name(&self) -> &PartName {
        &self.meta.name
    }

    pub fn name_string(&self) -> String {
        self.meta.name.to_string()
    }

    pub fn partition_id(&self) -> &str {
        &self.meta.name.partition_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    pub fn meta(&self) -> &PartMeta {
        &self.meta
    }

    pub fn rows(&self) -> u64 {
        self.meta.rows
    }

    pub fn columns(&self) -> &[PartColumn] {
        &self.meta.columns
    }

    pub fn column(&self, name: &str) -> Option<&PartColumn> {
        self.meta.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn has_lightweight_deletes(&self) -> bool {
        self.has_column(ROW_EXISTS_COLUMN)
    }

    pub fn checksum(&self, file: &str) -> Option<&FileChecksum> {
        self.meta.checksums.get(file)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.meta.checksums.keys().map(String::as_str)
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.meta.checksums.values().map(|c| c.size).sum()
    }

    pub fn column_bytes(&self, column: &str) -> u64 {
        self.checksum(&column_file_name(column))
            .map_or(0, |c| c.size)
    }

    pub fn column_reader(&self, column: &str) -> Result<ColumnReader, MutationError> {
        if !self.has_column(column) {
            return Err(MutationError::not_found(
                ResourceType::Column,
                format!("{}.{column}", self.name_string()),
            ));
        }
        ColumnReader::open(&self.dir.join(column_file_name(column)))
    }

    /// Reads the requested columns in full.
    pub fn read_columns(&self, columns: &[&str]) -> Result<Block, MutationError> {
        let mut block = Block::with_rows(self.meta.rows as usize);
        for column in columns {
            let mut reader = self.column_reader(column)?;
            let values = reader.read_chunk(self.meta.rows as usize)?;
            if values.len() as u64 != self.meta.rows {
                return Err(MutationError::IntegrityError {
                    message: format!(
                        "column '{column}' of part {} has {} rows, expected {}",
                        self.name_string(),
                        values.len(),
                        self.meta.rows
                    ),
                });
            }
            block.insert_column(*column, values);
        }
        Ok(block)
    }

    /// Reads user columns and drops rows hidden by lightweight deletes.
    pub fn read_visible(&self, columns: &[&str]) -> Result<Block, MutationError> {
        let mut block = self.read_columns(columns)?;
        if self.has_lightweight_deletes() {
            let mask: Vec<bool> = self
                .column_reader(ROW_EXISTS_COLUMN)?
                .read_chunk(self.meta.rows as usize)?
                .iter()
                .map(|v| !matches!(v, Value::Boolean(false)))
                .collect();
            block.retain_rows(&mask);
        }
        Ok(block)
    }

    pub fn verify_checksums(&self) -> Result<(), MutationError> {
        for (file, expected) in &self.meta.checksums {
            let actual = checksum_file(&self.dir.join(file))?;
            if &actual != expected {
                return Err(MutationError::IntegrityError {
                    message: format!(
                        "checksum mismatch for {file} in part {}",
                        self.name_string()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Removes the part directory. Only the registry calls this, once no reader remains.
    pub(crate) fn remove_files(&self) -> Result<(), MutationError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Streaming reader over one column file (one JSON value per line).
#[derive(Debug)]
pub struct ColumnReader {
    lines: Lines<BufReader<fs::File>>,
    bytes_read: u64,
}

impl ColumnReader {
    pub fn open(path: &Path) -> Result<Self, MutationError> {
        let file = fs::File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            bytes_read: 0,
        })
    }

    /// Reads up to `max_rows` values; fewer means the column is exhausted.
    pub fn read_chunk(&mut self, max_rows: usize) -> Result<Vec<Value>, MutationError> {
        let mut out = Vec::with_capacity(max_rows.min(64 * 1024));
        while out.len() < max_rows {
            let Some(line) = self.lines.next() else {
                break;
            };
            let line = line?;
            self.bytes_read += line.len() as u64 + 1;
            out.push(serde_json::from_str(&line).map_err(MutationError::decode)?);
        }
        Ok(out)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Writes one column file while hashing it, so checksums need no second read.
#[derive(Debug)]
pub struct ColumnWriter {
    out: BufWriter<fs::File>,
    hasher: Sha256,
    size: u64,
}

impl ColumnWriter {
    fn create(path: &Path) -> Result<Self, MutationError> {
        let file = fs::File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    fn write(&mut self, values: &[Value]) -> Result<u64, MutationError> {
        let before = self.size;
        for value in values {
            let mut line = serde_json::to_vec(value).map_err(MutationError::encode)?;
            line.push(b'\n');
            self.out.write_all(&line)?;
            self.hasher.update(&line);
            self.size += line.len() as u64;
        }
        Ok(self.size - before)
    }

    fn finish(mut self) -> Result<FileChecksum, MutationError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(FileChecksum {
            size: self.size,
            sha256_hex: hex_string(&self.hasher.finalize()),
        })
    }
}

/// A part under construction. Invisible to readers; its directory is removed on drop
/// unless it was handed to the registry.
#[derive(Debug)]
pub struct TemporaryPart {
    disk: Arc<Disk>,
    table_dir: PathBuf,
    dir: PathBuf,
    name: PartName,
    columns: Vec<PartColumn>,
    writers: BTreeMap<String, ColumnWriter>,
    checksums: BTreeMap<String, FileChecksum>,
    rows: u64,
    created_by_tid: Option<u64>,
    modification_time: Option<SystemTime>,
    meta: Option<PartMeta>,
    committed: bool,
}

impl TemporaryPart {
    /// Creates the part directory. Without a prefix the directory already carries the
    /// final name; a leftover from an interrupted attempt is removed first.
    pub fn create(
        disk: &Arc<Disk>,
        table_dir: &Path,
        name: PartName,
        prefix: Option<&str>,
    ) -> Result<Self, MutationError> {
        let dir_name = match prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        };
        let dir = table_dir.join(dir_name);
        if dir.exists() {
            warn!(dir = %dir.display(), "removing leftover part directory");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            disk: Arc::clone(disk),
            table_dir: table_dir.to_path_buf(),
            dir,
            name,
            columns: Vec::new(),
            writers: BTreeMap::new(),
            checksums: BTreeMap::new(),
            rows: 0,
            created_by_tid: None,
            modification_time: None,
            meta: None,
            committed: false,
        })
    }

    pub fn name(&self) -> &PartName {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    pub fn set_created_by_tid(&mut self, tid: Option<u64>) {
        self.created_by_tid = tid;
    }

    pub fn set_modification_time(&mut self, time: SystemTime) {
        self.modification_time = Some(time);
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Adds `column` to the output by hardlinking `source_column`'s file from `source`.
    pub fn hardlink_column(
        &mut self,
        source: &DataPart,
        source_column: &str,
        column: PartColumn,
    ) -> Result<String, MutationError> {
        let source_file = column_file_name(source_column);
        let target_file = column_file_name(&column.name);
        let checksum = source.checksum(&source_file).cloned().ok_or_else(|| {
            MutationError::IntegrityError {
                message: format!(
                    "part {} has no checksum for {source_file}",
                    source.name_string()
                ),
            }
        })?;
        fs::hard_link(source.dir().join(&source_file), self.dir.join(&target_file))?;
        self.checksums.insert(target_file.clone(), checksum);
        self.columns.push(column);
        Ok(target_file)
    }

    /// Adds `column` to the output as a freshly written file.
    pub fn create_column(&mut self, column: PartColumn) -> Result<String, MutationError> {
        let file = column_file_name(&column.name);
        let writer = ColumnWriter::create(&self.dir.join(&file))?;
        self.writers.insert(column.name.clone(), writer);
        self.columns.push(column);
        Ok(file)
    }

    /// Appends values to a column created with [`TemporaryPart::create_column`].
    pub fn write_column(&mut self, column: &str, values: &[Value]) -> Result<u64, MutationError> {
        let writer = self.writers.get_mut(column).ok_or_else(|| {
            MutationError::Logical(format!("column '{column}' is not being written"))
        })?;
        writer.write(values)
    }

    pub fn add_rows(&mut self, rows: u64) {
        self.rows += rows;
    }

    pub fn written_columns(&self) -> impl Iterator<Item = &str> {
        self.writers.keys().map(String::as_str)
    }

    /// Flushes column files and writes `meta.json` atomically.
    pub fn finalize(&mut self) -> Result<PartMeta, MutationError> {
        let writers = std::mem::take(&mut self.writers);
        for (column, writer) in writers {
            self.checksums
                .insert(column_file_name(&column), writer.finish()?);
        }
        let meta = PartMeta {
            format_version: FORMAT_VERSION,
            name: self.name.clone(),
            rows: self.rows,
            columns: self.columns.clone(),
            checksums: self.checksums.clone(),
            created_by_tid: self.created_by_tid,
            modification_time_secs: self
                .modification_time
                .unwrap_or_else(SystemTime::now)
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        write_meta_atomic(&meta, &self.dir)?;
        fsync_dir(&self.dir)?;
        self.meta = Some(meta.clone());
        Ok(meta)
    }

    /// Moves the directory to its final name. After this the directory is owned by the
    /// returned part and is no longer removed on drop.
    pub(crate) fn commit(mut self) -> Result<DataPart, MutationError> {
        let Some(meta) = self.meta.take() else {
            return Err(MutationError::Logical(format!(
                "part {} published before finalize",
                self.name
            )));
        };
        let final_dir = self.table_dir.join(self.name.to_string());
        if final_dir != self.dir {
            if final_dir.exists() {
                return Err(MutationError::Conflict(format!(
                    "part directory {} already exists",
                    final_dir.display()
                )));
            }
            fs::rename(&self.dir, &final_dir)?;
            fsync_dir(&self.table_dir)?;
        }
        self.committed = true;
        Ok(DataPart::from_parts(final_dir, Arc::clone(&self.disk), meta))
    }
}

impl Drop for TemporaryPart {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.writers.clear();
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove temporary part");
            }
        }
    }
}

fn write_meta_atomic(meta: &PartMeta, dir: &Path) -> Result<(), MutationError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    let bytes = serde_json::to_vec_pretty(meta).map_err(MutationError::encode)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(META_FILE))
        .map_err(|e| MutationError::Io(e.error))?;
    Ok(())
}

pub fn checksum_file(path: &Path) -> Result<FileChecksum, MutationError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok(FileChecksum {
        size,
        sha256_hex: hex_string(&hasher.finalize()),
    })
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub(crate) fn fsync_dir(path: &Path) -> Result<(), MutationError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DataPart, PartColumn, PartName, TemporaryPart, MUTATION_TEMP_PREFIX};
    use crate::reservation::Disk;
    use crate::types::{ColumnType, Value};
    use tempfile::tempdir;

    fn int_column(name: &str) -> PartColumn {
        PartColumn {
            name: name.into(),
            col_type: ColumnType::Integer,
            nullable: false,
        }
    }

    #[test]
    fn part_name_roundtrip() {
        let name = PartName::new("2024", 3, 7).with_mutation(9);
        assert_eq!(name.to_string(), "2024_3_7_0_9");
        assert_eq!(PartName::parse("2024_3_7_0_9").expect("parse"), name);
        assert_eq!(PartName::parse("all_1_1_0").expect("parse").mutation, 0);
        assert!(PartName::parse("all_2_1_0").is_err());
        assert!(PartName::parse("garbage").is_err());
    }

    #[test]
    fn dropped_temporary_part_leaves_nothing() {
        let dir = tempdir().expect("temp");
        let disk = Disk::new("d", dir.path(), u64::MAX);
        let tmp_dir = {
            let mut part = TemporaryPart::create(
                &disk,
                dir.path(),
                PartName::new("all", 1, 1),
                Some(MUTATION_TEMP_PREFIX),
            )
            .expect("create");
            part.create_column(int_column("a")).expect("column");
            part.write_column("a", &[Value::Integer(1)]).expect("write");
            part.dir().to_path_buf()
        };
        assert!(!tmp_dir.exists());
    }

    #[test]
    fn committed_part_reloads_and_verifies() {
        let dir = tempdir().expect("temp");
        let disk = Disk::new("d", dir.path(), u64::MAX);
        let mut part = TemporaryPart::create(
            &disk,
            dir.path(),
            PartName::new("all", 1, 1),
            Some(MUTATION_TEMP_PREFIX),
        )
        .expect("create");
        part.create_column(int_column("a")).expect("column");
        part.write_column("a", &[Value::Integer(1), Value::Integer(2)])
            .expect("write");
        part.add_rows(2);
        part.finalize().expect("finalize");
        let committed = part.commit().expect("commit");
        assert_eq!(committed.dir(), dir.path().join("all_1_1_0"));

        let loaded = DataPart::load(&disk, committed.dir()).expect("load");
        assert_eq!(loaded.rows(), 2);
        loaded.verify_checksums().expect("verify");
        let block = loaded.read_columns(&["a"]).expect("read");
        assert_eq!(block.column("a"), Some(&[Value::Integer(1), Value::Integer(2)][..]));

        std::fs::write(loaded.dir().join("a.col"), b"{\"Integer\":5}\n").expect("tamper");
        assert!(loaded.verify_checksums().is_err());
    }
}
