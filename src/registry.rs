use crate::error::{MutationError, ResourceType};
use crate::part::{DataPart, INSERT_TEMP_PREFIX, MUTATION_TEMP_PREFIX, PartName, TemporaryPart};
use crate::reservation::{Disk, Volume};
use crate::types::TableSchema;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Active part set of one table. Readers take `Arc` snapshots; publication swaps a
/// part in and its source out under one write lock.
#[derive(Debug)]
pub struct PartRegistry {
    table: String,
    relative_path: PathBuf,
    volume: Volume,
    schema: RwLock<Arc<TableSchema>>,
    active: RwLock<BTreeMap<PartName, Arc<DataPart>>>,
    outdated: Mutex<Vec<Arc<DataPart>>>,
    claims: Mutex<HashSet<String>>,
    next_block: AtomicU64,
}

impl PartRegistry {
    /// Opens the table directory on every disk of `volume`: removes stale temporary parts,
    /// loads committed parts and drops parts already covered by a newer mutation of the same
    /// block range.
    pub fn open(
        schema: TableSchema,
        volume: &Volume,
        relative_path: &Path,
    ) -> Result<Arc<Self>, MutationError> {
        let mut loaded: BTreeMap<PartName, DataPart> = BTreeMap::new();
        for disk in volume.disks() {
            load_disk(disk, &disk.path().join(relative_path), &mut loaded)?;
        }

        let covered: Vec<PartName> = loaded
            .keys()
            .filter(|name| {
                loaded.keys().any(|other| {
                    other.partition_id == name.partition_id
                        && other.min_block == name.min_block
                        && other.max_block == name.max_block
                        && other.mutation > name.mutation
                })
            })
            .cloned()
            .collect();
        for name in covered {
            if let Some(part) = loaded.remove(&name) {
                info!(part = %name, "removing part superseded by a mutated version");
                part.remove_files()?;
            }
        }

        let next_block = loaded
            .keys()
            .map(|n| n.max_block.max(n.mutation))
            .max()
            .unwrap_or(0)
            + 1;
        let mut active = BTreeMap::new();
        for (name, part) in loaded {
            part.disk().account_part(part.bytes_on_disk());
            active.insert(name, Arc::new(part));
        }
        Ok(Arc::new(Self {
            table: schema.full_name(),
            relative_path: relative_path.to_path_buf(),
            volume: volume.clone(),
            schema: RwLock::new(Arc::new(schema)),
            active: RwLock::new(active),
            outdated: Mutex::new(Vec::new()),
            claims: Mutex::new(HashSet::new()),
            next_block: AtomicU64::new(next_block),
        }))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Directory holding this table's parts on `disk`.
    pub fn table_dir(&self, disk: &Disk) -> PathBuf {
        disk.path().join(&self.relative_path)
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema.read())
    }

    pub(crate) fn set_schema(&self, schema: TableSchema) {
        *self.schema.write() = Arc::new(schema);
    }

    /// Allocates a block number; also used as a mutation version so both share one sequence.
    pub fn allocate_block(&self) -> u64 {
        self.next_block.fetch_add(1, Ordering::SeqCst)
    }

    pub fn active_parts(&self) -> Vec<Arc<DataPart>> {
        self.active.read().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<DataPart>> {
        let name = PartName::parse(name).ok()?;
        self.active.read().get(&name).cloned()
    }

    pub fn is_active(&self, name: &PartName) -> bool {
        self.active.read().contains_key(name)
    }

    pub fn total_bytes(&self) -> u64 {
        self.active.read().values().map(|p| p.bytes_on_disk()).sum()
    }

    pub fn total_rows(&self) -> u64 {
        self.active.read().values().map(|p| p.rows()).sum()
    }

    pub fn outdated_count(&self) -> usize {
        self.outdated.lock().len()
    }

    /// Marks `source_part` as being mutated. A second claim on the same part is a conflict.
    pub fn claim(self: &Arc<Self>, source_part: &str) -> Result<PartClaim, MutationError> {
        if !self.claims.lock().insert(source_part.to_string()) {
            return Err(MutationError::Conflict(format!(
                "part {source_part} of {} is already being mutated",
                self.table
            )));
        }
        Ok(PartClaim {
            registry: Arc::clone(self),
            part: source_part.to_string(),
        })
    }

    pub fn is_claimed(&self, source_part: &str) -> bool {
        self.claims.lock().contains(source_part)
    }

    /// Makes `part` visible. With `replacing`, the named part must still be active and is
    /// moved to the outdated list in the same critical section.
    pub fn publish(
        &self,
        part: TemporaryPart,
        replacing: Option<&PartName>,
    ) -> Result<Arc<DataPart>, MutationError> {
        let mut active = self.active.write();
        if let Some(old) = replacing
            && !active.contains_key(old)
        {
            return Err(MutationError::not_found(
                ResourceType::Part,
                format!("{}.{old}", self.table),
            ));
        }
        if active.contains_key(part.name()) {
            return Err(MutationError::Conflict(format!(
                "part {} is already active in {}",
                part.name(),
                self.table
            )));
        }
        let committed = Arc::new(part.commit()?);
        committed.disk().account_part(committed.bytes_on_disk());
        active.insert(committed.name().clone(), Arc::clone(&committed));
        if let Some(old) = replacing
            && let Some(previous) = active.remove(old)
        {
            self.outdated.lock().push(previous);
        }
        drop(active);
        debug!(table = %self.table, part = %committed.name(), "published part");
        Ok(committed)
    }

    /// Moves every active part to the outdated list.
    pub fn truncate(&self) -> usize {
        let removed = std::mem::take(&mut *self.active.write());
        let count = removed.len();
        self.outdated.lock().extend(removed.into_values());
        count
    }

    /// Deletes outdated parts that no reader references any more.
    pub fn clear_old_parts(&self) -> usize {
        let mut outdated = self.outdated.lock();
        let mut kept = Vec::with_capacity(outdated.len());
        let mut removed = 0;
        for part in outdated.drain(..) {
            if Arc::strong_count(&part) > 1 {
                kept.push(part);
                continue;
            }
            if let Err(e) = part.remove_files() {
                warn!(part = %part.name(), error = %e, "failed to remove outdated part");
                kept.push(part);
                continue;
            }
            part.disk().release_part(part.bytes_on_disk());
            removed += 1;
        }
        *outdated = kept;
        removed
    }
}

fn load_disk(
    disk: &Arc<Disk>,
    dir: &Path,
    loaded: &mut BTreeMap<PartName, DataPart>,
) -> Result<(), MutationError> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(MUTATION_TEMP_PREFIX) || name.starts_with(INSERT_TEMP_PREFIX) {
            info!(dir = %entry.path().display(), "removing stale temporary part");
            fs::remove_dir_all(entry.path())?;
            continue;
        }
        let Ok(part_name) = PartName::parse(&name) else {
            warn!(dir = %entry.path().display(), "skipping unrecognized directory");
            continue;
        };
        match DataPart::load(disk, &entry.path()) {
            Ok(part) => {
                loaded.insert(part_name, part);
            }
            Err(e) => {
                warn!(dir = %entry.path().display(), error = %e, "skipping unreadable part");
            }
        }
    }
    Ok(())
}

/// Claim on a source part, released on drop.
#[derive(Debug)]
pub struct PartClaim {
    registry: Arc<PartRegistry>,
    part: String,
}

impl PartClaim {
    pub fn part(&self) -> &str {
        &self.part
    }
}

impl Drop for PartClaim {
    fn drop(&mut self) {
        self.registry.claims.lock().remove(&self.part);
    }
}
