use crate::error::{MutationError, ResourceType};
use crate::router::DeleteStatement;
use crate::storage::{QueryContext, Storage};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Receipt for a statement handed to DDL replication instead of being run locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedDdlHandle {
    pub database: String,
    pub entry_id: String,
}

/// Cluster-wide DDL queue of a replicated database.
pub trait DdlReplicator: Send + Sync + std::fmt::Debug {
    fn enqueue_delete(
        &self,
        statement: &DeleteStatement,
        ctx: &QueryContext,
    ) -> Result<ReplicatedDdlHandle, MutationError>;
}

#[derive(Debug)]
pub struct Database {
    name: String,
    replicator: Option<Arc<dyn DdlReplicator>>,
    tables: RwLock<BTreeMap<String, Arc<dyn Storage>>>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_replicated(&self) -> bool {
        self.replicator.is_some()
    }

    pub fn replicator(&self) -> Option<&Arc<dyn DdlReplicator>> {
        self.replicator.as_ref()
    }

    pub fn table(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}

/// Databases and their tables.
#[derive(Debug, Default)]
pub struct Catalog {
    databases: RwLock<BTreeMap<String, Arc<Database>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_database(&self, name: &str) -> Result<Arc<Database>, MutationError> {
        self.insert_database(name, None)
    }

    pub fn create_replicated_database(
        &self,
        name: &str,
        replicator: Arc<dyn DdlReplicator>,
    ) -> Result<Arc<Database>, MutationError> {
        self.insert_database(name, Some(replicator))
    }

    fn insert_database(
        &self,
        name: &str,
        replicator: Option<Arc<dyn DdlReplicator>>,
    ) -> Result<Arc<Database>, MutationError> {
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(MutationError::Conflict(format!(
                "database {name} already exists"
            )));
        }
        let db = Arc::new(Database {
            name: name.to_string(),
            replicator,
            tables: RwLock::new(BTreeMap::new()),
        });
        databases.insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>, MutationError> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MutationError::not_found(ResourceType::Database, name))
    }

    /// Registers `storage` under the database and table named by its metadata.
    pub fn attach_table(&self, storage: Arc<dyn Storage>) -> Result<(), MutationError> {
        let schema = storage.metadata();
        let db = self.database(&schema.database)?;
        let mut tables = db.tables.write();
        if tables.contains_key(&schema.table_name) {
            return Err(MutationError::Conflict(format!(
                "table {} already exists",
                schema.full_name()
            )));
        }
        tables.insert(schema.table_name.clone(), storage);
        Ok(())
    }

    pub fn get_table(&self, database: &str, table: &str) -> Result<Arc<dyn Storage>, MutationError> {
        self.database(database)?
            .table(table)
            .ok_or_else(|| MutationError::not_found(ResourceType::Table, format!("{database}.{table}")))
    }

    pub fn drop_table(&self, database: &str, table: &str) -> Result<(), MutationError> {
        let db = self.database(database)?;
        let storage = db.tables.write().remove(table).ok_or_else(|| {
            MutationError::not_found(ResourceType::Table, format!("{database}.{table}"))
        })?;
        storage.drop_table();
        info!(database, table, "table detached and dropped");
        Ok(())
    }
}
