use crate::access::AccessType;
use crate::catalog::{Catalog, Database, ReplicatedDdlHandle};
use crate::commands::{MutationCommand, MutationCommands};
use crate::config::{ProjectionMode, ServerSettings};
use crate::error::MutationError;
use crate::expr::Expr;
use crate::lock::TruncateLock;
use crate::storage::{MutationSubmission, QueryContext, Storage};
use std::sync::Arc;
use tracing::{debug, info};

/// `DELETE FROM db.table [ON CLUSTER c] [IN PARTITION p] WHERE predicate`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub database: String,
    pub table: String,
    pub predicate: Expr,
    pub partition: Option<String>,
    pub cluster: Option<String>,
}

impl DeleteStatement {
    pub fn new(database: impl Into<String>, table: impl Into<String>, predicate: Expr) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            predicate,
            partition: None,
            cluster: None,
        }
    }

    pub fn in_partition(mut self, partition_id: impl Into<String>) -> Self {
        self.partition = Some(partition_id.into());
        self
    }

    pub fn on_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// How a delete statement is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStrategy {
    /// The predicate matches every row: drop all parts at once.
    Truncate { exclusive_lock: bool },
    /// Rewrite affected parts without the matching rows.
    FullMutation,
    /// Mark matching rows in `_row_exists` and leave user columns untouched.
    LightweightDelete,
    /// Hand the statement to the replicated database's DDL queue.
    ForwardToReplicatedDdl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResultHandle {
    Truncated,
    Mutation {
        submission: MutationSubmission,
        lightweight: bool,
    },
    Forwarded(ReplicatedDdlHandle),
}

/// Entry point for delete statements: picks a strategy per table and dispatches it.
#[derive(Debug)]
pub struct MutationRouter {
    catalog: Arc<Catalog>,
    server: ServerSettings,
}

impl MutationRouter {
    pub fn new(catalog: Arc<Catalog>, server: ServerSettings) -> Self {
        Self { catalog, server }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Decides how `stmt` would run. Takes no locks and changes nothing.
    pub fn classify(
        &self,
        stmt: &DeleteStatement,
        ctx: &QueryContext,
    ) -> Result<DeleteStrategy, MutationError> {
        self.resolve(stmt, ctx).map(|(_, _, strategy)| strategy)
    }

    fn resolve(
        &self,
        stmt: &DeleteStatement,
        ctx: &QueryContext,
    ) -> Result<(Arc<Database>, Arc<dyn Storage>, DeleteStrategy), MutationError> {
        let db = self.catalog.database(&stmt.database)?;
        let storage = self.catalog.get_table(&stmt.database, &stmt.table)?;
        ctx.caller
            .check_access(AccessType::AlterDelete, &stmt.database, &stmt.table)?;
        let caps = storage.capabilities();
        if caps.read_only {
            return Err(MutationError::ReadOnly {
                table: stmt.full_name(),
            });
        }
        if self.server.disable_insertion_and_mutation {
            return Err(MutationError::Prohibited(
                "delete queries are prohibited while disable_insertion_and_mutation is set".into(),
            ));
        }
        if db.is_replicated() && !ctx.caller.is_internal_system() {
            return Ok((db, storage, DeleteStrategy::ForwardToReplicatedDdl));
        }
        stmt.predicate.validate_depth()?;

        let strategy = if (caps.delete || caps.lightweight_delete)
            && stmt.partition.is_none()
            && stmt.predicate.is_always_true()
        {
            DeleteStrategy::Truncate {
                exclusive_lock: !caps.truncate_under_share_lock,
            }
        } else if caps.delete {
            DeleteStrategy::FullMutation
        } else if caps.lightweight_delete {
            if !ctx.settings.enable_lightweight_delete {
                return Err(MutationError::UnsupportedOperation(format!(
                    "lightweight delete is disabled; set enable_lightweight_delete to delete from {}",
                    stmt.full_name()
                )));
            }
            let metadata = storage.metadata();
            if metadata.has_projections()
                && storage.table_settings().lightweight_mutation_projection_mode
                    == ProjectionMode::Throw
            {
                return Err(MutationError::UnsupportedWithProjections {
                    table: stmt.full_name(),
                });
            }
            DeleteStrategy::LightweightDelete
        } else {
            return Err(MutationError::UnsupportedOperation(format!(
                "DELETE query is not supported for table {}",
                stmt.full_name()
            )));
        };
        Ok((db, storage, strategy))
    }

    pub fn execute_delete(
        &self,
        stmt: &DeleteStatement,
        ctx: &QueryContext,
    ) -> Result<QueryResultHandle, MutationError> {
        let (db, storage, strategy) = self.resolve(stmt, ctx)?;
        debug!(table = %stmt.full_name(), query_id = %ctx.query_id, ?strategy, "delete classified");
        let timeout = ctx.settings.lock_acquire_timeout();
        match strategy {
            DeleteStrategy::ForwardToReplicatedDdl => {
                let replicator = db.replicator().ok_or_else(|| {
                    MutationError::Logical(format!("database {} has no replicator", db.name()))
                })?;
                Ok(QueryResultHandle::Forwarded(
                    replicator.enqueue_delete(stmt, ctx)?,
                ))
            }
            DeleteStrategy::Truncate { exclusive_lock } => {
                ctx.caller
                    .check_access(AccessType::Truncate, &stmt.database, &stmt.table)?;
                storage.check_table_can_be_dropped(ctx.settings.max_table_size_to_drop)?;
                info!(table = %stmt.full_name(), query_id = %ctx.query_id, "delete of every row runs as truncate");
                if exclusive_lock {
                    let lock = storage.lock_exclusively(&ctx.query_id, timeout)?;
                    storage.truncate(ctx, TruncateLock::Exclusive(&lock))?;
                } else {
                    let lock = storage.lock_for_share(&ctx.query_id, timeout)?;
                    storage.truncate(ctx, TruncateLock::Shared(&lock))?;
                }
                Ok(QueryResultHandle::Truncated)
            }
            DeleteStrategy::FullMutation => {
                let lock = storage.lock_for_share(&ctx.query_id, timeout)?;
                let mut command = MutationCommand::delete(stmt.predicate.clone());
                if let Some(partition) = &stmt.partition {
                    command = command.in_partition(partition.clone());
                }
                let commands: MutationCommands = vec![command].into();
                storage.check_mutation_is_possible(&commands)?;
                commands.validate(&storage.metadata())?;
                let submission = storage.mutate(commands, ctx, &lock)?;
                Ok(QueryResultHandle::Mutation {
                    submission,
                    lightweight: false,
                })
            }
            DeleteStrategy::LightweightDelete => {
                let lock = storage.lock_for_share(&ctx.query_id, timeout)?;
                let mut command = MutationCommand::lightweight_delete(stmt.predicate.clone());
                if let Some(partition) = &stmt.partition {
                    command = command.in_partition(partition.clone());
                }
                let commands: MutationCommands = vec![command].into();
                storage.check_mutation_is_possible(&commands)?;
                commands.validate(&storage.metadata())?;
                let mut lightweight_ctx = ctx.clone();
                lightweight_ctx.settings.mutations_sync = ctx.settings.lightweight_deletes_sync;
                info!(
                    table = %stmt.full_name(),
                    query_id = %ctx.query_id,
                    "lightweight delete runs as update of the row existence column"
                );
                let submission = storage.mutate(commands, &lightweight_ctx, &lock)?;
                Ok(QueryResultHandle::Mutation {
                    submission,
                    lightweight: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeleteStatement, DeleteStrategy, MutationRouter};
    use crate::access::{AccessType, CallerContext, Permission};
    use crate::catalog::Catalog;
    use crate::config::{ServerSettings, TableSettings};
    use crate::error::MutationError;
    use crate::expr::Expr;
    use crate::memory::MemoryTable;
    use crate::storage::QueryContext;
    use crate::types::{ColumnDef, ColumnType, TableSchema};
    use std::sync::Arc;

    fn router(server: ServerSettings) -> MutationRouter {
        let catalog = Arc::new(Catalog::new());
        catalog.create_database("db").expect("db");
        catalog
            .attach_table(Arc::new(MemoryTable::new(
                TableSchema::new("db", "m").column(ColumnDef::new("age", ColumnType::Integer)),
                TableSettings::default(),
            )))
            .expect("attach");
        MutationRouter::new(catalog, server)
    }

    fn stmt(predicate: Expr) -> DeleteStatement {
        DeleteStatement::new("db", "m", predicate)
    }

    #[test]
    fn memory_table_always_true_needs_exclusive_truncate() {
        let router = router(ServerSettings::default());
        let ctx = QueryContext::new("q", CallerContext::admin("a"));
        assert_eq!(
            router.classify(&stmt(Expr::lit(1)), &ctx).expect("classify"),
            DeleteStrategy::Truncate {
                exclusive_lock: true
            }
        );
        assert_eq!(
            router
                .classify(&stmt(Expr::col("age").lt(Expr::lit(30))), &ctx)
                .expect("classify"),
            DeleteStrategy::FullMutation
        );
    }

    #[test]
    fn access_is_checked_before_anything_else() {
        let router = router(ServerSettings {
            disable_insertion_and_mutation: true,
        });
        let ctx = QueryContext::new("q", CallerContext::new("nobody"));
        assert!(matches!(
            router.classify(&stmt(Expr::lit(1)), &ctx),
            Err(MutationError::PermissionDenied(_))
        ));
        let allowed = QueryContext::new(
            "q",
            CallerContext::new("writer").with_permission(Permission::table(
                "db",
                "m",
                AccessType::AlterDelete,
            )),
        );
        assert!(matches!(
            router.classify(&stmt(Expr::lit(1)), &allowed),
            Err(MutationError::Prohibited(_))
        ));
    }

    #[test]
    fn unknown_table_is_not_found() {
        let router = router(ServerSettings::default());
        let ctx = QueryContext::new("q", CallerContext::admin("a"));
        let missing = DeleteStatement::new("db", "nope", Expr::lit(1));
        assert!(matches!(
            router.execute_delete(&missing, &ctx),
            Err(MutationError::NotFound { .. })
        ));
    }
}
