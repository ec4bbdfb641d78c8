pub mod access;
pub mod blocker;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod expr;
pub mod hardlinks;
pub mod lock;
pub mod memory;
pub mod merge_list;
pub mod offline;
pub mod part;
pub mod registry;
pub mod reservation;
pub mod router;
pub mod storage;
pub mod task;
pub mod types;

pub use crate::access::{AccessType, CallerContext, Permission};
pub use crate::blocker::{ActionBlocker, ActionLock};
pub use crate::catalog::{Catalog, Database, DdlReplicator, ReplicatedDdlHandle};
pub use crate::commands::{MutationCommand, MutationCommands};
pub use crate::config::{MutationSettings, ProjectionMode, ServerSettings, TableSettings};
pub use crate::error::{MutationError, MutationErrorCode, ResourceType};
pub use crate::expr::Expr;
pub use crate::hardlinks::{HardlinkTracker, HardlinkedFiles};
pub use crate::lock::{TableExclusiveLockHolder, TableLock, TableLockHolder, TruncateLock};
pub use crate::memory::MemoryTable;
pub use crate::merge_list::{MergeInfo, MergeList, MergeListEntry};
pub use crate::part::{DataPart, PartName, TemporaryPart};
pub use crate::registry::{PartClaim, PartRegistry};
pub use crate::reservation::{Disk, Reservation, Volume};
pub use crate::router::{DeleteStatement, DeleteStrategy, MutationRouter, QueryResultHandle};
pub use crate::storage::{
    MutationStatus, MutationSubmission, PartTable, QueryContext, Storage, StorageCapabilities,
};
pub use crate::task::{
    FutureMutatedPart, MutateTask, MutateTaskArgs, MutationFuture, TaskCanceller, TaskState,
    TransactionHandle, execute_here,
};
pub use crate::types::{Block, ColumnDef, ColumnType, TableSchema, Value};
