use crate::error::MutationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Actions a statement may need on a table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessType {
    Select,
    Insert,
    AlterUpdate,
    AlterDelete,
    Truncate,
}

impl AccessType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessType::Select => "SELECT",
            AccessType::Insert => "INSERT",
            AccessType::AlterUpdate => "ALTER UPDATE",
            AccessType::AlterDelete => "ALTER DELETE",
            AccessType::Truncate => "TRUNCATE",
        }
    }
}

/// A grant. Database grants cover every table of the database; `GlobalAdmin` covers all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    Table {
        database: String,
        table: String,
        access: AccessType,
    },
    Database {
        database: String,
        access: AccessType,
    },
    GlobalAdmin,
}

impl Permission {
    pub fn table(database: impl Into<String>, table: impl Into<String>, access: AccessType) -> Self {
        Permission::Table {
            database: database.into(),
            table: table.into(),
            access,
        }
    }

    fn covers(&self, access: AccessType, database: &str, table: &str) -> bool {
        match self {
            Permission::GlobalAdmin => true,
            Permission::Database {
                database: d,
                access: a,
            } => *a == access && d == database,
            Permission::Table {
                database: d,
                table: t,
                access: a,
            } => *a == access && d == database && t == table,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallerContext {
    pub caller_id: String,
    #[serde(default)]
    permissions: BTreeSet<Permission>,
    // Reserved internal flag: never deserialize from untrusted input.
    #[serde(default, skip_deserializing)]
    internal_system: bool,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            permissions: BTreeSet::new(),
            internal_system: false,
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn admin(caller_id: impl Into<String>) -> Self {
        Self::new(caller_id).with_permission(Permission::GlobalAdmin)
    }

    /// Background work started by the server itself, such as queued mutations.
    pub fn system_internal() -> Self {
        Self {
            caller_id: "system".to_string(),
            permissions: BTreeSet::new(),
            internal_system: true,
        }
    }

    pub(crate) fn is_internal_system(&self) -> bool {
        self.internal_system && self.caller_id == "system"
    }

    pub fn check_access(
        &self,
        access: AccessType,
        database: &str,
        table: &str,
    ) -> Result<(), MutationError> {
        if self.is_internal_system()
            || self
                .permissions
                .iter()
                .any(|p| p.covers(access, database, table))
        {
            return Ok(());
        }
        Err(MutationError::PermissionDenied(format!(
            "{} is missing {} on {database}.{table}",
            self.caller_id,
            access.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessType, CallerContext, Permission};

    #[test]
    fn table_grant_is_exact() {
        let caller = CallerContext::new("alice").with_permission(Permission::table(
            "db",
            "events",
            AccessType::AlterDelete,
        ));
        assert!(caller.check_access(AccessType::AlterDelete, "db", "events").is_ok());
        assert!(caller.check_access(AccessType::Truncate, "db", "events").is_err());
        assert!(caller.check_access(AccessType::AlterDelete, "db", "other").is_err());
    }

    #[test]
    fn database_grant_covers_tables() {
        let caller = CallerContext::new("bob").with_permission(Permission::Database {
            database: "db".into(),
            access: AccessType::Truncate,
        });
        assert!(caller.check_access(AccessType::Truncate, "db", "any").is_ok());
        assert!(caller.check_access(AccessType::Truncate, "other", "any").is_err());
    }

    #[test]
    fn internal_flag_is_not_deserialized() {
        let json = r#"{"caller_id":"system","internal_system":true}"#;
        let caller: CallerContext = serde_json::from_str(json).expect("decode");
        assert!(caller.check_access(AccessType::Truncate, "db", "t").is_err());
        assert!(
            CallerContext::system_internal()
                .check_access(AccessType::Truncate, "db", "t")
                .is_ok()
        );
    }
}
