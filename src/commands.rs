use crate::error::MutationError;
use crate::expr::Expr;
use crate::types::{ColumnType, ROW_EXISTS_COLUMN, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One row-level edit. Immutable once built; ordering lives in [`MutationCommands`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationCommand {
    /// Physically removes matching rows.
    Delete {
        predicate: Expr,
        #[serde(default)]
        partition: Option<String>,
    },
    /// Assigns `value` to `column` for matching rows, or all rows without a predicate.
    UpdateColumn {
        column: String,
        #[serde(default)]
        predicate: Option<Expr>,
        value: Expr,
        #[serde(default)]
        partition: Option<String>,
    },
    /// Recomputes a column from its default expression.
    MaterializeColumn { column: String },
    DropColumn { column: String },
    RenameColumn { from: String, to: String },
}

impl MutationCommand {
    pub fn delete(predicate: Expr) -> Self {
        MutationCommand::Delete {
            predicate,
            partition: None,
        }
    }

    pub fn update(column: impl Into<String>, value: Expr) -> Self {
        MutationCommand::UpdateColumn {
            column: column.into(),
            predicate: None,
            value,
            partition: None,
        }
    }

    pub fn update_where(column: impl Into<String>, value: Expr, predicate: Expr) -> Self {
        MutationCommand::UpdateColumn {
            column: column.into(),
            predicate: Some(predicate),
            value,
            partition: None,
        }
    }

    /// `UPDATE _row_exists = 0 WHERE predicate`: hides rows without rewriting user columns.
    pub fn lightweight_delete(predicate: Expr) -> Self {
        Self::update_where(ROW_EXISTS_COLUMN, Expr::lit(false), predicate)
    }

    pub fn materialize(column: impl Into<String>) -> Self {
        MutationCommand::MaterializeColumn {
            column: column.into(),
        }
    }

    pub fn drop_column(column: impl Into<String>) -> Self {
        MutationCommand::DropColumn {
            column: column.into(),
        }
    }

    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        MutationCommand::RenameColumn {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Restricts a delete or update to one partition. Other commands are unaffected.
    pub fn in_partition(mut self, partition_id: impl Into<String>) -> Self {
        match &mut self {
            MutationCommand::Delete { partition, .. }
            | MutationCommand::UpdateColumn { partition, .. } => {
                *partition = Some(partition_id.into());
            }
            _ => {}
        }
        self
    }

    pub fn partition(&self) -> Option<&str> {
        match self {
            MutationCommand::Delete { partition, .. }
            | MutationCommand::UpdateColumn { partition, .. } => partition.as_deref(),
            _ => None,
        }
    }

    pub fn applies_to_partition(&self, partition_id: &str) -> bool {
        self.partition().is_none_or(|p| p == partition_id)
    }

    /// Column this command writes, if any.
    pub fn target_column(&self) -> Option<&str> {
        match self {
            MutationCommand::Delete { .. } => None,
            MutationCommand::UpdateColumn { column, .. }
            | MutationCommand::MaterializeColumn { column }
            | MutationCommand::DropColumn { column } => Some(column.as_str()),
            MutationCommand::RenameColumn { from, .. } => Some(from.as_str()),
        }
    }

    pub fn is_lightweight_delete(&self) -> bool {
        matches!(
            self,
            MutationCommand::UpdateColumn { column, value: Expr::Literal(v), .. }
                if column == ROW_EXISTS_COLUMN && v.truth().ok().flatten() == Some(false)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MutationCommand::Delete { .. } => "DELETE",
            MutationCommand::UpdateColumn { .. } => "UPDATE",
            MutationCommand::MaterializeColumn { .. } => "MATERIALIZE COLUMN",
            MutationCommand::DropColumn { .. } => "DROP COLUMN",
            MutationCommand::RenameColumn { .. } => "RENAME COLUMN",
        }
    }
}

/// Ordered command list. Later commands observe the effect of earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationCommands {
    commands: Vec<MutationCommand>,
}

impl MutationCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: MutationCommand) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MutationCommand> {
        self.commands.iter()
    }

    pub fn as_slice(&self) -> &[MutationCommand] {
        &self.commands
    }

    /// Commands that apply to parts of `partition_id`, in original order.
    pub fn for_partition(&self, partition_id: &str) -> MutationCommands {
        MutationCommands {
            commands: self
                .commands
                .iter()
                .filter(|c| c.applies_to_partition(partition_id))
                .cloned()
                .collect(),
        }
    }

    pub fn is_lightweight_delete(&self) -> bool {
        !self.is_empty() && self.commands.iter().all(MutationCommand::is_lightweight_delete)
    }

    /// Columns written, dropped or renamed by any command.
    pub fn touched_columns(&self) -> BTreeSet<String> {
        self.commands
            .iter()
            .filter_map(|c| c.target_column().map(str::to_string))
            .collect()
    }

    /// Checks columns and expression types against `schema`, replaying drops and renames
    /// so later commands are checked against the columns they will actually see.
    pub fn validate(&self, schema: &TableSchema) -> Result<(), MutationError> {
        self.resulting_schema(schema).map(|_| ())
    }

    /// Schema after every command has run: drops and renames applied.
    pub fn resulting_schema(&self, schema: &TableSchema) -> Result<TableSchema, MutationError> {
        if self.is_empty() {
            return Err(MutationError::Validation("empty mutation command list".into()));
        }
        let mut working = schema.clone();
        for command in &self.commands {
            validate_command(command, &mut working)?;
        }
        Ok(working)
    }

    pub fn changes_schema(&self) -> bool {
        self.commands.iter().any(|c| {
            matches!(
                c,
                MutationCommand::DropColumn { .. } | MutationCommand::RenameColumn { .. }
            )
        })
    }
}

fn validate_command(
    command: &MutationCommand,
    working: &mut TableSchema,
) -> Result<(), MutationError> {
    match command {
        MutationCommand::Delete { predicate, .. } => predicate.check_predicate(working),
        MutationCommand::UpdateColumn {
            column,
            predicate,
            value,
            ..
        } => {
            let Some(col_type) = working.column_type(column) else {
                return Err(working.unknown_column(column));
            };
            if let Some(predicate) = predicate {
                predicate.check_predicate(working)?;
            }
            value.validate_depth()?;
            check_assignable(working, column, col_type, value)
        }
        MutationCommand::MaterializeColumn { column } => {
            let Some(def) = working.get(column) else {
                return Err(working.unknown_column(column));
            };
            let Some(default) = def.default.clone() else {
                return Err(MutationError::Validation(format!(
                    "column '{column}' has no default expression to materialize"
                )));
            };
            let col_type = def.col_type;
            check_assignable(working, column, col_type, &default)
        }
        MutationCommand::DropColumn { column } => {
            if column == ROW_EXISTS_COLUMN {
                return Err(MutationError::Validation(format!(
                    "cannot drop hidden column '{ROW_EXISTS_COLUMN}'"
                )));
            }
            if working.get(column).is_none() {
                return Err(working.unknown_column(column));
            }
            if working.columns.len() == 1 {
                return Err(MutationError::Validation(format!(
                    "cannot drop '{column}': a table needs at least one column"
                )));
            }
            working.columns.retain(|c| &c.name != column);
            Ok(())
        }
        MutationCommand::RenameColumn { from, to } => {
            if from == ROW_EXISTS_COLUMN || to == ROW_EXISTS_COLUMN {
                return Err(MutationError::Validation(format!(
                    "cannot rename hidden column '{ROW_EXISTS_COLUMN}'"
                )));
            }
            if working.get(to).is_some() {
                return Err(MutationError::Validation(format!(
                    "cannot rename '{from}' to '{to}': column already exists"
                )));
            }
            let Some(idx) = working.columns.iter().position(|c| &c.name == from) else {
                return Err(working.unknown_column(from));
            };
            working.columns[idx].name = to.clone();
            Ok(())
        }
    }
}

fn check_assignable(
    schema: &TableSchema,
    column: &str,
    col_type: ColumnType,
    value: &Expr,
) -> Result<(), MutationError> {
    match value.result_type(schema)? {
        None if schema.is_nullable(column) => Ok(()),
        None => Err(MutationError::TypeMismatch {
            table: schema.full_name(),
            column: column.to_string(),
            expected: col_type.to_string(),
            actual: "Null".into(),
        }),
        Some(actual) if col_type.accepts(actual) => Ok(()),
        Some(actual) => Err(MutationError::TypeMismatch {
            table: schema.full_name(),
            column: column.to_string(),
            expected: col_type.to_string(),
            actual: actual.to_string(),
        }),
    }
}

impl<'a> IntoIterator for &'a MutationCommands {
    type Item = &'a MutationCommand;
    type IntoIter = std::slice::Iter<'a, MutationCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

impl From<Vec<MutationCommand>> for MutationCommands {
    fn from(commands: Vec<MutationCommand>) -> Self {
        Self { commands }
    }
}

impl FromIterator<MutationCommand> for MutationCommands {
    fn from_iter<I: IntoIterator<Item = MutationCommand>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}
