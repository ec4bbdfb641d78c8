use crate::error::MutationError;
use crate::expr::Expr;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Hidden per-row existence flag written by lightweight deletes.
pub const ROW_EXISTS_COLUMN: &str = "_row_exists";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "Boolean"),
            ColumnType::Integer => write!(f, "Integer"),
            ColumnType::Float => write!(f, "Float"),
            ColumnType::Text => write!(f, "Text"),
        }
    }
}

impl ColumnType {
    /// Whether a value of `from` can be stored in a column of this type.
    pub fn accepts(self, from: ColumnType) -> bool {
        matches!(
            (self, from),
            (ColumnType::Boolean, ColumnType::Boolean)
                | (ColumnType::Integer, ColumnType::Integer)
                | (ColumnType::Integer, ColumnType::Boolean)
                | (ColumnType::Float, ColumnType::Float)
                | (ColumnType::Float, ColumnType::Integer)
                | (ColumnType::Text, ColumnType::Text)
        )
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
        }
    }

    pub fn type_name(&self) -> String {
        self.column_type()
            .map_or_else(|| "Null".to_string(), |t| t.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Three-valued truth: `None` for NULL. Integers are truthy when non-zero.
    pub fn truth(&self) -> Result<Option<bool>, MutationError> {
        match self {
            Value::Null => Ok(None),
            Value::Boolean(b) => Ok(Some(*b)),
            Value::Integer(i) => Ok(Some(*i != 0)),
            other => Err(MutationError::Validation(format!(
                "{} value cannot be used as a condition",
                other.type_name()
            ))),
        }
    }

    /// SQL-style comparison; NULL compares as unknown.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Converts the value for storage in a column of `target` type.
    pub fn coerce_to(self, target: ColumnType) -> Option<Value> {
        match (target, self) {
            (_, Value::Null) => Some(Value::Null),
            (ColumnType::Boolean, Value::Boolean(b)) => Some(Value::Boolean(b)),
            (ColumnType::Integer, Value::Integer(i)) => Some(Value::Integer(i)),
            (ColumnType::Integer, Value::Boolean(b)) => Some(Value::Integer(i64::from(b))),
            (ColumnType::Float, Value::Float(f)) => Some(Value::Float(f)),
            (ColumnType::Float, Value::Integer(i)) => Some(Value::Float(i as f64)),
            (ColumnType::Text, Value::Text(s)) => Some(Value::Text(s)),
            _ => None,
        }
    }

    /// Stable textual form used for partition ids.
    pub fn partition_key(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string().replace('.', "-"),
            Value::Text(s) => s
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    /// Expression used to fill the column when it is materialized.
    #[serde(default)]
    pub default: Option<Expr>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, default: Expr) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectionDef {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub database: String,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub partition_by: Option<String>,
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub projections: Vec<ProjectionDef>,
}

impl TableSchema {
    pub fn new(database: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table_name: table_name.into(),
            columns: Vec::new(),
            partition_by: None,
            order_by: Vec::new(),
            projections: Vec::new(),
        }
    }

    pub fn column(mut self, def: ColumnDef) -> Self {
        self.columns.push(def);
        self
    }

    pub fn partition_by(mut self, column: impl Into<String>) -> Self {
        self.partition_by = Some(column.into());
        self
    }

    pub fn order_by(mut self, columns: &[&str]) -> Self {
        self.order_by = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn projection(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.projections.push(ProjectionDef {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table_name)
    }

    pub fn has_projections(&self) -> bool {
        !self.projections.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Type of a readable column, including the hidden existence flag.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        if name == ROW_EXISTS_COLUMN {
            return Some(ColumnType::Boolean);
        }
        self.get(name).map(|c| c.col_type)
    }

    pub fn is_nullable(&self, name: &str) -> bool {
        self.get(name).is_some_and(|c| c.nullable)
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.partition_by.as_deref() == Some(name) || self.order_by.iter().any(|c| c == name)
    }

    pub(crate) fn unknown_column(&self, column: &str) -> MutationError {
        MutationError::UnknownColumn {
            table: self.full_name(),
            column: column.to_string(),
        }
    }
}

/// A chunk of rows stored column by column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    rows: usize,
    columns: BTreeMap<String, Vec<Value>>,
}

impl Block {
    pub fn with_rows(rows: usize) -> Self {
        Self {
            rows,
            columns: BTreeMap::new(),
        }
    }

    /// Builds a block from row-major values in `names` order.
    pub fn from_rows(names: &[&str], rows: Vec<Vec<Value>>) -> Result<Self, MutationError> {
        let mut columns: BTreeMap<String, Vec<Value>> = names
            .iter()
            .map(|n| (n.to_string(), Vec::with_capacity(rows.len())))
            .collect();
        let count = rows.len();
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != names.len() {
                return Err(MutationError::Validation(format!(
                    "row {i} has {} values, expected {}",
                    row.len(),
                    names.len()
                )));
            }
            for (name, value) in names.iter().zip(row) {
                if let Some(col) = columns.get_mut(*name) {
                    col.push(value);
                }
            }
        }
        Ok(Self {
            rows: count,
            columns,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.rows);
        self.columns.insert(name.into(), values);
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Vec<Value>> {
        self.columns.remove(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn value(&self, column: &str, row: usize) -> Option<&Value> {
        self.columns.get(column).and_then(|c| c.get(row))
    }

    /// Keeps only the rows whose mask entry is true.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.rows);
        for values in self.columns.values_mut() {
            let mut i = 0;
            values.retain(|_| {
                let k = keep[i];
                i += 1;
                k
            });
        }
        self.rows = keep.iter().filter(|k| **k).count();
    }

    /// Appends the rows of `other`; both blocks must carry the same columns.
    pub fn append(&mut self, other: Block) -> Result<(), MutationError> {
        if self.columns.is_empty() && self.rows == 0 {
            *self = other;
            return Ok(());
        }
        if self.columns.len() != other.columns.len() {
            return Err(MutationError::Logical(
                "cannot append blocks with different columns".into(),
            ));
        }
        for (name, values) in other.columns {
            let Some(target) = self.columns.get_mut(&name) else {
                return Err(MutationError::Logical(format!(
                    "cannot append block: column '{name}' missing"
                )));
            };
            target.extend(values);
        }
        self.rows += other.rows;
        Ok(())
    }
}
