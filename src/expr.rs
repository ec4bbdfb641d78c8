use crate::error::MutationError;
use crate::types::{Block, ColumnType, TableSchema, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Maximum nesting depth for expressions to prevent stack overflow
const MAX_EXPR_DEPTH: usize = 32;

/// Scalar expression used for mutation predicates and assigned values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Column(String),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Lte(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Gte(Box<Expr>, Box<Expr>),
    In(Box<Expr>, Vec<Value>),
    IsNull(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    pub fn null() -> Expr {
        Expr::Literal(Value::Null)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn eq(self, rhs: Expr) -> Expr {
        Expr::Eq(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn ne(self, rhs: Expr) -> Expr {
        Expr::Ne(Box::new(self), Box::new(rhs))
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        Expr::Lt(Box::new(self), Box::new(rhs))
    }

    pub fn lte(self, rhs: Expr) -> Expr {
        Expr::Lte(Box::new(self), Box::new(rhs))
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        Expr::Gt(Box::new(self), Box::new(rhs))
    }

    pub fn gte(self, rhs: Expr) -> Expr {
        Expr::Gte(Box::new(self), Box::new(rhs))
    }

    pub fn in_list(self, values: Vec<Value>) -> Expr {
        Expr::In(Box::new(self), values)
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }

    /// Calculates the maximum nesting depth of this expression tree.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::Column(_) => 1,
            Expr::Not(inner) | Expr::IsNull(inner) | Expr::In(inner, _) => 1 + inner.depth(),
            Expr::Eq(l, r)
            | Expr::Ne(l, r)
            | Expr::Lt(l, r)
            | Expr::Lte(l, r)
            | Expr::Gt(l, r)
            | Expr::Gte(l, r)
            | Expr::And(l, r)
            | Expr::Or(l, r)
            | Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r) => 1 + l.depth().max(r.depth()),
        }
    }

    pub fn validate_depth(&self) -> Result<(), MutationError> {
        let depth = self.depth();
        if depth > MAX_EXPR_DEPTH {
            return Err(MutationError::Validation(format!(
                "expression depth {depth} exceeds maximum allowed depth of {MAX_EXPR_DEPTH}"
            )));
        }
        Ok(())
    }

    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(name) => {
                out.insert(name.clone());
            }
            Expr::Not(inner) | Expr::IsNull(inner) | Expr::In(inner, _) => {
                inner.collect_columns(out);
            }
            Expr::Eq(l, r)
            | Expr::Ne(l, r)
            | Expr::Lt(l, r)
            | Expr::Lte(l, r)
            | Expr::Gt(l, r)
            | Expr::Gte(l, r)
            | Expr::And(l, r)
            | Expr::Or(l, r)
            | Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
        }
    }

    /// True when the expression references no column and folds to true.
    pub fn is_always_true(&self) -> bool {
        if !self.columns().is_empty() {
            return false;
        }
        let empty = Block::with_rows(1);
        matches!(self.eval_predicate(&empty, 0), Ok(true))
    }

    /// Static result type. `None` is the type of a bare NULL.
    pub fn result_type(&self, schema: &TableSchema) -> Result<Option<ColumnType>, MutationError> {
        match self {
            Expr::Literal(v) => Ok(v.column_type()),
            Expr::Column(name) => schema
                .column_type(name)
                .map(Some)
                .ok_or_else(|| schema.unknown_column(name)),
            Expr::Eq(l, r)
            | Expr::Ne(l, r)
            | Expr::Lt(l, r)
            | Expr::Lte(l, r)
            | Expr::Gt(l, r)
            | Expr::Gte(l, r) => {
                let lt = l.result_type(schema)?;
                let rt = r.result_type(schema)?;
                check_comparable(lt, rt)?;
                Ok(Some(ColumnType::Boolean))
            }
            Expr::In(inner, values) => {
                let it = inner.result_type(schema)?;
                for v in values {
                    check_comparable(it, v.column_type())?;
                }
                Ok(Some(ColumnType::Boolean))
            }
            Expr::IsNull(inner) => {
                inner.result_type(schema)?;
                Ok(Some(ColumnType::Boolean))
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.check_predicate(schema)?;
                r.check_predicate(schema)?;
                Ok(Some(ColumnType::Boolean))
            }
            Expr::Not(inner) => {
                inner.check_predicate(schema)?;
                Ok(Some(ColumnType::Boolean))
            }
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) => {
                let lt = l.result_type(schema)?;
                let rt = r.result_type(schema)?;
                for t in [lt, rt].into_iter().flatten() {
                    if !t.is_numeric() {
                        return Err(MutationError::Validation(format!(
                            "arithmetic is not defined for {t}"
                        )));
                    }
                }
                Ok(match (lt, rt) {
                    (None, None) => None,
                    (Some(ColumnType::Float), _) | (_, Some(ColumnType::Float)) => {
                        Some(ColumnType::Float)
                    }
                    _ => Some(ColumnType::Integer),
                })
            }
        }
    }

    /// Checks that the expression can be used as a row filter.
    pub fn check_predicate(&self, schema: &TableSchema) -> Result<(), MutationError> {
        self.validate_depth()?;
        match self.result_type(schema)? {
            None | Some(ColumnType::Boolean) | Some(ColumnType::Integer) => Ok(()),
            Some(other) => Err(MutationError::Validation(format!(
                "predicate must be Boolean, got {other}"
            ))),
        }
    }

    pub fn eval(&self, block: &Block, row: usize) -> Result<Value, MutationError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column(name) => block.value(name, row).cloned().ok_or_else(|| {
                MutationError::Logical(format!("column '{name}' is not present in block"))
            }),
            Expr::Eq(l, r) => compare_with(l, r, block, row, |o| o == Ordering::Equal),
            Expr::Ne(l, r) => compare_with(l, r, block, row, |o| o != Ordering::Equal),
            Expr::Lt(l, r) => compare_with(l, r, block, row, |o| o == Ordering::Less),
            Expr::Lte(l, r) => compare_with(l, r, block, row, |o| o != Ordering::Greater),
            Expr::Gt(l, r) => compare_with(l, r, block, row, |o| o == Ordering::Greater),
            Expr::Gte(l, r) => compare_with(l, r, block, row, |o| o != Ordering::Less),
            Expr::In(inner, values) => {
                let v = inner.eval(block, row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                let found = values
                    .iter()
                    .any(|c| v.compare(c) == Some(Ordering::Equal));
                Ok(Value::Boolean(found))
            }
            Expr::IsNull(inner) => Ok(Value::Boolean(inner.eval(block, row)?.is_null())),
            Expr::And(l, r) => {
                let lv = l.eval(block, row)?.truth()?;
                if lv == Some(false) {
                    return Ok(Value::Boolean(false));
                }
                let rv = r.eval(block, row)?.truth()?;
                Ok(match (lv, rv) {
                    (_, Some(false)) => Value::Boolean(false),
                    (Some(true), Some(true)) => Value::Boolean(true),
                    _ => Value::Null,
                })
            }
            Expr::Or(l, r) => {
                let lv = l.eval(block, row)?.truth()?;
                if lv == Some(true) {
                    return Ok(Value::Boolean(true));
                }
                let rv = r.eval(block, row)?.truth()?;
                Ok(match (lv, rv) {
                    (_, Some(true)) => Value::Boolean(true),
                    (Some(false), Some(false)) => Value::Boolean(false),
                    _ => Value::Null,
                })
            }
            Expr::Not(inner) => Ok(match inner.eval(block, row)?.truth()? {
                Some(b) => Value::Boolean(!b),
                None => Value::Null,
            }),
            Expr::Add(l, r) => arithmetic(l, r, block, row, "+", i64::checked_add, |a, b| a + b),
            Expr::Sub(l, r) => arithmetic(l, r, block, row, "-", i64::checked_sub, |a, b| a - b),
            Expr::Mul(l, r) => arithmetic(l, r, block, row, "*", i64::checked_mul, |a, b| a * b),
        }
    }

    /// Evaluates as a filter; NULL does not match.
    pub fn eval_predicate(&self, block: &Block, row: usize) -> Result<bool, MutationError> {
        Ok(self.eval(block, row)?.truth()?.unwrap_or(false))
    }
}

fn check_comparable(
    lhs: Option<ColumnType>,
    rhs: Option<ColumnType>,
) -> Result<(), MutationError> {
    match (lhs, rhs) {
        (Some(a), Some(b)) if a != b && !(a.is_numeric() && b.is_numeric()) => Err(
            MutationError::Validation(format!("cannot compare {a} with {b}")),
        ),
        _ => Ok(()),
    }
}

fn compare_with(
    l: &Expr,
    r: &Expr,
    block: &Block,
    row: usize,
    test: impl Fn(Ordering) -> bool,
) -> Result<Value, MutationError> {
    let lv = l.eval(block, row)?;
    let rv = r.eval(block, row)?;
    Ok(match lv.compare(&rv) {
        Some(ord) => Value::Boolean(test(ord)),
        None => Value::Null,
    })
}

fn arithmetic(
    l: &Expr,
    r: &Expr,
    block: &Block,
    row: usize,
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, MutationError> {
    let lv = l.eval(block, row)?;
    let rv = r.eval(block, row)?;
    match (lv, rv) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Integer(a), Value::Integer(b)) => int_op(a, b)
            .map(Value::Integer)
            .ok_or_else(|| MutationError::Validation(format!("integer overflow in {a} {op} {b}"))),
        (Value::Integer(a), Value::Float(b)) => Ok(Value::Float(float_op(a as f64, b))),
        (Value::Float(a), Value::Integer(b)) => Ok(Value::Float(float_op(a, b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(a, b))),
        (a, b) => Err(MutationError::Validation(format!(
            "cannot apply {op} to {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}
