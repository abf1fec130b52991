//! Values and cell addresses.
//!
//! A [`CellId`] is the path of values from the root down to one cell; a
//! reference value is just a `CellId` stored in another column's family.

use chrono::NaiveDateTime;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of a schema column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(pub String);

pub const ROOT_COLUMN: &str = "_root";

const RANDOM_ID_LEN: usize = 17;

impl ColumnId {
    pub fn new(id: impl Into<String>) -> Self {
        ColumnId(id.into())
    }

    pub fn root() -> Self {
        ColumnId(ROOT_COLUMN.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_COLUMN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A fresh random column id.
    pub fn random() -> Self {
        ColumnId(random_id())
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A random 17-character alphanumeric string, used for column ids and tokens.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_ID_LEN)
        .map(char::from)
        .collect()
}

/// A totally ordered `f64` so numbers can live in ordered sets.
#[derive(Debug, Clone, Copy)]
pub struct Number(f64);

impl Number {
    pub fn new(x: f64) -> Self {
        // Fold -0.0 into 0.0 so arithmetic results compare equal to literals.
        if x == 0.0 { Number(0.0) } else { Number(x) }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<f64> for Number {
    fn from(x: f64) -> Self {
        Number::new(x)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self.0;
        if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
            write!(f, "{}", x as i64)
        } else {
            write!(f, "{}", x)
        }
    }
}

/// A single value stored in a family.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Bool(bool),
    Number(Number),
    Text(String),
    Date(NaiveDateTime),
    Token(String),
    Unit,
    Ref(CellId),
}

impl Value {
    pub fn number(x: f64) -> Self {
        Value::Number(Number::new(x))
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn new_token() -> Self {
        Value::Token(random_id())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.get()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<&CellId> {
        match self {
            Value::Ref(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M")),
            Value::Token(t) => write!(f, "#{}", t),
            Value::Unit => f.write_str("X"),
            Value::Ref(c) => write!(f, "{}", c),
        }
    }
}

/// Path of values addressing one cell, one value per ancestor object column.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub Vec<Value>);

impl CellId {
    pub fn root() -> Self {
        CellId(Vec::new())
    }

    pub fn child(&self, value: Value) -> Self {
        let mut path = self.0.clone();
        path.push(value);
        CellId(path)
    }

    pub fn parent(&self) -> Self {
        let mut path = self.0.clone();
        path.pop();
        CellId(path)
    }

    pub fn last_step(&self) -> Option<&Value> {
        self.0.last()
    }

    /// Keep only the first `depth` steps.
    pub fn truncate(&self, depth: usize) -> Self {
        CellId(self.0.iter().take(depth).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str("]")
    }
}

/// A cell qualified by its column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QCellId {
    pub column: ColumnId,
    pub cell: CellId,
}

/// A family: the values of `column` under the parent cell `parent`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QFamilyId {
    pub column: ColumnId,
    pub parent: CellId,
}

impl QFamilyId {
    pub fn new(column: ColumnId, parent: CellId) -> Self {
        QFamilyId { column, parent }
    }
}

impl fmt::Display for QFamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.column, self.parent)
    }
}
