//! Column types and typed sets.
//!
//! Types form a flat lattice: [`Type::Empty`] at the bottom, [`Type::Error`]
//! at the top and every primitive or reference type in between.

use std::collections::BTreeSet;
use std::fmt;

use super::value::{CellId, ColumnId, Value};
use crate::error::{Result, evaluation};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Empty,
    Error,
    Text,
    Number,
    Bool,
    Date,
    Token,
    Unit,
    Reference(ColumnId),
}

impl Type {
    /// Internal name of a type. Reference types are named by their column id.
    pub fn name(&self) -> &str {
        match self {
            Type::Empty => "empty",
            Type::Error => "error",
            Type::Text => "text",
            Type::Number => "number",
            Type::Bool => "bool",
            Type::Date => "date",
            Type::Token => "_token",
            Type::Unit => "_unit",
            Type::Reference(id) => id.as_str(),
        }
    }

    pub fn from_name(name: &str) -> Type {
        match name {
            "empty" => Type::Empty,
            "error" => Type::Error,
            "text" => Type::Text,
            "number" => Type::Number,
            "bool" => Type::Bool,
            "date" => Type::Date,
            "_token" => Type::Token,
            "_unit" => Type::Unit,
            other => Type::Reference(ColumnId::new(other)),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Reference(_))
    }

    pub fn referenced_column(&self) -> Option<&ColumnId> {
        match self {
            Type::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_primitive_name(name: &str) -> bool {
        !Type::from_name(name).is_reference()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Least upper bound in the type lattice.
pub fn common_supertype(a: &Type, b: &Type) -> Type {
    if *a != Type::Empty {
        if *b != Type::Empty && b != a {
            Type::Error
        } else {
            a.clone()
        }
    } else {
        b.clone()
    }
}

pub fn is_subtype(a: &Type, b: &Type) -> bool {
    common_supertype(a, b) == *b
}

/// The universal result of formula evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedSet {
    pub ty: Type,
    pub set: BTreeSet<Value>,
}

impl TypedSet {
    pub fn new(ty: Type, set: BTreeSet<Value>) -> Self {
        TypedSet { ty, set }
    }

    pub fn empty(ty: Type) -> Self {
        TypedSet {
            ty,
            set: BTreeSet::new(),
        }
    }

    pub fn singleton(ty: Type, value: Value) -> Self {
        let mut set = BTreeSet::new();
        set.insert(value);
        TypedSet { ty, set }
    }

    /// A set of references to the given cells.
    pub fn cells(column: ColumnId, cells: impl IntoIterator<Item = CellId>) -> Self {
        TypedSet {
            ty: Type::Reference(column),
            set: cells.into_iter().map(Value::Ref).collect(),
        }
    }

    /// Add one element. The caller must check `ty` afterwards if types may be mixed.
    pub fn add(&mut self, ty: &Type, value: Value) {
        self.ty = common_supertype(&self.ty, ty);
        self.set.insert(value);
    }

    pub fn add_all(&mut self, other: TypedSet) {
        self.ty = common_supertype(&self.ty, &other.ty);
        self.set.extend(other.set);
    }

    /// The only element, or an evaluation error.
    pub fn single(&self) -> Result<&Value> {
        if self.set.len() == 1 {
            if let Some(v) = self.set.iter().next() {
                return Ok(v);
            }
        }
        Err(evaluation(format!(
            "Expected a single element, got {}",
            self.set.len()
        )))
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.set.iter()
    }

    /// Cell ids of the reference elements, skipping anything else.
    pub fn cell_ids(&self) -> impl Iterator<Item = &CellId> {
        self.set.iter().filter_map(Value::as_cell)
    }
}
