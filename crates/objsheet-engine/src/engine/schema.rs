//! The column tree.
//!
//! - [`Column`] - one schema node (state or computed)
//! - [`Schema`] - the whole tree plus name resolution helpers
//! - [`ColumnRef`] / [`Direction`] - results of logical child lookup

use std::collections::HashMap;

use super::formula::Formula;
use super::types::Type;
use super::value::ColumnId;
use crate::error::{EngineError, Result, validation};

/// A schema-tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub id: ColumnId,
    /// `None` only for the root.
    pub parent: Option<ColumnId>,
    pub children: Vec<ColumnId>,
    pub field_name: Option<String>,
    /// Required for state columns, optional for computed ones.
    pub specified_type: Option<Type>,
    pub is_object: bool,
    pub object_name: Option<String>,
    /// `None` means a state column.
    pub formula: Option<Formula>,
    pub reference_display_column: Option<ColumnId>,
}

impl Column {
    pub fn new(id: ColumnId, parent: ColumnId) -> Self {
        Column {
            id,
            parent: Some(parent),
            children: Vec::new(),
            field_name: None,
            specified_type: None,
            is_object: false,
            object_name: None,
            formula: None,
            reference_display_column: None,
        }
    }

    fn root() -> Self {
        Column {
            id: ColumnId::root(),
            parent: None,
            children: Vec::new(),
            field_name: None,
            specified_type: Some(Type::Token),
            is_object: true,
            object_name: None,
            formula: None,
            reference_display_column: None,
        }
    }

    pub fn is_state(&self) -> bool {
        !self.id.is_root() && self.formula.is_none()
    }

    pub fn is_computed(&self) -> bool {
        self.formula.is_some()
    }

    /// `objectName`, else `[fieldName]`.
    pub fn object_name_with_fallback(&self) -> Option<String> {
        match (&self.object_name, &self.field_name) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(field)) => Some(format!("[{}]", field)),
            (None, None) => None,
        }
    }
}

/// A column seen either as its cells (`is_values == false`) or its values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub column: ColumnId,
    pub is_values: bool,
}

impl ColumnRef {
    pub fn new(column: ColumnId, is_values: bool) -> Self {
        ColumnRef { column, is_values }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One interpretation of a user-facing name below an object column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalChild {
    pub target: ColumnRef,
    pub direction: Direction,
}

/// The column tree, keyed by id. The root always exists.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: HashMap<ColumnId, Column>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Self {
        let mut columns = HashMap::new();
        columns.insert(ColumnId::root(), Column::root());
        Schema { columns }
    }

    pub fn get(&self, id: &ColumnId) -> Option<&Column> {
        self.columns.get(id)
    }

    pub fn column(&self, id: &ColumnId) -> Result<&Column> {
        self.columns
            .get(id)
            .ok_or_else(|| EngineError::NoSuchColumn(id.clone()))
    }

    pub fn column_mut(&mut self, id: &ColumnId) -> Result<&mut Column> {
        self.columns
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchColumn(id.clone()))
    }

    pub fn contains(&self, id: &ColumnId) -> bool {
        self.columns.contains_key(id)
    }

    pub fn children_of(&self, id: &ColumnId) -> Result<&[ColumnId]> {
        Ok(&self.column(id)?.children)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Attach a new column under its parent at `index`.
    pub fn insert(&mut self, column: Column, index: usize) -> Result<()> {
        let parent_id = column
            .parent
            .clone()
            .ok_or_else(|| crate::error::internal("a new column needs a parent"))?;
        let parent = self.column_mut(&parent_id)?;
        let index = index.min(parent.children.len());
        parent.children.insert(index, column.id.clone());
        self.columns.insert(column.id.clone(), column);
        Ok(())
    }

    /// Detach and drop a leaf column.
    pub fn remove(&mut self, id: &ColumnId) -> Result<Column> {
        let column = self.column(id)?;
        if !column.children.is_empty() {
            return Err(crate::error::internal(format!(
                "column {} still has children",
                id
            )));
        }
        if let Some(parent_id) = column.parent.clone() {
            if let Some(parent) = self.columns.get_mut(&parent_id) {
                parent.children.retain(|c| c != id);
            }
        }
        self.columns
            .remove(id)
            .ok_or_else(|| EngineError::NoSuchColumn(id.clone()))
    }

    /// Drop a column record without touching any parent. Used by repair.
    pub fn forget(&mut self, id: &ColumnId) -> Option<Column> {
        if id.is_root() {
            return None;
        }
        self.columns.remove(id)
    }

    pub fn column_depth(&self, id: &ColumnId) -> Result<usize> {
        Ok(self.ancestors(id)?.len() - 1)
    }

    /// `id` first, the root last.
    pub fn ancestors(&self, id: &ColumnId) -> Result<Vec<ColumnId>> {
        let mut out = Vec::new();
        let mut cur = id.clone();
        loop {
            let col = self.column(&cur)?;
            out.push(cur.clone());
            match &col.parent {
                Some(p) => cur = p.clone(),
                None => break,
            }
            if out.len() > self.columns.len() {
                return Err(crate::error::internal("cycle in column parents"));
            }
        }
        Ok(out)
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &ColumnId, id: &ColumnId) -> bool {
        self.ancestors(id)
            .map(|a| a.contains(ancestor))
            .unwrap_or(false)
    }

    /// Every interpretation of `name` as a logical child of object column `id`.
    ///
    /// A key counts as a child of its own object, so the column's field name
    /// resolves upward to itself.
    pub fn logical_children_by_name(&self, id: &ColumnId, name: &str) -> Result<Vec<LogicalChild>> {
        let col = self.column(id)?;
        let mut out = Vec::new();
        if col.field_name.as_deref() == Some(name) {
            out.push(LogicalChild {
                target: ColumnRef::new(id.clone(), true),
                direction: Direction::Up,
            });
        }
        for child_id in &col.children {
            let child = self.column(child_id)?;
            let (child_name, is_values) = if child.is_object {
                (child.object_name_with_fallback(), false)
            } else {
                (child.field_name.clone(), true)
            };
            if child_name.as_deref() == Some(name) {
                out.push(LogicalChild {
                    target: ColumnRef::new(child_id.clone(), is_values),
                    direction: Direction::Down,
                });
            }
        }
        Ok(out)
    }

    /// The ancestor paths of `a` and `b` up to and including their lowest
    /// common ancestor.
    pub fn find_common_ancestor_paths(
        &self,
        a: &ColumnId,
        b: &ColumnId,
    ) -> Result<(Vec<ColumnId>, Vec<ColumnId>)> {
        let mut up_path = self.ancestors(a)?;
        let mut down_path = Vec::new();
        let mut cur = b.clone();
        let idx = loop {
            down_path.push(cur.clone());
            if let Some(idx) = up_path.iter().position(|c| *c == cur) {
                break idx;
            }
            cur = self
                .column(&cur)?
                .parent
                .clone()
                .ok_or_else(|| crate::error::internal("columns share no ancestor"))?;
        };
        up_path.truncate(idx + 1);
        Ok((up_path, down_path))
    }

    /// Parse a `:`-separated column reference from the root, e.g. `Person:Pet`.
    pub fn parse_column_ref(&self, s: &str) -> Result<ColumnRef> {
        if s == "$" {
            return Ok(ColumnRef::new(ColumnId::root(), false));
        }
        if s.is_empty() {
            return Err(validation(
                "We currently do not support references to the root column.",
            ));
        }
        let mut cur = ColumnRef::new(ColumnId::root(), false);
        for name in s.split(':') {
            if cur.is_values {
                return Err(validation(format!(
                    "Looking up child '{}' of a value column.",
                    name
                )));
            }
            let mut found = self.logical_children_by_name(&cur.column, name)?;
            if found.len() != 1 {
                return Err(validation(format!(
                    "{} interpretations for {}:{}, wanted one.",
                    found.len(),
                    self.stringify_column_ref(&cur),
                    name
                )));
            }
            cur = found.remove(0).target;
        }
        Ok(cur)
    }

    pub fn stringify_column_ref(&self, column_ref: &ColumnRef) -> String {
        if column_ref.column.is_root() {
            return "$".to_string();
        }
        let mut names = Vec::new();
        let mut column_id = column_ref.column.clone();
        let mut is_values = column_ref.is_values;
        while !column_id.is_root() {
            let Some(col) = self.get(&column_id) else {
                return "(deleted)".to_string();
            };
            let name = if is_values {
                col.field_name.clone()
            } else {
                col.object_name_with_fallback()
            };
            let logical_parent = if is_values && col.is_object {
                column_id.clone()
            } else {
                match &col.parent {
                    Some(p) => p.clone(),
                    None => break,
                }
            };
            let name = match name {
                Some(n) => {
                    let count = self
                        .logical_children_by_name(&logical_parent, &n)
                        .map(|c| c.len())
                        .unwrap_or(0);
                    if count != 1 { format!("{}(ambiguous)", n) } else { n }
                }
                None => "(unnamed)".to_string(),
            };
            names.push(name);
            is_values = false;
            column_id = logical_parent;
        }
        names.reverse();
        names.join(":")
    }

    /// Parse a primitive type name or an object column reference.
    pub fn parse_type_str(&self, s: &str) -> Result<Type> {
        if Type::is_primitive_name(s) {
            return Ok(Type::from_name(s));
        }
        let column_ref = self.parse_column_ref(s)?;
        if column_ref.is_values {
            return Err(validation(format!(
                "'{}' refers to a value column, not an object type.",
                s
            )));
        }
        Ok(Type::Reference(column_ref.column))
    }

    pub fn stringify_type(&self, ty: &Type) -> String {
        match ty {
            Type::Reference(id) => self.stringify_column_ref(&ColumnRef::new(id.clone(), false)),
            other => other.name().to_string(),
        }
    }

    /// All column ids in pre-order from the root.
    pub fn all_columns(&self) -> Vec<ColumnId> {
        let mut out = Vec::new();
        let mut stack = vec![ColumnId::root()];
        while let Some(id) = stack.pop() {
            if let Some(col) = self.columns.get(&id) {
                for child in col.children.iter().rev() {
                    stack.push(child.clone());
                }
                out.push(id);
            }
        }
        out
    }

    /// Ids of every stored column record, reachable or not.
    pub fn column_ids(&self) -> Vec<ColumnId> {
        let mut ids: Vec<ColumnId> = self.columns.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Columns that may render a reference to `id` as text.
    pub fn allowed_reference_display_columns(&self, id: &ColumnId, column_type: &Type) -> Vec<ColumnId> {
        let mut allowed = Vec::new();
        if *column_type != Type::Token {
            allowed.push(id.clone());
        }
        if let Some(col) = self.get(id) {
            for child_id in &col.children {
                if self.get(child_id).is_some_and(|c| !c.is_object) {
                    allowed.push(child_id.clone());
                }
            }
        }
        allowed
    }

    pub fn default_reference_display_column(&self, id: &ColumnId, column_type: &Type) -> Option<ColumnId> {
        self.allowed_reference_display_columns(id, column_type)
            .into_iter()
            .next()
    }
}
