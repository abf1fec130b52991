//! Schema editing.
//!
//! Every operation invalidates the schema cache. Operations never evaluate;
//! callers run [`Sheet::evaluate_all`] when they want fresh data.

use std::collections::BTreeSet;

use objsheet_engine::engine::{
    CellId, Column, ColumnId, FamilyFilter, FamilyRecord, Formula, QFamilyId, Type, Value,
    parse_value, validate_formula, value_to_text,
};
use tracing::debug;

use super::Sheet;
use crate::error::{Result, SheetError};

/// Type of a state field when nothing better is known.
pub(crate) const DEFAULT_STATE_FIELD_TYPE: Type = Type::Text;

/// Attributes of a new column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnSpec {
    pub field_name: Option<String>,
    pub specified_type: Option<Type>,
    pub is_object: bool,
    pub object_name: Option<String>,
    pub formula: Option<Formula>,
}

impl ColumnSpec {
    /// A state field.
    pub fn field(name: impl Into<String>, ty: Type) -> Self {
        ColumnSpec {
            field_name: Some(name.into()),
            specified_type: Some(ty),
            ..ColumnSpec::default()
        }
    }

    /// An unkeyed state object type.
    pub fn object(name: impl Into<String>) -> Self {
        ColumnSpec {
            specified_type: Some(Type::Token),
            is_object: true,
            object_name: Some(name.into()),
            ..ColumnSpec::default()
        }
    }

    /// A computed field.
    pub fn computed(name: impl Into<String>, formula: Formula) -> Self {
        ColumnSpec {
            field_name: Some(name.into()),
            formula: Some(formula),
            ..ColumnSpec::default()
        }
    }
}

fn not_root(id: &ColumnId) -> Result<()> {
    if id.is_root() {
        Err(SheetError::ModifyRootColumn)
    } else {
        Ok(())
    }
}

fn validate_column_formula(formula: &Formula) -> Result<()> {
    let vars = im::HashSet::unit("this".to_string());
    Ok(validate_formula(&vars, formula)?)
}

impl Sheet {
    fn column(&self, id: &ColumnId) -> Result<&Column> {
        self.schema
            .get(id)
            .ok_or_else(|| SheetError::NoSuchColumn(id.clone()))
    }

    /// `{prefix}N` for the smallest N not used as a field or object name.
    pub(crate) fn next_available_column_name(&self, prefix: &str) -> String {
        let taken: BTreeSet<String> = self
            .schema
            .all_columns()
            .iter()
            .filter_map(|id| self.schema.get(id))
            .flat_map(|c| [c.field_name.clone(), c.object_name.clone()])
            .flatten()
            .collect();
        (1..)
            .map(|i| format!("{}{}", prefix, i))
            .find(|name| !taken.contains(name))
            .unwrap_or_else(|| prefix.to_string())
    }

    fn check_name_clash(&self, parent: &ColumnId, name: &str) -> Result<()> {
        if self.schema.logical_children_by_name(parent, name)?.is_empty() {
            return Ok(());
        }
        let message = match self.column(parent)?.object_name_with_fallback() {
            Some(parent_name) => {
                format!("Object '{}' already has a child named '{}'", parent_name, name)
            }
            None => format!("Top-level object named '{}' already exists.", name),
        };
        Err(SheetError::NameClash(message))
    }

    /// Add a column under `parent` at `index` and return its id.
    ///
    /// A field parent is first promoted to an object; the new column then
    /// lands after the promoted field.
    pub fn define_column(
        &mut self,
        parent: &ColumnId,
        index: usize,
        spec: ColumnSpec,
    ) -> Result<ColumnId> {
        let parent_col = self.column(parent)?;
        if index > parent_col.children.len() {
            return Err(SheetError::IndexOutOfRange);
        }
        if !spec.is_object && spec.object_name.is_some() {
            return Err(SheetError::ObjectNameRequiresObject);
        }
        for name in [&spec.field_name, &spec.object_name].into_iter().flatten() {
            self.check_name_clash(parent, name)?;
        }
        match &spec.formula {
            None => {
                if parent_col.formula.is_some() {
                    return Err(SheetError::StateUnderFormula);
                }
                if spec.specified_type.is_none() {
                    return Err(SheetError::TypeRequired);
                }
            }
            Some(formula) => validate_column_formula(formula)?,
        }
        let mut index = index;
        if !parent_col.is_object {
            self.change_column_is_object(parent, true)?;
            index = 1;
        }
        self.invalidate_schema_cache();
        let id = ColumnId::random();
        let mut column = Column::new(id.clone(), parent.clone());
        column.field_name = spec.field_name;
        column.specified_type = spec.specified_type;
        column.is_object = spec.is_object;
        column.object_name = spec.object_name;
        column.formula = spec.formula;
        self.schema.insert(column, index)?;
        debug!(column = %id, parent = %parent, "defined column");
        Ok(id)
    }

    /// An object column of type `_token` plus its first field.
    pub fn insert_unkeyed_state_object_type_with_field(
        &mut self,
        parent: &ColumnId,
        index: usize,
        object_name: &str,
        field_name: &str,
        specified_type: Type,
    ) -> Result<(ColumnId, ColumnId)> {
        let object = self.define_column(parent, index, ColumnSpec::object(object_name))?;
        let field = self.define_column(&object, 0, ColumnSpec::field(field_name, specified_type))?;
        Ok((object, field))
    }

    pub fn change_column_field_name(&mut self, id: &ColumnId, field_name: Option<String>) -> Result<()> {
        not_root(id)?;
        let col = self.column(id)?;
        if col.field_name == field_name {
            return Ok(());
        }
        if let (Some(parent), Some(name)) = (&col.parent, &field_name) {
            self.check_name_clash(parent, name)?;
        }
        self.schema.column_mut(id)?.field_name = field_name;
        self.invalidate_schema_cache();
        Ok(())
    }

    pub fn change_column_object_name(&mut self, id: &ColumnId, object_name: Option<String>) -> Result<()> {
        not_root(id)?;
        let col = self.column(id)?;
        if col.object_name == object_name {
            return Ok(());
        }
        if !col.is_object && object_name.is_some() {
            return Err(SheetError::ObjectNameRequiresObject);
        }
        if let (Some(parent), Some(name)) = (&col.parent, &object_name) {
            self.check_name_clash(parent, name)?;
        }
        self.schema.column_mut(id)?.object_name = object_name;
        self.invalidate_schema_cache();
        Ok(())
    }

    /// Promote a field to an object type or demote an object type to a field.
    ///
    /// Promoting a state field gives each existing value a fresh token and
    /// moves the value into a new child field. Demoting a `_token` object
    /// folds its single simple field back into the column.
    pub fn change_column_is_object(&mut self, id: &ColumnId, is_object: bool) -> Result<()> {
        not_root(id)?;
        let col = self.column(id)?.clone();
        if col.is_object == is_object {
            return Ok(());
        }
        if is_object {
            if col.formula.is_some() {
                self.schema.column_mut(id)?.is_object = true;
            } else {
                self.promote_state_field(&col)?;
            }
        } else if col.specified_type == Some(Type::Token) {
            self.demote_token_object(&col)?;
        } else {
            if !col.children.is_empty() {
                return Err(SheetError::HasChildren(
                    "Please delete all child columns first.".to_string(),
                ));
            }
            let column = self.schema.column_mut(id)?;
            column.is_object = false;
            column.object_name = None;
        }
        self.invalidate_schema_cache();
        Ok(())
    }

    fn promote_state_field(&mut self, col: &Column) -> Result<()> {
        let object_name = self.next_available_column_name("Object");
        self.invalidate_schema_cache();
        let column = self.schema.column_mut(&col.id)?;
        column.specified_type = Some(Type::Token);
        column.is_object = true;
        column.object_name = Some(object_name);
        column.field_name = None;

        let child_id = ColumnId::random();
        let mut child = Column::new(child_id.clone(), col.id.clone());
        child.field_name = col.field_name.clone();
        child.specified_type = col.specified_type.clone();
        self.schema.insert(child, 0)?;

        for (family, record) in self.store.select(FamilyFilter::Column(&col.id)) {
            let mut tokens = BTreeSet::new();
            for value in record.values_or_empty() {
                let token = Value::new_token();
                let cell = family.parent.child(token.clone());
                self.store.set(
                    QFamilyId::new(child_id.clone(), cell),
                    FamilyRecord::with_values([value.clone()].into_iter().collect()),
                );
                tokens.insert(token);
            }
            self.store.set(family, FamilyRecord::with_values(tokens));
        }
        debug!(column = %col.id, field = %child_id, "promoted field to object");
        Ok(())
    }

    fn demote_token_object(&mut self, col: &Column) -> Result<()> {
        let [child_id] = col.children.as_slice() else {
            return Err(SheetError::HasChildren(
                "Object must have a single field before converting to values.".to_string(),
            ));
        };
        let child = self.column(child_id)?.clone();
        if child.is_object || !child.children.is_empty() {
            let name = child
                .object_name
                .clone()
                .or_else(|| child.field_name.clone())
                .unwrap_or_else(|| "(unnamed)".to_string());
            return Err(SheetError::ComplexValue(name));
        }
        let child_type = self.column_type(child_id)?;
        for (family, record) in self.store.select(FamilyFilter::Column(&col.id)) {
            let mut values = BTreeSet::new();
            for token in record.values_or_empty() {
                let cell = family.parent.child(token.clone());
                if let Some(inner) = self.store.get(&QFamilyId::new(child_id.clone(), cell)) {
                    values.extend(inner.values_or_empty().cloned());
                }
            }
            self.store.set(family, FamilyRecord::with_values(values));
        }
        self.store.delete_where(FamilyFilter::Column(child_id));
        let column = self.schema.column_mut(&col.id)?;
        column.is_object = false;
        column.object_name = None;
        column.specified_type = Some(child_type);
        column.field_name = child.field_name;
        column.children.clear();
        self.schema.forget(child_id);
        debug!(column = %col.id, "demoted object to field");
        Ok(())
    }

    /// Change the declared type, re-parsing state values through their text.
    /// Values that do not parse as the new type are dropped.
    pub fn change_column_specified_type(&mut self, id: &ColumnId, specified_type: Option<Type>) -> Result<()> {
        not_root(id)?;
        let col = self.column(id)?.clone();
        if col.specified_type == specified_type {
            return Ok(());
        }
        if (col.specified_type == Some(Type::Token)) != (specified_type == Some(Type::Token)) {
            return Err(SheetError::ChangeTypeToken);
        }
        let mut reparsed = Vec::new();
        if col.formula.is_none() {
            if col.is_object {
                return Err(SheetError::ChangeKeyedObjectType);
            }
            let (Some(old_type), Some(new_type)) = (&col.specified_type, &specified_type) else {
                return Err(SheetError::TypeRequired);
            };
            let mut ev = self.evaluator();
            for (family, record) in ev.store.select(FamilyFilter::Column(id)) {
                let mut values = BTreeSet::new();
                for value in record.values_or_empty() {
                    let parsed = value_to_text(&mut ev, old_type, value)
                        .and_then(|text| parse_value(&mut ev, new_type, &text));
                    if let Ok(parsed) = parsed {
                        values.insert(parsed);
                    }
                }
                reparsed.push((family, values));
            }
        }
        self.invalidate_schema_cache();
        self.schema.column_mut(id)?.specified_type = specified_type;
        for (family, values) in reparsed {
            self.store.set(family, FamilyRecord::with_values(values));
        }
        Ok(())
    }

    /// Turn a state column into a formula column or back.
    ///
    /// A new state column keeps the values last computed for it, pinned to
    /// the computed type; failed families become empty.
    pub fn change_column_formula(&mut self, id: &ColumnId, formula: Option<Formula>) -> Result<()> {
        not_root(id)?;
        if let Some(formula) = &formula {
            validate_column_formula(formula)?;
        }
        let col = self.column(id)?.clone();
        match (&col.formula, &formula) {
            (None, Some(_)) => {
                for child in &col.children {
                    if self.column(child)?.formula.is_none() {
                        return Err(SheetError::StateUnderFormula);
                    }
                }
                self.schema.column_mut(id)?.specified_type = None;
            }
            (Some(_), None) => {
                let parent = col.parent.clone().ok_or(SheetError::ModifyRootColumn)?;
                if self.column(&parent)?.formula.is_some() {
                    return Err(SheetError::StateUnderFormula);
                }
                let ty = match self.column_type(id)? {
                    Type::Empty | Type::Error => DEFAULT_STATE_FIELD_TYPE,
                    ty => ty,
                };
                self.evaluate_all()?;
                for (family, record) in self.store.select(FamilyFilter::Column(id)) {
                    if record.error.is_some() {
                        self.store.set(family, FamilyRecord::with_values(BTreeSet::new()));
                    }
                }
                self.schema.column_mut(id)?.specified_type = Some(ty);
            }
            _ => {}
        }
        self.schema.column_mut(id)?.formula = formula;
        self.invalidate_schema_cache();
        Ok(())
    }

    pub fn change_column_reference_display_column(
        &mut self,
        id: &ColumnId,
        display: Option<ColumnId>,
    ) -> Result<()> {
        not_root(id)?;
        self.schema.column_mut(id)?.reference_display_column = display;
        self.invalidate_schema_cache();
        Ok(())
    }

    /// Move a column to position `new_index` among its siblings.
    pub fn reorder_column(&mut self, id: &ColumnId, new_index: usize) -> Result<()> {
        not_root(id)?;
        let parent = self
            .column(id)?
            .parent
            .clone()
            .ok_or(SheetError::ModifyRootColumn)?;
        let siblings = &mut self.schema.column_mut(&parent)?.children;
        if new_index >= siblings.len() {
            return Err(SheetError::IndexOutOfRange);
        }
        siblings.retain(|c| c != id);
        siblings.insert(new_index, id.clone());
        self.invalidate_schema_cache();
        Ok(())
    }

    /// Reparent a column subtree that holds no state data.
    pub fn move_column(&mut self, id: &ColumnId, new_parent: &ColumnId, index: usize) -> Result<()> {
        not_root(id)?;
        let col = self.column(id)?.clone();
        let target = self.column(new_parent)?;
        if self.schema.is_ancestor(id, new_parent) {
            return Err(SheetError::validation(
                "Cannot move a column into its own subtree.",
            ));
        }
        if !target.is_object {
            return Err(SheetError::validation("The new parent must be an object column."));
        }
        let subtree: Vec<ColumnId> = self
            .schema
            .all_columns()
            .into_iter()
            .filter(|c| self.schema.is_ancestor(id, c))
            .collect();
        let has_state = subtree
            .iter()
            .any(|c| self.schema.get(c).is_some_and(|c| c.is_state()));
        if has_state && target.formula.is_some() {
            return Err(SheetError::StateUnderFormula);
        }
        let same_parent = col.parent.as_ref() == Some(new_parent);
        let limit = target.children.len() - usize::from(same_parent);
        if index > limit {
            return Err(SheetError::IndexOutOfRange);
        }
        for c in &subtree {
            let stored = self.store.select(FamilyFilter::Column(c));
            if self.schema.get(c).is_some_and(|c| c.is_state())
                && stored.iter().any(|(_, r)| r.values_or_empty().next().is_some())
            {
                return Err(SheetError::validation(
                    "Cannot move a column that holds state data.",
                ));
            }
        }

        self.invalidate_schema_cache();
        for c in &subtree {
            self.store.delete_where(FamilyFilter::Column(c));
        }
        if let Some(old_parent) = &col.parent {
            self.schema.column_mut(old_parent)?.children.retain(|c| c != id);
        }
        self.schema
            .column_mut(new_parent)?
            .children
            .insert(index, id.clone());
        self.schema.column_mut(id)?.parent = Some(new_parent.clone());
        debug!(column = %id, parent = %new_parent, "moved column");
        Ok(())
    }

    /// Delete a leaf column and all of its families.
    pub fn delete_column(&mut self, id: &ColumnId) -> Result<()> {
        not_root(id)?;
        if !self.column(id)?.children.is_empty() {
            return Err(SheetError::HasChildren(
                "Please delete all child columns first.".to_string(),
            ));
        }
        self.invalidate_schema_cache();
        self.store.delete_where(FamilyFilter::Column(id));
        self.schema.remove(id)?;
        debug!(column = %id, "deleted column");
        Ok(())
    }

    /// The cell that a state column's values live under, for data editing.
    pub(crate) fn state_column(&self, id: &ColumnId) -> Result<&Column> {
        let col = self.column(id)?;
        if !col.is_state() {
            return Err(SheetError::NotAStateColumn(id.clone()));
        }
        Ok(col)
    }

    pub(crate) fn check_cell_address(&self, column: &ColumnId, parent: &CellId) -> Result<()> {
        let depth = self.schema.column_depth(column)?;
        if parent.len() + 1 != depth {
            return Err(SheetError::BadCellAddress(format!(
                "{} has {} steps, column '{}' needs {}",
                parent,
                parent.len(),
                column,
                depth.saturating_sub(1)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet_with_person() -> (Sheet, ColumnId, ColumnId) {
        let mut sheet = Sheet::new();
        let (person, name) = sheet
            .insert_unkeyed_state_object_type_with_field(&ColumnId::root(), 0, "Person", "name", Type::Text)
            .unwrap();
        (sheet, person, name)
    }

    #[test]
    fn test_define_column_checks() {
        let (mut sheet, person, _) = sheet_with_person();
        assert!(matches!(
            sheet.define_column(&person, 5, ColumnSpec::field("age", Type::Number)),
            Err(SheetError::IndexOutOfRange)
        ));
        let mut spec = ColumnSpec::field("age", Type::Number);
        spec.object_name = Some("Age".into());
        assert!(matches!(
            sheet.define_column(&person, 0, spec),
            Err(SheetError::ObjectNameRequiresObject)
        ));
        let mut untyped = ColumnSpec::field("age", Type::Number);
        untyped.specified_type = None;
        assert!(matches!(
            sheet.define_column(&person, 0, untyped),
            Err(SheetError::TypeRequired)
        ));
        assert!(matches!(
            sheet.define_column(&ColumnId::new("nope"), 0, ColumnSpec::field("x", Type::Text)),
            Err(SheetError::NoSuchColumn(_))
        ));
    }

    #[test]
    fn test_state_under_formula() {
        let (mut sheet, person, _) = sheet_with_person();
        let mut spec = ColumnSpec::computed("everyone", Formula::Dummy);
        spec.is_object = true;
        let computed = sheet.define_column(&ColumnId::root(), 1, spec).unwrap();
        assert!(matches!(
            sheet.define_column(&computed, 0, ColumnSpec::field("x", Type::Text)),
            Err(SheetError::StateUnderFormula)
        ));
        assert!(matches!(
            sheet.change_column_formula(&person, Some(Formula::Dummy)),
            Err(SheetError::StateUnderFormula)
        ));
    }

    #[test]
    fn test_root_is_read_only() {
        let mut sheet = Sheet::new();
        let root = ColumnId::root();
        assert!(matches!(
            sheet.change_column_field_name(&root, Some("x".into())),
            Err(SheetError::ModifyRootColumn)
        ));
        assert!(matches!(sheet.delete_column(&root), Err(SheetError::ModifyRootColumn)));
    }

    #[test]
    fn test_name_clash() {
        let (mut sheet, person, name) = sheet_with_person();
        let age = sheet
            .define_column(&person, 1, ColumnSpec::field("age", Type::Number))
            .unwrap();
        match sheet.change_column_field_name(&age, Some("name".into())) {
            Err(SheetError::NameClash(message)) => {
                assert_eq!(message, "Object 'Person' already has a child named 'name'")
            }
            other => panic!("expected a name clash, got {:?}", other),
        }
        sheet.change_column_field_name(&name, Some("fullName".into())).unwrap();
        sheet.change_column_field_name(&age, Some("name".into())).unwrap();
    }

    #[test]
    fn test_define_under_field_promotes_it() {
        let (mut sheet, person, name) = sheet_with_person();
        let nickname = sheet
            .define_column(&name, 0, ColumnSpec::field("nickname", Type::Text))
            .unwrap();
        let promoted = sheet.schema().column(&name).unwrap();
        assert!(promoted.is_object);
        assert_eq!(promoted.object_name.as_deref(), Some("Object1"));
        assert_eq!(promoted.children.len(), 2);
        assert_eq!(promoted.children[1], nickname);
        assert_eq!(sheet.schema().column(&person).unwrap().children, vec![name]);
    }

    #[test]
    fn test_delete_column_needs_no_children() {
        let (mut sheet, person, name) = sheet_with_person();
        assert!(matches!(sheet.delete_column(&person), Err(SheetError::HasChildren(_))));
        sheet.delete_column(&name).unwrap();
        sheet.delete_column(&person).unwrap();
        assert_eq!(sheet.schema().len(), 1);
    }

    #[test]
    fn test_reorder_and_move() {
        let (mut sheet, person, name) = sheet_with_person();
        let age = sheet
            .define_column(&person, 1, ColumnSpec::field("age", Type::Number))
            .unwrap();
        sheet.reorder_column(&age, 0).unwrap();
        assert_eq!(sheet.schema().column(&person).unwrap().children, vec![age.clone(), name.clone()]);
        assert!(matches!(sheet.reorder_column(&age, 2), Err(SheetError::IndexOutOfRange)));

        sheet.move_column(&age, &ColumnId::root(), 1).unwrap();
        assert_eq!(sheet.schema().column(&age).unwrap().parent, Some(ColumnId::root()));
        assert!(sheet.move_column(&person, &name, 0).is_err());
    }

    #[test]
    fn test_change_type_to_or_from_token() {
        let (mut sheet, person, name) = sheet_with_person();
        assert!(matches!(
            sheet.change_column_specified_type(&name, Some(Type::Token)),
            Err(SheetError::ChangeTypeToken)
        ));
        assert!(matches!(
            sheet.change_column_specified_type(&person, Some(Type::Text)),
            Err(SheetError::ChangeTypeToken)
        ));
    }
}
