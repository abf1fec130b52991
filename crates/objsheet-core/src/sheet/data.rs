//! Direct editing of state data, and repair of damaged documents.

use std::collections::BTreeSet;

use objsheet_engine::engine::{
    CellId, ColumnId, FamilyFilter, FamilyRecord, Formula, QFamilyId, Type, Value, parse_value,
    validate_formula,
};
use objsheet_engine::engine::formula::wire::{formula_from_json, formula_to_json};
use tracing::{debug, warn};

use super::Sheet;
use crate::error::{Result, SheetError};

fn value_fits(ty: &Type, value: &Value) -> bool {
    matches!(
        (ty, value),
        (Type::Text, Value::Text(_))
            | (Type::Number, Value::Number(_))
            | (Type::Bool, Value::Bool(_))
            | (Type::Date, Value::Date(_))
            | (Type::Token, Value::Token(_))
            | (Type::Unit, Value::Unit)
            | (Type::Reference(_), Value::Ref(_))
    )
}

/// Every column id a formula mentions.
fn referenced_columns(formula: &Formula, out: &mut BTreeSet<ColumnId>) {
    match formula {
        Formula::Up { column, .. } | Formula::Down { column, .. } => {
            out.insert(column.clone());
        }
        Formula::Lit {
            ty: Type::Reference(column),
            ..
        } => {
            out.insert(column.clone());
        }
        _ => {}
    }
    for (_, sub) in formula.subformulas() {
        referenced_columns(sub, out);
    }
}

impl Sheet {
    fn checked_state_family(&self, column: &ColumnId, parent: &CellId) -> Result<(QFamilyId, Type)> {
        let col = self.state_column(column)?;
        let ty = col
            .specified_type
            .clone()
            .ok_or(SheetError::TypeRequired)?;
        self.check_cell_address(column, parent)?;
        Ok((QFamilyId::new(column.clone(), parent.clone()), ty))
    }

    fn check_values<'v>(&self, ty: &Type, values: impl IntoIterator<Item = &'v Value>) -> Result<()> {
        for value in values {
            if !value_fits(ty, value) {
                return Err(SheetError::validation(format!(
                    "Value {:?} does not have type '{}'",
                    value,
                    self.schema.stringify_type(ty)
                )));
            }
        }
        Ok(())
    }

    /// Parse the text form of a value for a state column.
    pub fn parse_cell_value(&mut self, column: &ColumnId, text: &str) -> Result<Value> {
        let ty = self
            .state_column(column)?
            .specified_type
            .clone()
            .ok_or(SheetError::TypeRequired)?;
        Ok(parse_value(&mut self.evaluator(), &ty, text)?)
    }

    /// Replace the values of one state family.
    pub fn write_state_family(
        &mut self,
        column: &ColumnId,
        parent: &CellId,
        values: BTreeSet<Value>,
    ) -> Result<()> {
        let (family, ty) = self.checked_state_family(column, parent)?;
        self.check_values(&ty, &values)?;
        self.invalidate_data_cache();
        let placeholders = self.store.get(&family).map_or(0, |r| r.num_placeholders);
        let mut record = FamilyRecord::with_values(values);
        record.num_placeholders = placeholders;
        self.store.set(family, record);
        Ok(())
    }

    /// Add one value to a state family. Adding a present value does nothing.
    pub fn add_state_value(&mut self, column: &ColumnId, parent: &CellId, value: Value) -> Result<CellId> {
        let (family, ty) = self.checked_state_family(column, parent)?;
        self.check_values(&ty, [&value])?;
        self.invalidate_data_cache();
        let cell = parent.child(value.clone());
        let inserted = self.store.modify(&family, &mut |r| {
            r.values.get_or_insert_with(BTreeSet::new).insert(value.clone());
        });
        if !inserted {
            self.store
                .set(family, FamilyRecord::with_values([value].into_iter().collect()));
        }
        Ok(cell)
    }

    /// Add a fresh object to a `_token` state column and return its cell.
    pub fn new_object(&mut self, column: &ColumnId, parent: &CellId) -> Result<CellId> {
        let (_, ty) = self.checked_state_family(column, parent)?;
        if ty != Type::Token {
            return Err(SheetError::validation(format!(
                "Column '{}' is keyed by '{}', not '_token'",
                column,
                self.schema.stringify_type(&ty)
            )));
        }
        let cell = self.add_state_value(column, parent, Value::new_token())?;
        debug!(%column, %cell, "new object");
        Ok(cell)
    }

    /// Delete a state cell with all state data under it.
    pub fn delete_state_cell(&mut self, column: &ColumnId, cell: &CellId) -> Result<()> {
        self.state_column(column)?;
        if cell.is_empty() {
            return Err(SheetError::BadCellAddress("the root cell".to_string()));
        }
        self.check_cell_address(column, &cell.parent())?;
        let mut ev = self.evaluator();
        ev.invalidate_data_cache();
        ev.recursive_delete_state_cell(column, cell)?;
        Ok(())
    }

    /// Blank rows to show under a family in an editing surface.
    pub fn set_num_placeholders(&mut self, column: &ColumnId, parent: &CellId, n: u32) -> Result<()> {
        let (family, _) = self.checked_state_family(column, parent)?;
        let found = self.store.modify(&family, &mut |r| r.num_placeholders = n);
        if !found {
            let mut record = FamilyRecord::with_values(BTreeSet::new());
            record.num_placeholders = n;
            self.store.set(family, record);
        }
        Ok(())
    }

    /// Bring a damaged document back to a consistent state.
    ///
    /// Drops columns cut off from the tree, child links to missing columns,
    /// and state families no live cell owns. Formulas that do not survive a
    /// trip through their stored form, fail scoping, or mention missing
    /// columns are replaced by an empty formula.
    /// Returns the number of things fixed.
    pub fn repair(&mut self) -> usize {
        let mut fixed = 0;

        let orphans: Vec<ColumnId> = self
            .schema
            .column_ids()
            .into_iter()
            .filter(|id| !id.is_root())
            .filter(|id| {
                let Ok(chain) = self.schema.ancestors(id) else {
                    return true;
                };
                chain.last().is_none_or(|top| !top.is_root())
            })
            .collect();
        for id in &orphans {
            warn!(column = %id, "removing orphaned column");
            self.schema.forget(id);
            fixed += 1;
        }
        for id in self.schema.column_ids() {
            let missing: Vec<ColumnId> = self
                .schema
                .children_of(&id)
                .unwrap_or_default()
                .iter()
                .filter(|c| {
                    self.schema
                        .get(c)
                        .is_none_or(|child| child.parent.as_ref() != Some(&id))
                })
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            if let Ok(col) = self.schema.column_mut(&id) {
                col.children.retain(|c| !missing.contains(c));
            }
            warn!(column = %id, dropped = missing.len(), "removed dangling child links");
            fixed += missing.len();
        }

        let this = im::HashSet::unit("this".to_string());
        for id in self.schema.column_ids() {
            let Some(formula) = self.schema.get(&id).and_then(|c| c.formula.clone()) else {
                continue;
            };
            let mut columns = BTreeSet::new();
            referenced_columns(&formula, &mut columns);
            let stored = formula_from_json(&formula_to_json(&formula));
            let scoping = validate_formula(&this, &formula);
            let missing = columns.iter().find(|c| !self.schema.contains(c));
            if stored.is_ok() && scoping.is_ok() && missing.is_none() {
                continue;
            }
            warn!(column = %id, "resetting broken formula");
            if let Ok(col) = self.schema.column_mut(&id) {
                col.formula = Some(Formula::Dummy);
                col.specified_type = None;
            }
            fixed += 1;
        }

        let live = self.live_state_families();
        for (family, _) in self.store.select(FamilyFilter::All) {
            let computed = self
                .schema
                .get(&family.column)
                .is_some_and(|c| c.is_computed());
            if !computed && !live.contains(&family) {
                self.store.delete(&family);
                fixed += 1;
            }
        }

        self.invalidate_schema_cache();
        if fixed > 0 {
            warn!(fixed, "repaired sheet");
        }
        fixed
    }

    /// State families reachable from the root through stored values.
    fn live_state_families(&self) -> BTreeSet<QFamilyId> {
        let mut live = BTreeSet::new();
        let mut pending = vec![(ColumnId::root(), CellId::root())];
        while let Some((column, cell)) = pending.pop() {
            for child in self.schema.children_of(&column).unwrap_or_default() {
                if !self.schema.get(child).is_some_and(|c| c.is_state()) {
                    continue;
                }
                let family = QFamilyId::new(child.clone(), cell.clone());
                if let Some(record) = self.store.get(&family) {
                    for value in record.values_or_empty() {
                        pending.push((child.clone(), cell.child(value.clone())));
                    }
                    live.insert(family);
                }
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::ColumnSpec;
    use rstest::rstest;

    #[rstest]
    #[case(Type::Text, Value::text("a"), true)]
    #[case(Type::Number, Value::text("1"), false)]
    #[case(Type::Number, Value::number(1.0), true)]
    #[case(Type::Reference(ColumnId::new("x")), Value::Ref(CellId::root()), true)]
    #[case(Type::Token, Value::Unit, false)]
    #[case(Type::Bool, Value::Bool(false), true)]
    fn test_value_fits(#[case] ty: Type, #[case] value: Value, #[case] expected: bool) {
        assert_eq!(value_fits(&ty, &value), expected);
    }

    fn people() -> (Sheet, ColumnId, ColumnId) {
        let mut sheet = Sheet::new();
        let (person, name) = sheet
            .insert_unkeyed_state_object_type_with_field(&ColumnId::root(), 0, "Person", "name", Type::Text)
            .unwrap();
        (sheet, person, name)
    }

    #[test]
    fn test_new_object_and_fields() {
        let (mut sheet, person, name) = people();
        let alice = sheet.new_object(&person, &CellId::root()).unwrap();
        sheet.add_state_value(&name, &alice, Value::text("Alice")).unwrap();
        let names = sheet.family(&name, &alice).unwrap().unwrap();
        assert_eq!(names.single().unwrap(), &Value::text("Alice"));
        assert_eq!(sheet.cells(&person).unwrap(), vec![alice]);
    }

    #[test]
    fn test_write_checks_address_and_type() {
        let (mut sheet, person, name) = people();
        assert!(matches!(
            sheet.add_state_value(&name, &CellId::root(), Value::text("x")),
            Err(SheetError::BadCellAddress(_))
        ));
        let alice = sheet.new_object(&person, &CellId::root()).unwrap();
        assert!(matches!(
            sheet.add_state_value(&name, &alice, Value::number(3.0)),
            Err(SheetError::Validation(_))
        ));
        assert!(matches!(
            sheet.new_object(&name, &alice),
            Err(SheetError::Validation(_))
        ));
    }

    #[test]
    fn test_write_to_computed_column_fails() {
        let (mut sheet, _, _) = people();
        let total = sheet
            .define_column(&ColumnId::root(), 1, ColumnSpec::computed("total", Formula::number(1.0)))
            .unwrap();
        assert!(matches!(
            sheet.write_state_family(&total, &CellId::root(), BTreeSet::new()),
            Err(SheetError::NotAStateColumn(_))
        ));
    }

    #[test]
    fn test_delete_state_cell_removes_subtree() {
        let (mut sheet, person, name) = people();
        let alice = sheet.new_object(&person, &CellId::root()).unwrap();
        sheet.add_state_value(&name, &alice, Value::text("Alice")).unwrap();
        sheet.delete_state_cell(&person, &alice).unwrap();
        assert!(sheet.cells(&person).unwrap().is_empty());
        assert!(sheet.store().get(&QFamilyId::new(name, alice)).is_none());
    }

    #[test]
    fn test_promote_keeps_values() {
        let (mut sheet, person, name) = people();
        let alice = sheet.new_object(&person, &CellId::root()).unwrap();
        sheet.add_state_value(&name, &alice, Value::text("Alice")).unwrap();
        sheet.change_column_is_object(&name, true).unwrap();
        let field = sheet.schema().column(&name).unwrap().children[0].clone();
        let tokens = sheet.family(&name, &alice).unwrap().unwrap();
        let token = tokens.single().unwrap().clone();
        let inner = sheet.family(&field, &alice.child(token)).unwrap().unwrap();
        assert_eq!(inner.single().unwrap(), &Value::text("Alice"));

        sheet.change_column_is_object(&name, false).unwrap();
        let back = sheet.family(&name, &alice).unwrap().unwrap();
        assert_eq!(back.single().unwrap(), &Value::text("Alice"));
        assert!(!sheet.schema().contains(&field));
    }

    #[test]
    fn test_change_type_reparses_values() {
        let (mut sheet, person, name) = people();
        let alice = sheet.new_object(&person, &CellId::root()).unwrap();
        let values = [Value::text("42"), Value::text("forty")].into_iter().collect();
        sheet.write_state_family(&name, &alice, values).unwrap();
        sheet.change_column_specified_type(&name, Some(Type::Number)).unwrap();
        let family = sheet.family(&name, &alice).unwrap().unwrap();
        assert_eq!(family.single().unwrap(), &Value::number(42.0));
    }

    #[test]
    fn test_repair_drops_unreachable_and_broken() {
        let (mut sheet, person, name) = people();
        let alice = sheet.new_object(&person, &CellId::root()).unwrap();
        sheet.add_state_value(&name, &alice, Value::text("Alice")).unwrap();
        let ghost = CellId::root().child(Value::Token("ghost".into()));
        sheet.store().set(
            QFamilyId::new(name.clone(), ghost.clone()),
            FamilyRecord::with_values([Value::text("Boo")].into_iter().collect()),
        );
        let broken = sheet
            .define_column(&ColumnId::root(), 1, ColumnSpec::computed("broken", Formula::number(1.0)))
            .unwrap();
        sheet.schema.column_mut(&broken).unwrap().formula = Some(Formula::down(
            Formula::this(),
            ColumnId::new("gone"),
            None,
            true,
        ));

        assert_eq!(sheet.repair(), 2);
        assert!(sheet.store().get(&QFamilyId::new(name.clone(), ghost)).is_none());
        assert!(sheet.store().get(&QFamilyId::new(name, alice)).is_some());
        assert_eq!(sheet.schema().column(&broken).unwrap().formula, Some(Formula::Dummy));
        assert_eq!(sheet.repair(), 0);
    }

    #[test]
    fn test_repair_removes_detached_columns() {
        let (mut sheet, person, name) = people();
        let stray = sheet
            .define_column(&person, 1, ColumnSpec::field("nickname", Type::Text))
            .unwrap();
        sheet.schema.column_mut(&person).unwrap().children.retain(|c| c != &stray);
        sheet.schema.column_mut(&stray).unwrap().parent = Some(ColumnId::new("nowhere"));

        assert_eq!(sheet.repair(), 1);
        assert!(!sheet.schema().contains(&stray));
        assert!(sheet.schema().contains(&person));
        assert!(sheet.schema().contains(&name));
    }

    #[test]
    fn test_repair_resets_formula_without_stored_form() {
        let (mut sheet, _, _) = people();
        let column = sheet
            .define_column(&ColumnId::root(), 1, ColumnSpec::computed("weird", Formula::number(1.0)))
            .unwrap();
        // A number literal holding text cannot be written out and read back.
        sheet.schema.column_mut(&column).unwrap().formula = Some(Formula::Lit {
            ty: Type::Number,
            values: vec![Value::text("x")],
        });

        assert_eq!(sheet.repair(), 1);
        assert_eq!(sheet.schema().column(&column).unwrap().formula, Some(Formula::Dummy));
        assert_eq!(sheet.repair(), 0);
    }
}
