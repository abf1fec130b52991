//! Per-sheet caches and the evaluation context handed to every formula.
//!
//! [`FormulaEngine`] owns what is derived from the schema: column types,
//! typecheck errors, the levels-up memo and compiled routines. Computed
//! families are cached in the [`FamilyStore`] itself, next to state data.
//!
//! [`Evaluator`] borrows the schema, the caches and a store for the length of
//! one operation.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::compiler::{CompiledFormula, compile, is_compilation_supported};
use super::formula::{VarTypes, evaluate_formula, typecheck_formula};
use super::schema::Schema;
use super::store::{FamilyFilter, FamilyRecord, FamilyStore};
use super::types::{Type, TypedSet, common_supertype};
use super::value::{CellId, ColumnId, QFamilyId, Value};
use crate::error::{EngineError, Result, evaluation, internal, validation};

/// Engine settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Compile supported column formulas instead of interpreting them.
    pub compiler: bool,
}

/// Schema-derived caches. Cleared by [`Evaluator::invalidate_schema_cache`].
#[derive(Debug, Default, Clone)]
pub struct FormulaEngine {
    types: HashMap<ColumnId, Type>,
    typecheck_errors: HashMap<ColumnId, String>,
    levels_up: HashMap<(ColumnId, ColumnId), usize>,
    compiled: HashMap<ColumnId, Arc<CompiledFormula>>,
}

impl FormulaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached type of a column, if it has been typechecked.
    pub fn column_type(&self, id: &ColumnId) -> Option<&Type> {
        self.types.get(id)
    }

    pub fn typecheck_error(&self, id: &ColumnId) -> Option<&str> {
        self.typecheck_errors.get(id).map(String::as_str)
    }

    pub fn is_compiled(&self, id: &ColumnId) -> bool {
        self.compiled.contains_key(id)
    }

    fn clear(&mut self) {
        self.types.clear();
        self.typecheck_errors.clear();
        self.levels_up.clear();
        self.compiled.clear();
    }
}

/// Everything a formula, procedure or compiled routine needs to run.
pub struct Evaluator<'a, S: FamilyStore> {
    pub schema: &'a Schema,
    pub engine: &'a mut FormulaEngine,
    pub store: &'a mut S,
    pub settings: &'a Settings,
}

impl<'a, S: FamilyStore> Evaluator<'a, S> {
    pub fn new(
        schema: &'a Schema,
        engine: &'a mut FormulaEngine,
        store: &'a mut S,
        settings: &'a Settings,
    ) -> Self {
        Evaluator {
            schema,
            engine,
            store,
            settings,
        }
    }

    /// Type of a column, typechecking its formula on first use.
    ///
    /// The cache entry is written before the formula is checked, so a formula
    /// that reaches its own column sees `error` and fails validation instead
    /// of recursing.
    pub fn typecheck_column(&mut self, id: &ColumnId) -> Result<Type> {
        if let Some(ty) = self.engine.types.get(id) {
            return Ok(ty.clone());
        }
        let schema = self.schema;
        let Some(col) = schema.get(id) else {
            return Ok(Type::Error);
        };
        let mut ty = col.specified_type.clone().unwrap_or(Type::Error);
        self.engine.types.insert(id.clone(), ty.clone());

        if let Some(formula) = &col.formula {
            let parent = col
                .parent
                .clone()
                .ok_or_else(|| internal("formula column without a parent"))?;
            let vars = VarTypes::unit("this".to_string(), Type::Reference(parent));
            match typecheck_formula(self, &vars, formula) {
                Ok(computed) => {
                    match &col.specified_type {
                        Some(specified) => {
                            if common_supertype(specified, &computed) != *specified {
                                let message = format!(
                                    "Column '{}' formula returns '{}', which is not convertible to the specified type '{}'",
                                    schema.stringify_column_ref(&super::schema::ColumnRef::new(id.clone(), !col.is_object)),
                                    schema.stringify_type(&computed),
                                    schema.stringify_type(specified),
                                );
                                debug!(column = %id, %message, "typecheck failed");
                                self.engine.typecheck_errors.insert(id.clone(), message);
                            }
                        }
                        None => ty = computed,
                    }
                    self.engine.types.insert(id.clone(), ty.clone());
                    if self.settings.compiler
                        && !self.engine.typecheck_errors.contains_key(id)
                        && is_compilation_supported(formula)
                    {
                        let routine = compile(self, &vars, formula)?;
                        debug!(column = %id, "compiled formula");
                        self.engine.compiled.insert(id.clone(), Arc::new(routine));
                    }
                }
                Err(EngineError::Validation(e)) => {
                    debug!(column = %id, message = %e, "typecheck failed");
                    self.engine.typecheck_errors.insert(id.clone(), e.0);
                }
                Err(other) => return Err(other),
            }
        }
        debug!(column = %id, ty = %ty, "typechecked column");
        Ok(ty)
    }

    pub fn typecheck_all(&mut self) -> Result<()> {
        for id in self.schema.all_columns() {
            self.typecheck_column(&id)?;
        }
        Ok(())
    }

    /// Number of key segments dropped navigating up from `start` to `target`.
    pub fn levels_up(&mut self, start: &ColumnId, target: &ColumnId) -> Result<usize> {
        let key = (start.clone(), target.clone());
        if let Some(n) = self.engine.levels_up.get(&key) {
            return Ok(*n);
        }
        let (up_path, _) = self.schema.find_common_ancestor_paths(start, target)?;
        let n = up_path.len() - 1;
        self.engine.levels_up.insert(key, n);
        Ok(n)
    }

    /// Stored values of a family, without evaluating anything.
    pub fn read_family(&self, id: &QFamilyId) -> Option<BTreeSet<Value>> {
        self.store.find_one(id).and_then(|r| r.values)
    }

    /// Values of a family, computing and caching them if needed.
    ///
    /// Returns `None` if the family failed to evaluate or is being evaluated
    /// further up the stack.
    pub fn evaluate_family(&mut self, id: &QFamilyId) -> Result<Option<TypedSet>> {
        if self.store.find_one(id).is_none() {
            self.store.insert(id.clone(), FamilyRecord::placeholder());
            match self.evaluate_family1(id) {
                Ok(tset) => {
                    let mut values = Some(tset.set);
                    self.store.update(id, &mut |r| r.values = values.take());
                }
                Err(EngineError::Evaluation(e)) => {
                    let mut message = Some(e.0);
                    self.store.update(id, &mut |r| r.error = message.take());
                }
                Err(other) => {
                    self.store.remove(id);
                    return Err(other);
                }
            }
        }
        match self.read_family(id) {
            Some(values) => Ok(Some(TypedSet::new(self.typecheck_column(&id.column)?, values))),
            None => Ok(None),
        }
    }

    fn evaluate_family1(&mut self, id: &QFamilyId) -> Result<TypedSet> {
        let schema = self.schema;
        let col = schema.column(&id.column)?;
        let ty = self.typecheck_column(&id.column)?;
        let Some(formula) = &col.formula else {
            return Ok(TypedSet::empty(ty));
        };
        if let Some(message) = self.engine.typecheck_errors.get(&id.column) {
            return Err(evaluation(format!(
                "Formula failed type checking: {}",
                message
            )));
        }
        if let Some(routine) = self.engine.compiled.get(&id.column).cloned() {
            return Ok(TypedSet::new(ty, routine.run(self, &id.parent)?));
        }
        let parent = col
            .parent
            .clone()
            .ok_or_else(|| internal("formula column without a parent"))?;
        let vars = im::HashMap::unit(
            "this".to_string(),
            TypedSet::singleton(Type::Reference(parent), Value::Ref(id.parent.clone())),
        );
        evaluate_formula(self, &vars, formula)
    }

    /// Evaluate every family reachable from the root.
    pub fn evaluate_all(&mut self) -> Result<()> {
        self.typecheck_all()?;
        self.evaluate_subtree(&ColumnId::root(), &CellId::root())
    }

    fn evaluate_subtree(&mut self, column: &ColumnId, cell: &CellId) -> Result<()> {
        let schema = self.schema;
        for child in schema.children_of(column)? {
            let family = QFamilyId::new(child.clone(), cell.clone());
            if let Some(tset) = self.evaluate_family(&family)? {
                for value in tset.set {
                    self.evaluate_subtree(child, &cell.child(value))?;
                }
            }
        }
        Ok(())
    }

    /// Every live cell of a column, skipping families that fail to evaluate.
    pub fn all_cell_ids_in_column(&mut self, column: &ColumnId) -> Result<Vec<CellId>> {
        if column.is_root() {
            return Ok(vec![CellId::root()]);
        }
        let parent = self
            .schema
            .column(column)?
            .parent
            .clone()
            .ok_or_else(|| internal("non-root column without a parent"))?;
        let mut out = Vec::new();
        for parent_cell in self.all_cell_ids_in_column(&parent)? {
            let family = QFamilyId::new(column.clone(), parent_cell.clone());
            if let Some(tset) = self.evaluate_family(&family)? {
                out.extend(tset.set.into_iter().map(|v| parent_cell.child(v)));
            }
        }
        Ok(out)
    }

    /// Drop every cached computed family. State families are untouched.
    pub fn invalidate_data_cache(&mut self) {
        let schema = self.schema;
        let mut removed = 0;
        for id in schema.column_ids() {
            if schema.get(&id).is_some_and(|c| c.is_computed()) {
                removed += self.store.remove_where(FamilyFilter::Column(&id));
            }
        }
        debug!(removed, "invalidated data cache");
    }

    pub fn invalidate_schema_cache(&mut self) {
        self.engine.clear();
        debug!("invalidated schema cache");
        self.invalidate_data_cache();
    }

    /// Remove a state cell, its state descendants, and its value in the parent family.
    pub fn recursive_delete_state_cell(&mut self, column: &ColumnId, cell: &CellId) -> Result<()> {
        let schema = self.schema;
        let col = schema.column(column)?;
        for child_id in &col.children {
            if !schema.column(child_id)?.is_state() {
                continue;
            }
            let family = QFamilyId::new(child_id.clone(), cell.clone());
            if let Some(values) = self.read_family(&family) {
                for value in values {
                    self.recursive_delete_state_cell(child_id, &cell.child(value))?;
                }
            }
            self.store.remove(&family);
        }
        let Some(last) = cell.last_step().cloned() else {
            return Err(validation("Cannot delete the root cell."));
        };
        let family = QFamilyId::new(column.clone(), cell.parent());
        self.store.update(&family, &mut |r| {
            if let Some(values) = r.values.as_mut() {
                values.remove(&last);
            }
        });
        Ok(())
    }
}
