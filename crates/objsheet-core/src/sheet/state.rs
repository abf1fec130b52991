use std::collections::BTreeMap;

use objsheet_engine::engine::text::tset_to_text_ignore_errors;
use objsheet_engine::engine::{
    CellId, ColumnId, Evaluator, Formula, FormulaEngine, MemoryStore, Procedure, QFamilyId,
    Schema, Settings, Type, TypedSet, Value, VarTypes, VarValues, evaluate_formula, parse_formula,
    stringify_formula, typecheck_formula,
};
use tracing::debug;

use crate::error::Result;

/// One objsheet document.
#[derive(Debug)]
pub struct Sheet {
    /// The column tree
    pub(crate) schema: Schema,
    /// State families and cached computed families. Clones share the map.
    pub(crate) store: MemoryStore,
    /// Column types, typecheck errors and compiled routines
    pub(crate) engine: FormulaEngine,
    /// Procedures by name
    pub(crate) procedures: BTreeMap<String, Procedure>,
    pub(crate) settings: Settings,
}

impl Sheet {
    /// An empty sheet holding only the root column.
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Sheet {
            schema: Schema::new(),
            store: MemoryStore::new(),
            engine: FormulaEngine::new(),
            procedures: BTreeMap::new(),
            settings,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Change settings. Compiled routines are rebuilt on the next typecheck.
    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
        self.invalidate_schema_cache();
    }

    pub(crate) fn evaluator(&mut self) -> Evaluator<'_, MemoryStore> {
        Evaluator::new(&self.schema, &mut self.engine, &mut self.store, &self.settings)
    }

    pub fn invalidate_schema_cache(&mut self) {
        self.evaluator().invalidate_schema_cache();
    }

    pub fn invalidate_data_cache(&mut self) {
        self.evaluator().invalidate_data_cache();
    }

    /// Typecheck every column and evaluate every reachable family.
    pub fn evaluate_all(&mut self) -> Result<()> {
        self.evaluator().evaluate_all()?;
        debug!(families = self.store.len(), "evaluated sheet");
        Ok(())
    }

    /// The type of a column, as other formulas see it.
    pub fn column_type(&mut self, column: &ColumnId) -> Result<Type> {
        Ok(self.evaluator().typecheck_column(column)?)
    }

    /// The typecheck error of a formula column, if any.
    pub fn typecheck_error(&mut self, column: &ColumnId) -> Result<Option<String>> {
        self.evaluator().typecheck_column(column)?;
        Ok(self.engine.typecheck_error(column).map(str::to_string))
    }

    /// Values of one family, evaluating it if needed. `None` if it failed.
    pub fn family(&mut self, column: &ColumnId, parent: &CellId) -> Result<Option<TypedSet>> {
        let family = QFamilyId::new(column.clone(), parent.clone());
        Ok(self.evaluator().evaluate_family(&family)?)
    }

    /// The error message of a failed family.
    pub fn family_error(&self, column: &ColumnId, parent: &CellId) -> Option<String> {
        self.store
            .get(&QFamilyId::new(column.clone(), parent.clone()))
            .and_then(|r| r.error)
    }

    /// Every live cell of a column.
    pub fn cells(&mut self, column: &ColumnId) -> Result<Vec<CellId>> {
        Ok(self.evaluator().all_cell_ids_in_column(column)?)
    }

    /// Parse a formula evaluated in the cells of object column `context`.
    pub fn parse_formula_at(&mut self, context: &ColumnId, text: &str) -> Result<Formula> {
        let this_type = Type::Reference(context.clone());
        Ok(parse_formula(&mut self.evaluator(), &this_type, text)?)
    }

    pub fn stringify_formula_at(&mut self, context: &ColumnId, formula: &Formula) -> Result<String> {
        let this_type = Type::Reference(context.clone());
        Ok(stringify_formula(&mut self.evaluator(), &this_type, formula)?)
    }

    /// Parse, typecheck and evaluate an ad-hoc formula at the root cell.
    /// Returns the result and its display text.
    pub fn evaluate_formula_text(&mut self, text: &str) -> Result<(TypedSet, String)> {
        let root = ColumnId::root();
        let formula = self.parse_formula_at(&root, text)?;
        let mut ev = self.evaluator();
        let this_type = Type::Reference(root.clone());
        typecheck_formula(
            &mut ev,
            &VarTypes::unit("this".to_string(), this_type.clone()),
            &formula,
        )?;
        let vars = VarValues::unit(
            "this".to_string(),
            TypedSet::singleton(this_type, Value::Ref(CellId::root())),
        );
        let result = evaluate_formula(&mut ev, &vars, &formula)?;
        let text = tset_to_text_ignore_errors(&mut ev, &result);
        Ok((result, text))
    }
}

impl Default for Sheet {
    fn default() -> Self {
        Self::new()
    }
}
