//! Sheet definition files.
//!
//! A definition is TOML with three arrays of tables, applied in order:
//!
//! ```toml
//! [[column]]
//! object = "Person"            # unkeyed object type
//!
//! [[column]]
//! parent = "Person"
//! field = "name"
//! type = "text"
//!
//! [[column]]
//! field = "adults"
//! formula = "{p : Person | p.age >= 18}"
//!
//! [[procedure]]
//! name = "addPerson"
//! params = [["who", "text", true]]
//! body = "let p = new $Person\np.name := who"
//!
//! [[data]]
//! column = "Person"
//! rows = [{ name = "Ann", age = 30 }]
//! ```
//!
//! A column may give its formula in stored JSON form instead, as
//! `formula_json = '["lit","number",[1]]'`; the two keys are exclusive.
//!
//! Formulas are attached after every column exists, so they may refer to
//! columns defined further down. Type names must refer to earlier columns.

use std::collections::BTreeSet;
use std::path::Path;

use objsheet_engine::engine::formula::wire::formula_from_str;
use objsheet_engine::engine::{CellId, Column, ColumnId, Formula, QFamilyId, Type, Value};
use serde::Deserialize;
use tracing::debug;

use super::{ColumnSpec, Sheet};
use crate::error::{Result, SheetError};

const MAX_DEFINITION_FILE_BYTES: u64 = 4 * 1_048_576;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
    #[serde(default)]
    column: Vec<ColumnEntry>,
    #[serde(default)]
    procedure: Vec<ProcedureEntry>,
    #[serde(default)]
    data: Vec<DataEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ColumnEntry {
    #[serde(default = "root_ref")]
    parent: String,
    field: Option<String>,
    object: Option<String>,
    #[serde(rename = "type")]
    ty: Option<String>,
    formula: Option<String>,
    formula_json: Option<String>,
    display: Option<String>,
}

impl ColumnEntry {
    fn has_formula(&self) -> bool {
        self.formula.is_some() || self.formula_json.is_some()
    }
}

fn root_ref() -> String {
    "$".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcedureEntry {
    name: String,
    #[serde(default)]
    params: Vec<(String, String, bool)>,
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataEntry {
    column: String,
    rows: Vec<toml::Value>,
}

fn scalar_text(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

impl Sheet {
    /// Load a definition file.
    pub fn load_definition(path: &Path) -> Result<Sheet> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_DEFINITION_FILE_BYTES {
            return Err(SheetError::definition(
                path.display().to_string(),
                format!("file is larger than {} bytes", MAX_DEFINITION_FILE_BYTES),
            ));
        }
        let content = std::fs::read_to_string(path)?;
        Sheet::from_definition_str(&content)
    }

    pub fn from_definition_str(content: &str) -> Result<Sheet> {
        let file: DefinitionFile = toml::from_str(content)?;
        let mut sheet = Sheet::new();

        let mut formulas = Vec::new();
        let mut displays = Vec::new();
        for (i, entry) in file.column.iter().enumerate() {
            let context = format!("column #{}", i + 1);
            let id = sheet
                .define_entry(entry)
                .map_err(|e| SheetError::definition(&context, e))?;
            if entry.has_formula() {
                formulas.push((context.clone(), id.clone(), entry));
            }
            if let Some(display) = &entry.display {
                displays.push((context, id, display.clone()));
            }
        }
        for (context, id, entry) in formulas {
            let parent = sheet.parent_of(&id)?;
            let formula = match (&entry.formula, &entry.formula_json) {
                (Some(text), _) => sheet.parse_formula_at(&parent, text),
                (None, Some(json)) => formula_from_str(json).map_err(SheetError::from),
                (None, None) => continue,
            };
            formula
                .and_then(|f| sheet.change_column_formula(&id, Some(f)))
                .map_err(|e| SheetError::definition(&context, e))?;
            debug!(column = %id, "attached formula");
        }
        for (context, id, display) in displays {
            let target = sheet
                .schema
                .children_of(&id)?
                .iter()
                .find(|c| {
                    sheet
                        .schema
                        .get(c)
                        .is_some_and(|c| c.field_name.as_deref() == Some(display.as_str()))
                })
                .cloned()
                .ok_or_else(|| {
                    SheetError::definition(&context, format!("no child field named '{}'", display))
                })?;
            sheet.change_column_reference_display_column(&id, Some(target))?;
        }

        for entry in &file.procedure {
            let params: Vec<_> = entry
                .params
                .iter()
                .map(|(name, ty, singular)| (name.as_str(), ty.as_str(), *singular))
                .collect();
            sheet
                .define_procedure(&entry.name, &params, &entry.body)
                .map_err(|e| SheetError::definition(format!("procedure '{}'", entry.name), e))?;
        }

        for entry in &file.data {
            let context = format!("data for '{}'", entry.column);
            sheet
                .load_data(entry)
                .map_err(|e| SheetError::definition(&context, e))?;
        }
        debug!(
            columns = sheet.schema.len(),
            procedures = sheet.procedures.len(),
            "loaded sheet definition"
        );
        Ok(sheet)
    }

    fn parent_of(&self, id: &ColumnId) -> Result<ColumnId> {
        self.schema
            .column(id)?
            .parent
            .clone()
            .ok_or(SheetError::ModifyRootColumn)
    }

    fn define_entry(&mut self, entry: &ColumnEntry) -> Result<ColumnId> {
        if entry.formula.is_some() && entry.formula_json.is_some() {
            return Err(SheetError::validation(
                "Give either 'formula' or 'formula_json', not both",
            ));
        }
        let parent = self.schema.parse_column_ref(&entry.parent)?.column;
        let is_object = entry.object.is_some();
        let specified_type = match (&entry.ty, is_object, entry.has_formula()) {
            (Some(ty), _, _) => Some(self.schema.parse_type_str(ty)?),
            (None, true, false) => Some(Type::Token),
            (None, _, _) => None,
        };
        let spec = ColumnSpec {
            field_name: entry.field.clone(),
            specified_type,
            is_object,
            object_name: entry.object.clone(),
            formula: entry.has_formula().then_some(Formula::Dummy),
        };
        let index = self.schema.children_of(&parent)?.len();
        self.define_column(&parent, index, spec)
    }

    fn load_data(&mut self, entry: &DataEntry) -> Result<()> {
        let column = self.schema.parse_column_ref(&entry.column)?.column;
        if self.parent_of(&column)? != ColumnId::root() {
            return Err(SheetError::validation(
                "Data entries must name a top-level column; nest rows for inner objects.",
            ));
        }
        self.load_rows(&column, &CellId::root(), &entry.rows)
    }

    fn load_rows(&mut self, column: &ColumnId, parent: &CellId, rows: &[toml::Value]) -> Result<()> {
        let col = self.state_column(column)?.clone();
        if !col.is_object {
            let values = self.values_from_toml(column, rows)?;
            let mut all: BTreeSet<Value> = self
                .store
                .get(&QFamilyId::new(column.clone(), parent.clone()))
                .map(|r| r.values_or_empty().cloned().collect())
                .unwrap_or_default();
            all.extend(values);
            return self.write_state_family(column, parent, all);
        }
        for row in rows {
            let toml::Value::Table(table) = row else {
                return Err(SheetError::validation(format!(
                    "Rows of object '{}' must be tables",
                    col.object_name_with_fallback().unwrap_or_default()
                )));
            };
            let cell = self.new_row(&col, parent, table)?;
            for (key, value) in table {
                if Some(key) == col.field_name.as_ref() {
                    continue;
                }
                let child = self.child_named(&col, key)?;
                let items = match value {
                    toml::Value::Array(items) => items.as_slice(),
                    single => std::slice::from_ref(single),
                };
                self.load_rows(&child, &cell, items)?;
            }
        }
        Ok(())
    }

    fn new_row(&mut self, col: &Column, parent: &CellId, table: &toml::Table) -> Result<CellId> {
        if col.specified_type == Some(Type::Token) {
            return self.new_object(&col.id, parent);
        }
        let key = col
            .field_name
            .as_ref()
            .and_then(|name| table.get(name))
            .ok_or_else(|| {
                SheetError::validation(format!(
                    "Rows of keyed object '{}' need a key field",
                    col.object_name_with_fallback().unwrap_or_default()
                ))
            })?;
        let mut values = self.values_from_toml(&col.id, std::slice::from_ref(key))?;
        let value = values
            .pop()
            .ok_or_else(|| SheetError::validation("A key must be a single value"))?;
        self.add_state_value(&col.id, parent, value)
    }

    fn child_named(&self, col: &Column, name: &str) -> Result<ColumnId> {
        col.children
            .iter()
            .find(|c| {
                self.schema.get(c).is_some_and(|child| {
                    child.field_name.as_deref() == Some(name)
                        || child.object_name.as_deref() == Some(name)
                })
            })
            .cloned()
            .ok_or_else(|| {
                SheetError::validation(format!(
                    "Object '{}' has no child named '{}'",
                    col.object_name_with_fallback().unwrap_or_default(),
                    name
                ))
            })
    }

    fn values_from_toml(&mut self, column: &ColumnId, items: &[toml::Value]) -> Result<Vec<Value>> {
        items
            .iter()
            .map(|item| {
                let text = scalar_text(item).ok_or_else(|| {
                    SheetError::validation(format!("Expected a plain value, got {}", item))
                })?;
                self.parse_cell_value(column, &text)
            })
            .collect()
    }
}
