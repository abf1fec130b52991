//! Read-only tree projection of a sheet, for printing and inspection.

use objsheet_engine::engine::text::value_to_text_ignore_errors;
use objsheet_engine::engine::{CellId, Column, ColumnId, QFamilyId, Type, Value};

use super::Sheet;
use crate::error::Result;

/// Schema header of a projected column.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumn {
    pub id: ColumnId,
    pub name: String,
    pub type_text: String,
    pub is_object: bool,
    pub formula: Option<String>,
    pub typecheck_error: Option<String>,
    pub children: Vec<ProjectedColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedCell {
    pub id: CellId,
    pub text: String,
    /// One family per child column, in column order.
    pub families: Vec<(ColumnId, ProjectedFamily)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedFamily {
    Values(Vec<ProjectedCell>),
    Error(String),
}

/// A column header together with every cell of the column.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub header: ProjectedColumn,
    pub cells: Vec<ProjectedCell>,
}

fn display_name(column: &Column) -> String {
    if column.id.is_root() {
        return "$".to_string();
    }
    let name = if column.is_object {
        column.object_name_with_fallback()
    } else {
        column.field_name.clone()
    };
    name.unwrap_or_else(|| "(unnamed)".to_string())
}

impl Sheet {
    /// Project `column` and everything under it.
    ///
    /// A family that fails to evaluate shows up as [`ProjectedFamily::Error`];
    /// values that cannot be rendered show as `<?>`.
    pub fn project(&mut self, column: &ColumnId) -> Result<Projection> {
        self.evaluate_all()?;
        let header = self.project_header(column)?;
        let mut cells = Vec::new();
        for cell in self.cells(column)? {
            cells.push(self.project_cell(column, cell)?);
        }
        Ok(Projection { header, cells })
    }

    fn project_header(&mut self, id: &ColumnId) -> Result<ProjectedColumn> {
        let column = self.schema.column(id)?.clone();
        let ty = self.column_type(id)?;
        let formula = match (&column.formula, &column.parent) {
            (Some(formula), Some(parent)) => Some(
                self.stringify_formula_at(parent, formula)
                    .unwrap_or_else(|e| format!("<{}>", e)),
            ),
            _ => None,
        };
        let typecheck_error = self.typecheck_error(id)?;
        let mut children = Vec::new();
        for child in &column.children {
            children.push(self.project_header(child)?);
        }
        Ok(ProjectedColumn {
            id: id.clone(),
            name: display_name(&column),
            type_text: self.schema.stringify_type(&ty),
            is_object: column.is_object,
            formula,
            typecheck_error,
            children,
        })
    }

    fn project_cell(&mut self, column: &ColumnId, cell: CellId) -> Result<ProjectedCell> {
        let text = match cell.last_step() {
            None => "$".to_string(),
            Some(_) if self.schema.column(column)?.is_object => value_to_text_ignore_errors(
                &mut self.evaluator(),
                &Type::Reference(column.clone()),
                &Value::Ref(cell.clone()),
            ),
            Some(value) => {
                let value = value.clone();
                let ty = self.column_type(column)?;
                value_to_text_ignore_errors(&mut self.evaluator(), &ty, &value)
            }
        };
        let children = self.schema.children_of(column)?.to_vec();
        let mut families = Vec::new();
        for child in children {
            let family = QFamilyId::new(child.clone(), cell.clone());
            let projected = match self.evaluator().evaluate_family(&family) {
                Ok(Some(tset)) => {
                    let mut cells = Vec::new();
                    for value in tset.set {
                        cells.push(self.project_cell(&child, cell.child(value))?);
                    }
                    ProjectedFamily::Values(cells)
                }
                Ok(None) => ProjectedFamily::Error(
                    self.family_error(&child, &cell)
                        .unwrap_or_else(|| "evaluation failed".to_string()),
                ),
                Err(e) => ProjectedFamily::Error(e.message()),
            };
            families.push((child, projected));
        }
        Ok(ProjectedCell {
            id: cell,
            text,
            families,
        })
    }
}
