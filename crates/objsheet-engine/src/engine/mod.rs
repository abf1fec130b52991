//! The objsheet language engine.
//!
//! - [`value`] / [`types`] - values, cell addresses and the typed-set lattice
//! - [`schema`] - the column tree and name resolution
//! - [`formula`] - formula syntax, checking and interpretation
//! - [`model`] - typecheck and family caches, the [`Evaluator`] context
//! - [`store`] - the family record store boundary
//! - [`procedure`] - the transaction language
//! - [`compiler`] - lowering of simple formulas to fused loops
//! - [`text`] - value rendering and parsing

pub mod compiler;
pub mod formula;
pub mod model;
pub mod procedure;
pub mod schema;
pub mod store;
pub mod text;
pub mod types;
pub mod value;

pub use compiler::{CompiledFormula, compile, is_compilation_supported};
pub use formula::{
    Formula, VarTypes, VarValues, evaluate_formula, parse_formula, stringify_formula,
    typecheck_formula, validate_formula,
};
pub use model::{Evaluator, FormulaEngine, Settings};
pub use procedure::{
    Param, Procedure, Statement, execute_procedure, parse_procedure, stringify_procedure,
    typecheck_procedure, validate_procedure,
};
pub use schema::{Column, ColumnRef, Direction, LogicalChild, Schema};
pub use store::{FamilyFilter, FamilyRecord, FamilyStore, MemoryStore};
pub use text::{parse_value, tset_to_text, value_to_text};
pub use types::{Type, TypedSet, common_supertype, is_subtype};
pub use value::{CellId, ColumnId, Number, QCellId, QFamilyId, Value};
