//! objsheet_engine - Schema tree, formula language, procedures and incremental evaluation.

pub mod engine;
pub mod error;

pub use engine::{
    CellId, Column, ColumnId, Evaluator, FamilyStore, Formula, FormulaEngine, MemoryStore,
    Procedure, QFamilyId, Schema, Settings, Type, TypedSet, Value,
};
pub use error::{EngineError, EvaluationError, Result, ValidationError};
