//! Error types for objsheet documents.

use objsheet_engine::engine::ColumnId;
use objsheet_engine::{EngineError, EvaluationError, ValidationError};
use thiserror::Error;

/// Errors that can occur while editing or running a sheet
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid sheet definition ({context}): {message}")]
    Definition { context: String, message: String },

    #[error("{0}")]
    Engine(EngineError),

    #[error("Invalid formula: {0}")]
    Validation(ValidationError),

    #[error("Evaluation failed: {0}")]
    Evaluation(EvaluationError),

    #[error("No such column: {0}")]
    NoSuchColumn(ColumnId),

    #[error("Cannot modify the root column.")]
    ModifyRootColumn,

    #[error("Cannot have a state column as child of a formula column.")]
    StateUnderFormula,

    #[error("Index out of range")]
    IndexOutOfRange,

    #[error("A column with isObject = false cannot have an objectName.")]
    ObjectNameRequiresObject,

    #[error("Must specify type for a state column")]
    TypeRequired,

    #[error("{0}")]
    NameClash(String),

    #[error("{0}")]
    HasChildren(String),

    #[error("Cannot change a column type to or from _token.")]
    ChangeTypeToken,

    #[error("Changing the key type of a state object column is not supported.")]
    ChangeKeyedObjectType,

    #[error("Child '{0}' is not a simple value.")]
    ComplexValue(String),

    #[error("Column '{0}' is not a state column.")]
    NotAStateColumn(ColumnId),

    #[error("Bad cell address: {0}")]
    BadCellAddress(String),

    #[error("No such procedure '{0}'.")]
    NoSuchProcedure(String),

    #[error(
        "Procedure '{name}' is ill-typed with respect to the current schema and cannot be executed: {message}"
    )]
    ProcedureIllTyped { name: String, message: String },

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("The tablespace has shut down")]
    Closed,
}

impl From<EngineError> for SheetError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(e) => SheetError::Validation(e),
            EngineError::Evaluation(e) => SheetError::Evaluation(e),
            EngineError::NoSuchColumn(id) => SheetError::NoSuchColumn(id),
            other => SheetError::Engine(other),
        }
    }
}

impl SheetError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        SheetError::Validation(ValidationError(message.into()))
    }

    pub(crate) fn definition(context: impl Into<String>, message: impl ToString) -> Self {
        SheetError::Definition {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SheetError>;
