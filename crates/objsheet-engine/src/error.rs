//! Error types for the objsheet engine.
//!
//! Three kinds of failure are kept apart:
//!
//! - [`ValidationError`] - formula or procedure text is structurally or statically wrong
//! - [`EvaluationError`] - a well-typed formula or procedure failed on the data
//! - [`EngineError::Internal`] / [`EngineError::NoSuchColumn`] - schema consistency problems

use thiserror::Error;

use crate::engine::ColumnId;

/// A formula or procedure is rejected before it can take effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// A well-typed formula or procedure failed at runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EvaluationError(pub String);

/// Errors produced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid formula: {0}")]
    Validation(#[from] ValidationError),

    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("No such column: {0}")]
    NoSuchColumn(ColumnId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }

    pub fn is_evaluation(&self) -> bool {
        matches!(self, EngineError::Evaluation(_))
    }

    /// The bare message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            EngineError::Validation(e) => e.0.clone(),
            EngineError::Evaluation(e) => e.0.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub(crate) fn validation(message: impl Into<String>) -> EngineError {
    EngineError::Validation(ValidationError(message.into()))
}

pub(crate) fn evaluation(message: impl Into<String>) -> EngineError {
    EngineError::Evaluation(EvaluationError(message.into()))
}

pub(crate) fn internal(message: impl Into<String>) -> EngineError {
    EngineError::Internal(message.into())
}
