//! objsheet-core - the sheet document, transactions and the run queue.

pub mod error;
pub mod sheet;
pub mod storage;
pub mod tablespace;

pub use error::{Result, SheetError};
pub use sheet::{
    ColumnSpec, ParamSpec, ProjectedCell, ProjectedColumn, ProjectedFamily, Projection, Sheet,
};
pub use storage::{MemoryStore, TransactionCells};
pub use tablespace::Tablespace;

pub use objsheet_engine::engine::{CellId, ColumnId, Type, TypedSet, Value};
