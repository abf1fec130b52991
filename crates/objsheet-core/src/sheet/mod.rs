//! The sheet document (UI-agnostic).
//!
//! - [`Sheet`] - schema, data, caches and procedures of one document
//! - schema editing, state-data editing and repair
//! - the procedure registry and canned transactions
//! - [`ProjectedColumn`] - a read-only rendering of the tree

mod data;
mod io;
mod ops;
mod procedures;
mod project;
mod state;

pub use ops::ColumnSpec;
pub use procedures::ParamSpec;
pub use project::{ProjectedCell, ProjectedColumn, ProjectedFamily, Projection};
pub use state::Sheet;
