//! Family record stores.
//!
//! - [`MemoryStore`] - the shared `DashMap` store a sheet owns
//! - [`TransactionCells`] - a copy-on-write overlay used while a procedure runs

mod overlay;

pub use objsheet_engine::engine::MemoryStore;
pub use overlay::TransactionCells;
