//! A transactional relational backend plus the schema adapter that sits on
//! top of it: value table, per-function memo tables, provenance and event
//! log (spec §4.E, §4.F).

pub mod adapter;
pub mod backend;
pub mod error;
pub mod schema;

pub mod prelude {
    pub use crate::adapter::{Direction, ProvenanceRow, RelAdapter};
    pub use crate::backend::{Record, RelationalBackend, SqliteBackend, Value};
    pub use crate::error::{Result, StoreError};
}
