//! Record storage.
//!
//! Records live in an append-only journal (`records.log`) of appends and
//! status transitions. The journal is replayed into an in-memory table with
//! indices for claim selection, aggregate replay and queries.

mod entry;
mod query;
mod table;

pub use entry::{LogEntry, Transition};
pub use query::{Order, RecordIter, RecordQuery};
pub use table::{RecordTable, LEASE_EXPIRED_ERROR};
