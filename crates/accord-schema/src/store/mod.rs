//! Store clients consumed by the replicated registries
//!
//! The registries never talk to a concrete database or broker. They consume
//! two small client interfaces:
//!
//! - [`SchemaTable`]: a strongly consistent table with multi-item
//!   transactions and conditional ("row absent") puts
//! - [`SchemaLog`]: an append-only, key-compacted topic with produce,
//!   consume and admin capability
//!
//! Each comes with an in-memory implementation ([`MemoryTable`],
//! [`MemoryLog`]) that models optimistic concurrency and per-partition
//! ordering faithfully enough to run several registries against one store
//! inside a single process.

mod log;
mod table;

pub use log::{LogError, LogRecord, MemoryLog, SchemaLog};
pub use table::{CancellationReason, MemoryTable, SchemaTable, TableError, TableRow};
