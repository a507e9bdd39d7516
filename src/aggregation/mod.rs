//! Streaming grouped aggregation of trip records.
//!
//! Records are normalized per chunk, folded into per-day and per-month
//! accumulators, merged chunk by chunk and file by file, and finalized into
//! published statistics once the run is over.

pub mod accumulator;
pub mod finalize;
pub mod keys;
pub mod processor;
pub mod schema;
pub mod sketch;
pub mod table;
