//! Downstream persistence of finalized tables.
//!
//! Every sink has full-table replace semantics: writing a table discards
//! whatever was previously stored under the same name.

mod csv_dir;
mod s3;

pub use csv_dir::CsvDirSink;
pub use s3::S3Sink;

use anyhow::Result;
use async_trait::async_trait;

use crate::aggregation::finalize::FinalizedTable;

#[async_trait]
pub trait TableSink: Send + Sync {
    async fn write_table(&self, table: &FinalizedTable) -> Result<()>;
}
