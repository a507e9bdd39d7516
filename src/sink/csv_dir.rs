//! CSV persistence for finalized tables.

use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::WriterBuilder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::TableSink;
use crate::aggregation::finalize::FinalizedTable;

/// Stats columns following the key column, in serialization order.
pub(crate) const STATS_COLUMNS: [&str; 10] = [
    "trip_count",
    "avg_distance",
    "max_distance",
    "std_distance",
    "min_distance",
    "q1_distance",
    "median_distance",
    "q3_distance",
    "avg_amount",
    "total_amount",
];

/// Writes each table to `{dir}/{name}.csv`.
pub struct CsvDirSink {
    dir: PathBuf,
}

impl CsvDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.csv"))
    }
}

#[async_trait]
impl TableSink for CsvDirSink {
    async fn write_table(&self, table: &FinalizedTable) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating output directory {}", self.dir.display()))?;

        let path = self.table_path(&table.name);
        write_csv(&path, table)?;

        info!(table = %table.name, rows = table.rows.len(), path = %path.display(), "Table written");
        Ok(())
    }
}

/// Replaces the CSV at `path` with `table`.
///
/// Rows go to a sibling temp file first, which is then renamed over `path`,
/// so readers never observe a half-written table.
pub fn write_csv(path: &Path, table: &FinalizedTable) -> Result<()> {
    let tmp = path.with_extension("csv.tmp");
    debug!(path = %tmp.display(), rows = table.rows.len(), "Writing CSV table");

    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;

    // header is written by hand so the key column carries the table's name for it
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(std::iter::once(table.key_column).chain(STATS_COLUMNS))?;

    for row in &table.rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    drop(writer);

    fs::rename(&tmp, path)
        .with_context(|| format!("replacing {} with {}", path.display(), tmp.display()))?;
    Ok(())
}
