//! Upstream record-batch sources.
//!
//! [`ChunkSource`] is the only capability the engine needs from storage: a
//! lazy, finite sequence of record batches per file. [`ParquetSource`] reads
//! local Parquet files; [`MemorySource`] serves batches held in memory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::debug;

use crate::aggregation::finalize::{DAILY_TABLE, MONTHLY_TABLE};

pub type ChunkIter = Box<dyn Iterator<Item = Result<RecordBatch>>>;

/// Streams a file as record batches of at most `chunk_size` rows.
///
/// The returned iterator is not restartable; reading a file again means
/// calling `read_chunks` again.
pub trait ChunkSource: Send + Sync + 'static {
    fn read_chunks(&self, path: &Path, chunk_size: usize) -> Result<ChunkIter>;
}

/// Reads Parquet files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetSource;

impl ChunkSource for ParquetSource {
    fn read_chunks(&self, path: &Path, chunk_size: usize) -> Result<ChunkIter> {
        let file =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading parquet metadata of {}", path.display()))?;

        debug!(
            file = %path.display(),
            rows = builder.metadata().file_metadata().num_rows(),
            row_groups = builder.metadata().num_row_groups(),
            "Opened parquet file"
        );

        let reader = builder.with_batch_size(chunk_size).build()?;
        Ok(Box::new(reader.map(|batch| batch.map_err(anyhow::Error::from))))
    }
}

/// Batches held in memory, keyed by path and sliced to the chunk size on read.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<PathBuf, RecordBatch>,
    fail_after: HashMap<PathBuf, usize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, batch: RecordBatch) -> Self {
        self.files.insert(path.into(), batch);
        self
    }

    /// Makes reads of `path` fail after `chunks` batches have been served.
    pub fn failing_after(mut self, path: impl Into<PathBuf>, chunks: usize) -> Self {
        self.fail_after.insert(path.into(), chunks);
        self
    }
}

impl ChunkSource for MemorySource {
    fn read_chunks(&self, path: &Path, chunk_size: usize) -> Result<ChunkIter> {
        let batch = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", path.display()))?;
        let fail_after = self.fail_after.get(path).copied();
        let display = path.display().to_string();

        let rows = batch.num_rows();
        let chunk_size = chunk_size.max(1);
        let chunks = (0..rows)
            .step_by(chunk_size)
            .enumerate()
            .map(move |(n, offset)| {
                if fail_after.is_some_and(|limit| n >= limit) {
                    return Err(anyhow!("read error in {display} at chunk {n}"));
                }
                Ok(batch.slice(offset, chunk_size.min(rows - offset)))
            });

        Ok(Box::new(chunks))
    }
}

/// Lists Parquet source files in `dir`, sorted by name, skipping the
/// engine's own output tables.
pub fn discover_sources(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();

        if !entry.file_type()?.is_file()
            || path.extension().and_then(|e| e.to_str()) != Some("parquet")
        {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_str().unwrap_or("");
        if name.starts_with(DAILY_TABLE) || name.starts_with(MONTHLY_TABLE) {
            continue;
        }

        files.push(path);
    }

    files.sort();
    Ok(files)
}
