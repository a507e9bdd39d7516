//! Chunked, bounded-memory driver for the aggregation pipeline.
//!
//! Each source file is aggregated into its own partial tables, one chunk at a
//! time, on a blocking worker thread. Partial tables are merged into the
//! run-level tables by the coordinating task only once a file has been read
//! to completion, so a failing file contributes nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info, warn};

use super::finalize::{DAILY_TABLE, FinalizedTable, MONTHLY_TABLE, finalize_table};
use super::keys::{MonthKey, day_key, month_key};
use super::schema::SchemaNormalizer;
use super::table::AggregationTable;
use crate::config::EngineConfig;
use crate::error::{FileAccessError, RecordError, RunError};
use crate::source::ChunkSource;

/// Cooperative cancellation, checked between chunks and between files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Records dropped before aggregation, by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub schema: u64,
    pub invalid_timestamp: u64,
}

impl DropCounts {
    pub fn record(&mut self, err: RecordError) {
        match err {
            RecordError::Schema(_) => self.schema += 1,
            RecordError::InvalidTimestamp => self.invalid_timestamp += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.schema + self.invalid_timestamp
    }

    pub fn add(&mut self, other: DropCounts) {
        self.schema += other.schema;
        self.invalid_timestamp += other.invalid_timestamp;
    }
}

/// Daily and monthly tables built from some subset of the records, with the
/// bookkeeping that goes with them.
#[derive(Debug, Clone)]
pub struct PartialAggregate {
    pub daily: AggregationTable<NaiveDate>,
    pub monthly: AggregationTable<MonthKey>,
    pub records_read: u64,
    pub records_aggregated: u64,
    pub dropped: DropCounts,
}

impl PartialAggregate {
    pub fn new(sketch_size: usize) -> Self {
        Self {
            daily: AggregationTable::new(sketch_size),
            monthly: AggregationTable::new(sketch_size),
            records_read: 0,
            records_aggregated: 0,
            dropped: DropCounts::default(),
        }
    }

    pub fn merge(&mut self, other: PartialAggregate) {
        self.daily.merge_chunk(other.daily);
        self.monthly.merge_chunk(other.monthly);
        self.records_read += other.records_read;
        self.records_aggregated += other.records_aggregated;
        self.dropped.add(other.dropped);
    }
}

/// Why a file did not produce a partial aggregate.
#[derive(Debug)]
pub enum ProcessError {
    Access(FileAccessError),
    Cancelled,
}

impl From<FileAccessError> for ProcessError {
    fn from(err: FileAccessError) -> Self {
        ProcessError::Access(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl RunStatus {
    /// Whether finalized tables should be handed to a sink.
    pub fn writes_output(&self) -> bool {
        !matches!(self, RunStatus::Failure)
    }
}

/// Outcome summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub files_total: usize,
    pub files_processed: usize,
    pub files_failed: Vec<FileAccessError>,
    pub records_read: u64,
    pub records_aggregated: u64,
    pub dropped: DropCounts,
    pub daily_groups: usize,
    pub monthly_groups: usize,
}

/// Run-scoped state: the two run-level tables and the per-file bookkeeping.
struct RunContext {
    totals: PartialAggregate,
    files_total: usize,
    files_processed: usize,
    files_failed: Vec<FileAccessError>,
}

impl RunContext {
    fn new(sketch_size: usize, files_total: usize) -> Self {
        Self {
            totals: PartialAggregate::new(sketch_size),
            files_total,
            files_processed: 0,
            files_failed: Vec::new(),
        }
    }

    fn absorb(&mut self, file: PartialAggregate) {
        self.totals.merge(file);
        self.files_processed += 1;
    }

    fn finish(self) -> RunOutput {
        let status = if self.files_failed.is_empty() {
            RunStatus::Success
        } else if self.files_processed > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failure
        };

        let report = RunReport {
            status,
            files_total: self.files_total,
            files_processed: self.files_processed,
            files_failed: self.files_failed,
            records_read: self.totals.records_read,
            records_aggregated: self.totals.records_aggregated,
            dropped: self.totals.dropped,
            daily_groups: self.totals.daily.len(),
            monthly_groups: self.totals.monthly.len(),
        };

        RunOutput {
            daily: self.totals.daily,
            monthly: self.totals.monthly,
            report,
        }
    }
}

/// Raw run-level tables plus the run report.
#[derive(Debug)]
pub struct RunOutput {
    pub daily: AggregationTable<NaiveDate>,
    pub monthly: AggregationTable<MonthKey>,
    pub report: RunReport,
}

impl RunOutput {
    /// Consumes the raw tables, producing `(daily, monthly, report)`.
    pub fn finalize(self) -> (FinalizedTable, FinalizedTable, RunReport) {
        (
            finalize_table(DAILY_TABLE, self.daily),
            finalize_table(MONTHLY_TABLE, self.monthly),
            self.report,
        )
    }
}

pub struct StreamProcessor<S> {
    config: Arc<EngineConfig>,
    normalizer: Arc<SchemaNormalizer>,
    source: Arc<S>,
    cancel: CancelFlag,
}

impl<S> Clone for StreamProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            normalizer: self.normalizer.clone(),
            source: self.source.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: ChunkSource> StreamProcessor<S> {
    /// Validates `config` and builds a processor reading from `source`.
    pub fn new(config: EngineConfig, source: S) -> Result<Self, RunError> {
        config.validate()?;
        let normalizer = SchemaNormalizer::new(config.column_aliases.clone());
        Ok(Self {
            config: Arc::new(config),
            normalizer: Arc::new(normalizer),
            source: Arc::new(source),
            cancel: CancelFlag::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Builds partial tables from a single chunk.
    pub fn aggregate_chunk(&self, batch: &RecordBatch) -> PartialAggregate {
        let chunk = self.normalizer.normalize(batch);
        let mut partial = PartialAggregate::new(self.config.sketch_size);
        partial.records_read = chunk.num_rows() as u64;

        for record in chunk.records() {
            match record {
                Ok(trip) => {
                    partial
                        .daily
                        .update(day_key(&trip.pickup_time), trip.distance, trip.total_amount);
                    partial
                        .monthly
                        .update(month_key(&trip.pickup_time), trip.distance, trip.total_amount);
                    partial.records_aggregated += 1;
                }
                Err(err) => partial.dropped.record(err),
            }
        }

        partial
    }

    /// Reads one file chunk by chunk into file-local partial tables.
    ///
    /// Blocking. Returns [`ProcessError::Cancelled`] if the cancel flag is
    /// raised between chunks.
    pub fn process_file(&self, path: &Path) -> Result<PartialAggregate, ProcessError> {
        self.read_file(path, &CancelFlag::default())
    }

    /// Like [`Self::process_file`], but also stops between chunks once
    /// `abandon` is raised. Used to halt a reader whose file timed out.
    #[tracing::instrument(skip(self, path, abandon), fields(file = %path.display()))]
    fn read_file(
        &self,
        path: &Path,
        abandon: &CancelFlag,
    ) -> Result<PartialAggregate, ProcessError> {
        let started = Instant::now();
        let chunks = self
            .source
            .read_chunks(path, self.config.chunk_size)
            .map_err(|e| FileAccessError::Open {
                path: path.to_path_buf(),
                reason: format!("{e:#}"),
            })?;

        let mut file = PartialAggregate::new(self.config.sketch_size);
        let mut chunk_count = 0usize;

        for batch in chunks {
            if self.cancel.is_cancelled() || abandon.is_cancelled() {
                return Err(ProcessError::Cancelled);
            }

            let batch = batch.map_err(|e| FileAccessError::Read {
                path: path.to_path_buf(),
                chunks: chunk_count,
                reason: format!("{e:#}"),
            })?;

            let partial = self.aggregate_chunk(&batch);
            debug!(
                chunk = chunk_count,
                rows = partial.records_read,
                dropped = partial.dropped.total(),
                "Chunk aggregated"
            );
            file.merge(partial);
            chunk_count += 1;
        }

        if file.dropped.total() > 0 {
            warn!(
                schema = file.dropped.schema,
                invalid_timestamp = file.dropped.invalid_timestamp,
                "Records dropped from aggregation"
            );
        }

        info!(
            chunks = chunk_count,
            rows = file.records_read,
            aggregated = file.records_aggregated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "File processed"
        );

        Ok(file)
    }

    /// Processes `files` on up to `concurrency` blocking workers and merges
    /// each completed file into the run-level tables.
    ///
    /// Files are merged in the order given. A file that fails is reported in
    /// the run report and contributes nothing.
    #[tracing::instrument(skip(self, files), fields(files = files.len()))]
    pub async fn run(&self, files: Vec<PathBuf>) -> Result<RunOutput, RunError> {
        if files.is_empty() {
            return Err(RunError::FatalConfig("no source files to process".to_string()));
        }

        info!(
            chunk_size = self.config.chunk_size,
            sketch_size = self.config.sketch_size,
            concurrency = self.config.concurrency,
            "Starting aggregation run"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let timeout = self.config.file_timeout();
        let mut tasks = vec![];

        for path in files.iter().cloned() {
            let sem = semaphore.clone();
            let worker = self.clone();
            let span = tracing::info_span!("file_worker", file = %path.display());
            let task_path = path.clone();

            let task = tokio::spawn(
                async move {
                    let Ok(permit) = sem.acquire_owned().await else {
                        return Err(ProcessError::Cancelled);
                    };
                    if worker.cancel.is_cancelled() {
                        return Err(ProcessError::Cancelled);
                    }

                    let abandon = CancelFlag::default();
                    let worker_abandon = abandon.clone();
                    let blocking_path = path.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        // the permit is released only when the reader itself stops
                        let _permit = permit;
                        worker.read_file(&blocking_path, &worker_abandon)
                    });

                    match tokio::time::timeout(timeout, handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => Err(ProcessError::Access(FileAccessError::Worker {
                            path,
                            reason: join_err.to_string(),
                        })),
                        Err(_) => {
                            abandon.cancel();
                            Err(ProcessError::Access(FileAccessError::Timeout {
                                path,
                                secs: timeout.as_secs(),
                            }))
                        }
                    }
                }
                .instrument(span),
            );

            tasks.push((task_path, task));
        }

        let mut context = RunContext::new(self.config.sketch_size, files.len());

        for (path, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(ProcessError::Access(FileAccessError::Worker {
                    path: path.clone(),
                    reason: join_err.to_string(),
                })),
            };

            if self.cancel.is_cancelled() {
                warn!("Run cancelled; discarding partial tables");
                return Err(RunError::Cancelled);
            }

            match outcome {
                Ok(file) => {
                    context.absorb(file);
                    info!(
                        file = %path.display(),
                        processed = context.files_processed,
                        total = context.files_total,
                        records = context.totals.records_read,
                        "File merged into run tables"
                    );
                }
                Err(ProcessError::Cancelled) => {
                    warn!("Run cancelled; discarding partial tables");
                    return Err(RunError::Cancelled);
                }
                Err(ProcessError::Access(err)) => {
                    error!(file = %path.display(), error = %err, "File skipped");
                    context.files_failed.push(err);
                }
            }
        }

        let output = context.finish();
        info!(
            status = ?output.report.status,
            files_processed = output.report.files_processed,
            files_failed = output.report.files_failed.len(),
            records_read = output.report.records_read,
            records_aggregated = output.report.records_aggregated,
            dropped_schema = output.report.dropped.schema,
            dropped_invalid_timestamp = output.report.dropped.invalid_timestamp,
            "Aggregation run finished"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChunkIter, MemorySource};
    use arrow::array::{ArrayRef, Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SCENARIO: [(&str, f64, f64); 3] = [
        ("2023-06-17 09:00:00", 1.0, 10.0),
        ("2023-06-17 18:30:00", 3.0, 20.0),
        ("2023-06-18 07:45:00", 5.0, 30.0),
    ];

    fn batch(pickup_column: &str, rows: &[(&str, f64, f64)]) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new(pickup_column, DataType::Utf8, true),
            Field::new("trip_distance", DataType::Float64, true),
            Field::new("total_amount", DataType::Float64, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>()))
                    as ArrayRef,
                Arc::new(Float64Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
                Arc::new(Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
            ],
        )
        .unwrap()
    }

    /// Serves one-row chunks, sleeping before each, and tracks open readers.
    struct SlowSource {
        chunks: HashMap<PathBuf, usize>,
        delay: Duration,
        served: Arc<AtomicUsize>,
        open: Arc<AtomicUsize>,
        peak_open: Arc<AtomicUsize>,
    }

    impl SlowSource {
        fn new(delay: Duration) -> Self {
            Self {
                chunks: HashMap::new(),
                delay,
                served: Arc::default(),
                open: Arc::default(),
                peak_open: Arc::default(),
            }
        }

        fn with_file(mut self, path: &str, chunks: usize) -> Self {
            self.chunks.insert(path.into(), chunks);
            self
        }
    }

    struct SlowChunks {
        remaining: usize,
        delay: Duration,
        batch: RecordBatch,
        served: Arc<AtomicUsize>,
        open: Arc<AtomicUsize>,
    }

    impl Iterator for SlowChunks {
        type Item = anyhow::Result<RecordBatch>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.remaining == 0 {
                return None;
            }
            std::thread::sleep(self.delay);
            self.remaining -= 1;
            self.served.fetch_add(1, Ordering::SeqCst);
            Some(Ok(self.batch.clone()))
        }
    }

    impl Drop for SlowChunks {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ChunkSource for SlowSource {
        fn read_chunks(&self, path: &Path, _chunk_size: usize) -> anyhow::Result<ChunkIter> {
            let remaining = self
                .chunks
                .get(path)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no such file: {}", path.display()))?;
            let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_open.fetch_max(now_open, Ordering::SeqCst);

            Ok(Box::new(SlowChunks {
                remaining,
                delay: self.delay,
                batch: batch("tpep_pickup_datetime", &SCENARIO[..1]),
                served: self.served.clone(),
                open: self.open.clone(),
            }))
        }
    }

    fn config(chunk_size: usize) -> EngineConfig {
        EngineConfig {
            chunk_size,
            concurrency: 2,
            ..EngineConfig::default()
        }
    }

    fn check_scenario(daily: &FinalizedTable) {
        let d17 = daily.get("2023-06-17").unwrap();
        assert_eq!(d17.trip_count, 2);
        assert_eq!(d17.avg_distance, 2.0);
        assert_eq!(d17.min_distance, 1.0);
        assert_eq!(d17.max_distance, 3.0);
        assert_eq!(d17.avg_amount, 15.0);

        let d18 = daily.get("2023-06-18").unwrap();
        assert_eq!(d18.trip_count, 1);
        assert_eq!(d18.avg_distance, 5.0);
    }

    #[tokio::test]
    async fn test_scenario_any_chunking() {
        for chunk_size in [1, 2, 3, 10] {
            let source = MemorySource::new().with_file("a", batch("tpep_pickup_datetime", &SCENARIO));
            let processor = StreamProcessor::new(config(chunk_size), source).unwrap();
            let (daily, monthly, report) = processor.run(vec!["a".into()]).await.unwrap().finalize();

            check_scenario(&daily);
            assert_eq!(report.status, RunStatus::Success);
            assert_eq!(monthly.rows.len(), 1);
            assert_eq!(monthly.rows[0].trip_count, 3);
            assert_eq!(monthly.rows[0].key, "2023-06-01 00:00:00");
        }
    }

    #[tokio::test]
    async fn test_scenario_split_across_files_in_any_order() {
        let arrangements: [(&[usize], &[usize]); 3] = [(&[0, 1], &[2]), (&[0, 2], &[1]), (&[2], &[1, 0])];

        for (first, second) in arrangements {
            let pick = |idx: &[usize]| idx.iter().map(|&i| SCENARIO[i]).collect::<Vec<_>>();
            let source = MemorySource::new()
                .with_file("one", batch("tpep_pickup_datetime", &pick(first)))
                .with_file("two", batch("lpep_pickup_datetime", &pick(second)));
            let processor = StreamProcessor::new(config(1), source).unwrap();

            for order in [vec!["one".into(), "two".into()], vec!["two".into(), "one".into()]] {
                let (daily, _, _) = processor.run(order).await.unwrap().finalize();
                check_scenario(&daily);
            }
        }
    }

    #[tokio::test]
    async fn test_failed_file_contributes_nothing() {
        let source = MemorySource::new()
            .with_file("good", batch("tpep_pickup_datetime", &SCENARIO[..2]))
            .with_file("bad", batch("tpep_pickup_datetime", &SCENARIO[2..]))
            .failing_after("bad", 0);
        let processor = StreamProcessor::new(config(1), source).unwrap();

        let output = processor
            .run(vec!["good".into(), "bad".into(), "missing".into()])
            .await
            .unwrap();

        assert_eq!(output.report.status, RunStatus::PartialSuccess);
        assert_eq!(output.report.files_processed, 1);
        assert_eq!(output.report.files_failed.len(), 2);
        assert!(matches!(output.report.files_failed[0], FileAccessError::Read { .. }));
        assert!(matches!(output.report.files_failed[1], FileAccessError::Open { .. }));

        let (daily, _, _) = output.finalize();
        assert_eq!(daily.rows.len(), 1);
        assert!(daily.get("2023-06-18").is_none());
    }

    #[tokio::test]
    async fn test_all_files_failing_is_failure() {
        let processor = StreamProcessor::new(config(10), MemorySource::new()).unwrap();
        let output = processor.run(vec!["nope".into()]).await.unwrap();
        assert_eq!(output.report.status, RunStatus::Failure);
        assert!(!output.report.status.writes_output());
    }

    #[tokio::test]
    async fn test_empty_file_set_is_fatal() {
        let processor = StreamProcessor::new(config(10), MemorySource::new()).unwrap();
        assert!(matches!(
            processor.run(vec![]).await,
            Err(RunError::FatalConfig(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        assert!(matches!(
            StreamProcessor::new(config(0), MemorySource::new()),
            Err(RunError::FatalConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_no_output() {
        let source = MemorySource::new().with_file("a", batch("tpep_pickup_datetime", &SCENARIO));
        let processor = StreamProcessor::new(config(1), source).unwrap();
        processor.cancel_flag().cancel();
        assert!(matches!(
            processor.run(vec!["a".into()]).await,
            Err(RunError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_timed_out_reader_stops_and_holds_its_slot() {
        let source = SlowSource::new(Duration::from_millis(300))
            .with_file("stalled", 100)
            .with_file("quick", 2);
        let served = source.served.clone();
        let open = source.open.clone();
        let peak_open = source.peak_open.clone();

        let config = EngineConfig {
            chunk_size: 1,
            concurrency: 1,
            file_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let processor = StreamProcessor::new(config, source).unwrap();
        let output = processor
            .run(vec!["stalled".into(), "quick".into()])
            .await
            .unwrap();

        assert_eq!(output.report.status, RunStatus::PartialSuccess);
        assert_eq!(output.report.files_processed, 1);
        assert!(matches!(
            &output.report.files_failed[..],
            [FileAccessError::Timeout { secs: 1, .. }]
        ));

        // the quick file only started once the stalled reader gave up its permit
        assert_eq!(peak_open.load(Ordering::SeqCst), 1);
        assert_eq!(open.load(Ordering::SeqCst), 0);

        let settled = served.load(Ordering::SeqCst);
        assert!(settled < 10);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(served.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn test_dropped_records_are_counted() {
        let rows = [
            ("2023-06-17 09:00:00", 1.0, 10.0),
            ("garbage", 2.0, 10.0),
            ("2023-06-17 09:00:00", f64::NAN, 10.0),
        ];
        let processor = StreamProcessor::new(config(10), MemorySource::new()).unwrap();
        let partial = processor.aggregate_chunk(&batch("tpep_pickup_datetime", &rows));

        assert_eq!(partial.records_read, 3);
        assert_eq!(partial.records_aggregated, 1);
        assert_eq!(partial.dropped.invalid_timestamp, 1);
        assert_eq!(partial.dropped.schema, 1);
    }

    #[test]
    fn test_chunk_without_pickup_column_aggregates_nothing() {
        let processor = StreamProcessor::new(config(10), MemorySource::new()).unwrap();
        let partial = processor.aggregate_chunk(&batch("when", &SCENARIO));

        assert_eq!(partial.records_aggregated, 0);
        assert_eq!(partial.dropped.schema, 3);
        assert!(partial.daily.is_empty());
    }
}
