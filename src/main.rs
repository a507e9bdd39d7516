//! CLI entry point for the trip statistics pipeline.
//!
//! Provides subcommands for downloading monthly trip-record files,
//! aggregating them into daily and monthly statistics tables, and querying
//! a finalized daily table.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use trip_stats::{
    aggregation::processor::{RunStatus, StreamProcessor},
    config::EngineConfig,
    fetch::{BasicClient, DEFAULT_BASE_URL, download_month},
    query::{load_table, summarize},
    sink::{CsvDirSink, S3Sink, TableSink},
    source::{ParquetSource, discover_sources},
};

#[derive(Parser)]
#[command(name = "trip_stats")]
#[command(about = "Daily and monthly statistics over trip-record archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a year of monthly trip-record files
    Download {
        /// Year to fetch
        #[arg(short, long, default_value_t = 2023)]
        year: i32,

        /// Months to fetch (comma separated)
        #[arg(short, long, value_delimiter = ',', default_values_t = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])]
        months: Vec<u32>,

        /// Directory to save files into
        #[arg(short, long, default_value = "data")]
        dest_dir: String,

        /// Base URL of the trip-data archive
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,

        /// Maximum number of concurrent downloads
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Per-file request timeout in seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Aggregate every Parquet file in a directory into daily and monthly tables
    Transform {
        /// Directory containing source Parquet files
        #[arg(short, long, default_value = "data")]
        input_dir: String,

        /// Directory to write CSV tables to
        #[arg(short, long, default_value = "output")]
        output_dir: String,

        /// JSON engine config (falls back to TRIP_STATS_CONFIG)
        #[arg(long)]
        config: Option<String>,

        /// Records per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Maximum centroids per quantile sketch
        #[arg(long)]
        sketch_size: Option<usize>,

        /// Number of files aggregated in parallel
        #[arg(long)]
        concurrency: Option<usize>,

        /// Optional: S3 bucket to upload tables to instead of writing CSV
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Key prefix for uploaded tables
        #[arg(long, default_value = "refined")]
        s3_prefix: String,

        /// Optional: Gzip compress tables before uploading to S3
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Summarize a finalized daily table
    Query {
        /// Daily table CSV written by `transform`
        #[arg(short, long, default_value = "output/daily_taxi_stats.csv")]
        input: String,

        /// Day to report the trip count for (YYYY-MM-DD)
        #[arg(short, long)]
        day: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/trip_stats.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("trip_stats.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Download {
            year,
            months,
            dest_dir,
            base_url,
            concurrency,
            timeout_secs,
        } => {
            download(
                year,
                months,
                &dest_dir,
                &base_url,
                concurrency,
                Duration::from_secs(timeout_secs),
            )
            .await?;
        }
        Commands::Transform {
            input_dir,
            output_dir,
            config,
            chunk_size,
            sketch_size,
            concurrency,
            s3_bucket,
            s3_prefix,
            gzip,
        } => {
            let mut engine_config = match config.or_else(|| std::env::var("TRIP_STATS_CONFIG").ok()) {
                Some(path) => EngineConfig::load(&path)?,
                None => EngineConfig::default(),
            };
            if let Some(chunk_size) = chunk_size {
                engine_config.chunk_size = chunk_size;
            }
            if let Some(sketch_size) = sketch_size {
                engine_config.sketch_size = sketch_size;
            }
            if let Some(concurrency) = concurrency {
                engine_config.concurrency = concurrency;
            }

            let sink: Box<dyn TableSink> = match s3_bucket {
                Some(bucket) if !bucket.is_empty() => {
                    info!(bucket = %bucket, prefix = %s3_prefix, gzip, "S3 upload enabled");
                    Box::new(S3Sink::from_env(&bucket, &s3_prefix, gzip).await)
                }
                _ => Box::new(CsvDirSink::new(&output_dir)),
            };

            transform(&input_dir, engine_config, sink.as_ref()).await?;
        }
        Commands::Query { input, day } => {
            let rows = load_table(Path::new(&input))?;
            let summary = summarize(&rows, day.as_deref());
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

/// Aggregates every source file under `input_dir` and hands both tables to
/// `sink`. Nothing is written if the run is cancelled, misconfigured, or no
/// file could be read.
#[tracing::instrument(skip(config, sink))]
async fn transform(input_dir: &str, config: EngineConfig, sink: &dyn TableSink) -> Result<()> {
    let started = Instant::now();
    let files = discover_sources(Path::new(input_dir))?;
    info!(files = files.len(), "Discovered source files");

    let processor = StreamProcessor::new(config, ParquetSource)?;

    let cancel = processor.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let output = processor.run(files).await?;
    let (daily, monthly, report) = output.finalize();

    info!(report = %serde_json::to_string(&report)?, "Run report");

    if !report.status.writes_output() {
        bail!(
            "no source file could be read ({} failed); nothing written",
            report.files_failed.len()
        );
    }

    sink.write_table(&daily).await?;
    sink.write_table(&monthly).await?;

    if report.status == RunStatus::PartialSuccess {
        warn!(
            failed = report.files_failed.len(),
            "Tables written without the files that failed"
        );
    }

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Transformation complete");
    Ok(())
}

/// Downloads the requested months concurrently. Months that fail are logged
/// and reported as an error once the others have finished.
#[tracing::instrument(skip(months, base_url))]
async fn download(
    year: i32,
    months: Vec<u32>,
    dest_dir: &str,
    base_url: &str,
    concurrency: usize,
    timeout: Duration,
) -> Result<()> {
    if concurrency == 0 {
        bail!("concurrency must be at least 1");
    }
    std::fs::create_dir_all(dest_dir)?;

    let client = Arc::new(BasicClient::new(timeout)?);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
    let mut tasks = vec![];

    for month in months {
        if !(1..=12).contains(&month) {
            warn!(month, "Skipping invalid month");
            continue;
        }

        let sem = semaphore.clone();
        let client = client.clone();
        let base_url = base_url.to_string();
        let dest = PathBuf::from(dest_dir);
        let span = tracing::info_span!("download_month", year, month);

        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire().await?;
                download_month(client.as_ref(), &base_url, year, month, &dest).await
            }
            .instrument(span),
        );
        tasks.push((month, task));
    }

    let mut failed = 0;
    for (month, task) in tasks {
        match task.await {
            Ok(Ok(path)) => info!(month, path = %path.display(), "Month ready"),
            Ok(Err(e)) => {
                error!(month, error = %e, "Download failed");
                failed += 1;
            }
            Err(e) => {
                error!(month, error = %e, "Download task aborted");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} download(s) failed");
    }
    info!(dest_dir, "All downloads complete");
    Ok(())
}
