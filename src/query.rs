//! Read-only queries over a finalized daily table.
//!
//! The distance summary is a moment-of-moments: it averages the per-day
//! derived statistics rather than recomputing them from raw records.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::path::Path;

use crate::aggregation::finalize::FinalizedGroupStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
}

/// Aggregates document served to reporting clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatesSummary {
    pub total_records: u64,
    pub day: Option<String>,
    pub day_trips: Option<u64>,
    pub longest_trip_day: Option<String>,
    pub distance_stats: Option<DistanceSummary>,
}

/// Loads a finalized table previously written as CSV.
pub fn load_table(path: &Path) -> Result<Vec<FinalizedGroupStats>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rdr = csv::Reader::from_reader(file);
    let mut rows = Vec::new();

    for result in rdr.deserialize() {
        let record: FinalizedGroupStats = result?;
        rows.push(record);
    }

    Ok(rows)
}

/// Trip count recorded for `day`, if the day has a row.
pub fn trips_on(rows: &[FinalizedGroupStats], day: &str) -> Option<u64> {
    rows.iter().find(|r| r.key == day).map(|r| r.trip_count)
}

/// Key of the day whose longest trip is the longest overall.
pub fn longest_trip_day(rows: &[FinalizedGroupStats]) -> Option<String> {
    rows.iter()
        .max_by(|a, b| a.max_distance.total_cmp(&b.max_distance))
        .map(|r| r.key.clone())
}

/// Cross-day distance summary; `None` for an empty table.
pub fn distance_summary(rows: &[FinalizedGroupStats]) -> Option<DistanceSummary> {
    if rows.is_empty() {
        return None;
    }

    Some(DistanceSummary {
        mean: column_mean(rows, |r| r.avg_distance),
        std_dev: column_mean(rows, |r| r.std_distance),
        min: rows.iter().map(|r| r.min_distance).fold(f64::INFINITY, f64::min),
        max: rows.iter().map(|r| r.max_distance).fold(f64::NEG_INFINITY, f64::max),
        q1: column_mean(rows, |r| r.q1_distance),
        median: column_mean(rows, |r| r.median_distance),
        q3: column_mean(rows, |r| r.q3_distance),
    })
}

/// Unweighted mean of one per-day column; 0.0 for an empty table.
fn column_mean(rows: &[FinalizedGroupStats], column: fn(&FinalizedGroupStats) -> f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(column).sum::<f64>() / rows.len() as f64
}

pub fn summarize(rows: &[FinalizedGroupStats], day: Option<&str>) -> AggregatesSummary {
    AggregatesSummary {
        total_records: rows.iter().map(|r| r.trip_count).sum(),
        day: day.map(str::to_string),
        day_trips: day.and_then(|d| trips_on(rows, d)),
        longest_trip_day: longest_trip_day(rows),
        distance_stats: distance_summary(rows),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::finalize::{DAILY_TABLE, FinalizedTable};
    use crate::sink::{CsvDirSink, TableSink};
    use std::env;
    use std::fs;

    fn row(key: &str, count: u64, avg: f64, max: f64) -> FinalizedGroupStats {
        FinalizedGroupStats {
            key: key.to_string(),
            trip_count: count,
            avg_distance: avg,
            max_distance: max,
            std_distance: 1.0,
            min_distance: 0.5,
            q1_distance: avg - 1.0,
            median_distance: avg,
            q3_distance: avg + 1.0,
            avg_amount: 10.0,
            total_amount: 10.0 * count as f64,
        }
    }

    #[test]
    fn test_column_mean_is_unweighted() {
        assert_eq!(column_mean(&[], |r| r.avg_distance), 0.0);

        // a busy day does not outweigh a quiet one
        let rows = vec![row("2023-06-17", 1000, 2.0, 3.0), row("2023-06-18", 1, 4.0, 4.0)];
        assert_eq!(column_mean(&rows, |r| r.avg_distance), 3.0);
    }

    #[test]
    fn test_summarize() {
        let rows = vec![
            row("2023-06-17", 2, 2.0, 3.0),
            row("2023-06-18", 1, 5.0, 42.0),
            row("2023-06-19", 7, 4.0, 9.0),
        ];
        let summary = summarize(&rows, Some("2023-06-17"));

        assert_eq!(summary.total_records, 10);
        assert_eq!(summary.day_trips, Some(2));
        assert_eq!(summary.longest_trip_day.as_deref(), Some("2023-06-18"));

        let stats = summary.distance_stats.unwrap();
        assert!((stats.mean - 11.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.max, 42.0);
        assert_eq!(stats.min, 0.5);
        assert_eq!(stats.std_dev, 1.0);
    }

    #[test]
    fn test_summarize_empty_table() {
        let summary = summarize(&[], Some("2023-06-17"));
        assert_eq!(summary.total_records, 0);
        assert_eq!(summary.day_trips, None);
        assert_eq!(summary.longest_trip_day, None);
        assert_eq!(summary.distance_stats, None);
    }

    #[tokio::test]
    async fn test_load_table_reads_sink_output() {
        let dir = env::temp_dir().join("trip_stats_test_query_load");
        let _ = fs::remove_dir_all(&dir);
        let sink = CsvDirSink::new(&dir);
        let rows = vec![row("2023-06-17", 2, 2.0, 3.0), row("2023-06-18", 1, 5.0, 5.0)];
        sink.write_table(&FinalizedTable {
            name: DAILY_TABLE.to_string(),
            key_column: "trip_date",
            rows: rows.clone(),
        })
        .await
        .unwrap();

        let loaded = load_table(&sink.table_path(DAILY_TABLE)).unwrap();
        assert_eq!(loaded, rows);

        fs::remove_dir_all(&dir).unwrap();
    }
}
