//! Converts accumulator state into published statistics.

use serde::{Deserialize, Serialize};

use super::accumulator::Accumulator;
use super::keys::GroupKey;
use super::table::AggregationTable;

pub const DAILY_TABLE: &str = "daily_taxi_stats";
pub const MONTHLY_TABLE: &str = "monthly_taxi_stats";

/// Published statistics for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedGroupStats {
    #[serde(alias = "trip_date", alias = "trip_month")]
    pub key: String,
    pub trip_count: u64,
    pub avg_distance: f64,
    pub max_distance: f64,
    pub std_distance: f64,
    pub min_distance: f64,
    pub q1_distance: f64,
    pub median_distance: f64,
    pub q3_distance: f64,
    pub avg_amount: f64,
    pub total_amount: f64,
}

/// A finalized table ready for a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedTable {
    pub name: String,
    pub key_column: &'static str,
    pub rows: Vec<FinalizedGroupStats>,
}

impl FinalizedTable {
    pub fn get(&self, key: &str) -> Option<&FinalizedGroupStats> {
        self.rows.iter().find(|row| row.key == key)
    }
}

/// Finalizes every non-empty group of `table`, in key order.
pub fn finalize_table<K: GroupKey>(name: &str, table: AggregationTable<K>) -> FinalizedTable {
    let rows = table
        .into_iter()
        .filter_map(|(key, acc)| finalize_group(key.render(), acc))
        .collect();

    FinalizedTable {
        name: name.to_string(),
        key_column: K::COLUMN,
        rows,
    }
}

/// Derives the published statistics of one group; `None` when it is empty.
pub fn finalize_group(key: String, mut acc: Accumulator) -> Option<FinalizedGroupStats> {
    let (min, max) = match (acc.distance_min(), acc.distance_max()) {
        (Some(min), Some(max)) if acc.count() > 0 => (min, max),
        _ => return None,
    };

    let count = acc.count() as f64;
    let std = if acc.count() <= 1 {
        0.0
    } else {
        let variance = acc.distance_m2() / count;
        if variance.is_nan() || variance < 0.0 {
            0.0
        } else {
            variance.sqrt()
        }
    };

    let mut quantile = |q: f64| {
        acc.sketch_mut()
            .quantile(q)
            .map_or(min, |v| v.clamp(min, max))
    };
    let q1_distance = quantile(0.25);
    let median_distance = quantile(0.5);
    let q3_distance = quantile(0.75);

    Some(FinalizedGroupStats {
        key,
        trip_count: acc.count(),
        avg_distance: acc.distance_sum() / count,
        max_distance: max,
        std_distance: std,
        min_distance: min,
        q1_distance,
        median_distance,
        q3_distance,
        avg_amount: acc.amount_sum() / count,
        total_amount: acc.amount_sum(),
    })
}
