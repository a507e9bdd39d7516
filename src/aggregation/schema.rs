//! Schema normalization: maps producer-specific column names onto the
//! canonical trip record.

use std::collections::BTreeMap;
use std::fmt;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Schema, TimeUnit, TimestampMicrosecondType};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::keys::{parse_timestamp, timestamp_from_micros};
use crate::error::RecordError;

/// Fields of the canonical trip record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    PickupTime,
    DropoffTime,
    Distance,
    TotalAmount,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 4] = [
        CanonicalField::PickupTime,
        CanonicalField::DropoffTime,
        CanonicalField::Distance,
        CanonicalField::TotalAmount,
    ];

    /// Column name used by the canonical (yellow cab) producer.
    pub fn column_name(&self) -> &'static str {
        match self {
            CanonicalField::PickupTime => "tpep_pickup_datetime",
            CanonicalField::DropoffTime => "tpep_dropoff_datetime",
            CanonicalField::Distance => "trip_distance",
            CanonicalField::TotalAmount => "total_amount",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::PickupTime => "pickup_time",
            CanonicalField::DropoffTime => "dropoff_time",
            CanonicalField::Distance => "distance",
            CanonicalField::TotalAmount => "total_amount",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alternate column names per canonical field, tried in order after the
/// canonical name.
pub type ColumnAliases = BTreeMap<CanonicalField, Vec<String>>;

/// Aliases for the producers seen in the trip-record archive: green cabs use
/// an `lpep_` prefix, for-hire vehicles drop the prefix entirely.
pub fn default_column_aliases() -> ColumnAliases {
    let mut aliases = ColumnAliases::new();
    aliases.insert(
        CanonicalField::PickupTime,
        vec!["lpep_pickup_datetime".into(), "pickup_datetime".into()],
    );
    aliases.insert(
        CanonicalField::DropoffTime,
        vec!["lpep_dropoff_datetime".into(), "dropoff_datetime".into()],
    );
    aliases
}

/// One trip observation in canonical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub pickup_time: NaiveDateTime,
    pub dropoff_time: Option<NaiveDateTime>,
    pub distance: f64,
    pub total_amount: f64,
}

/// Resolves canonical fields against each chunk's schema.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    aliases: ColumnAliases,
}

impl SchemaNormalizer {
    pub fn new(aliases: ColumnAliases) -> Self {
        Self { aliases }
    }

    /// Names tried for `field`: the canonical column first, then aliases.
    pub fn candidates(&self, field: CanonicalField) -> Vec<&str> {
        let mut names = vec![field.column_name()];
        if let Some(alts) = self.aliases.get(&field) {
            names.extend(alts.iter().map(String::as_str));
        }
        names
    }

    /// Index and name of the first candidate column present in `schema`.
    pub fn resolve<'a>(&'a self, schema: &Schema, field: CanonicalField) -> Option<(usize, &'a str)> {
        self.candidates(field)
            .into_iter()
            .find_map(|name| schema.index_of(name).ok().map(|idx| (idx, name)))
    }

    /// Exposes the canonical fields of `batch`.
    ///
    /// A field with no matching column, or whose column cannot be read as the
    /// expected type, is left absent for the chunk and a warning is logged.
    pub fn normalize(&self, batch: &RecordBatch) -> NormalizedChunk {
        let schema = batch.schema();
        let mut chunk = NormalizedChunk {
            rows: batch.num_rows(),
            ..Default::default()
        };

        for field in CanonicalField::ALL {
            let Some((idx, name)) = self.resolve(&schema, field) else {
                warn!(
                    field = %field,
                    tried = ?self.candidates(field),
                    "Column not found in chunk; field left absent"
                );
                continue;
            };

            if name != field.column_name() {
                debug!(field = %field, column = name, "Aliased alternate column");
            }

            let column = batch.column(idx);
            let converted = match field {
                CanonicalField::PickupTime => {
                    TimeColumn::from_array(column).map(|c| chunk.pickup = Some(c))
                }
                CanonicalField::DropoffTime => {
                    TimeColumn::from_array(column).map(|c| chunk.dropoff = Some(c))
                }
                CanonicalField::Distance => {
                    float_column(column).map(|c| chunk.distance = Some(c))
                }
                CanonicalField::TotalAmount => {
                    float_column(column).map(|c| chunk.amount = Some(c))
                }
            };

            if let Err(e) = converted {
                warn!(
                    field = %field,
                    column = name,
                    data_type = %column.data_type(),
                    error = %e,
                    "Column has unusable type; field left absent"
                );
            }
        }

        chunk
    }
}

impl Default for SchemaNormalizer {
    fn default() -> Self {
        Self::new(default_column_aliases())
    }
}

/// Timestamp column, either native or textual.
#[derive(Debug, Clone)]
enum TimeColumn {
    Micros(TimestampMicrosecondArray),
    Text(StringArray),
}

impl TimeColumn {
    fn from_array(array: &ArrayRef) -> Result<Self, ArrowError> {
        match array.data_type() {
            DataType::Utf8 => Ok(TimeColumn::Text(array.as_string::<i32>().clone())),
            DataType::LargeUtf8 | DataType::Utf8View => {
                let text = cast(array, &DataType::Utf8)?;
                Ok(TimeColumn::Text(text.as_string::<i32>().clone()))
            }
            _ => {
                let micros = cast(array, &DataType::Timestamp(TimeUnit::Microsecond, None))?;
                Ok(TimeColumn::Micros(
                    micros.as_primitive::<TimestampMicrosecondType>().clone(),
                ))
            }
        }
    }

    fn value(&self, row: usize) -> Result<NaiveDateTime, RecordError> {
        match self {
            TimeColumn::Micros(values) if values.is_valid(row) => {
                timestamp_from_micros(values.value(row))
            }
            TimeColumn::Text(values) if values.is_valid(row) => parse_timestamp(values.value(row)),
            _ => Err(RecordError::InvalidTimestamp),
        }
    }
}

fn float_column(array: &ArrayRef) -> Result<Float64Array, ArrowError> {
    let values = cast(array, &DataType::Float64)?;
    Ok(values.as_primitive::<Float64Type>().clone())
}

fn float_value(column: Option<&Float64Array>, row: usize) -> Option<f64> {
    column
        .filter(|c| c.is_valid(row))
        .map(|c| c.value(row))
        .filter(|v| v.is_finite())
}

/// A chunk with its canonical fields resolved.
#[derive(Debug, Clone, Default)]
pub struct NormalizedChunk {
    rows: usize,
    pickup: Option<TimeColumn>,
    dropoff: Option<TimeColumn>,
    distance: Option<Float64Array>,
    amount: Option<Float64Array>,
}

impl NormalizedChunk {
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn has_field(&self, field: CanonicalField) -> bool {
        match field {
            CanonicalField::PickupTime => self.pickup.is_some(),
            CanonicalField::DropoffTime => self.dropoff.is_some(),
            CanonicalField::Distance => self.distance.is_some(),
            CanonicalField::TotalAmount => self.amount.is_some(),
        }
    }

    /// Builds the canonical record at `row`.
    ///
    /// The dropoff time is informational only; a missing or invalid one never
    /// drops the record.
    pub fn record(&self, row: usize) -> Result<TripRecord, RecordError> {
        let pickup = self
            .pickup
            .as_ref()
            .ok_or(RecordError::Schema(CanonicalField::PickupTime))?;
        let pickup_time = pickup.value(row)?;

        let distance = float_value(self.distance.as_ref(), row)
            .ok_or(RecordError::Schema(CanonicalField::Distance))?;
        let total_amount = float_value(self.amount.as_ref(), row)
            .ok_or(RecordError::Schema(CanonicalField::TotalAmount))?;

        let dropoff_time = self.dropoff.as_ref().and_then(|c| c.value(row).ok());

        Ok(TripRecord {
            pickup_time,
            dropoff_time,
            distance,
            total_amount,
        })
    }

    pub fn records(&self) -> impl Iterator<Item = Result<TripRecord, RecordError>> + '_ {
        (0..self.rows).map(|row| self.record(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::Field;
    use std::sync::Arc;

    fn micros(s: &str) -> i64 {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    fn trip_batch(prefix: &str) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new(
                format!("{prefix}_pickup_datetime"),
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new(
                format!("{prefix}_dropoff_datetime"),
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new("trip_distance", DataType::Float64, true),
            Field::new("total_amount", DataType::Float64, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(micros("2023-06-17 08:00:00")),
                    None,
                ])) as ArrayRef,
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(micros("2023-06-17 08:20:00")),
                    None,
                ])),
                Arc::new(Float64Array::from(vec![Some(1.5), Some(2.0)])),
                Arc::new(Float64Array::from(vec![Some(12.0), Some(9.0)])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_candidates_start_with_canonical_name() {
        let normalizer = SchemaNormalizer::default();
        assert_eq!(
            normalizer.candidates(CanonicalField::PickupTime),
            vec!["tpep_pickup_datetime", "lpep_pickup_datetime", "pickup_datetime"]
        );
        assert_eq!(normalizer.candidates(CanonicalField::Distance), vec!["trip_distance"]);
    }

    #[test]
    fn test_canonical_columns_resolve() {
        let chunk = SchemaNormalizer::default().normalize(&trip_batch("tpep"));
        assert_eq!(chunk.num_rows(), 2);
        for field in CanonicalField::ALL {
            assert!(chunk.has_field(field), "{field} missing");
        }

        let record = chunk.record(0).unwrap();
        assert_eq!(record.distance, 1.5);
        assert_eq!(record.total_amount, 12.0);
        assert_eq!(record.pickup_time.to_string(), "2023-06-17 08:00:00");
        assert_eq!(record.dropoff_time.unwrap().to_string(), "2023-06-17 08:20:00");
    }

    #[test]
    fn test_alternate_prefix_resolves_to_same_records() {
        let normalizer = SchemaNormalizer::default();
        let canonical: Vec<_> = normalizer.normalize(&trip_batch("tpep")).records().collect();
        let alternate: Vec<_> = normalizer.normalize(&trip_batch("lpep")).records().collect();
        assert_eq!(canonical, alternate);
    }

    #[test]
    fn test_null_pickup_is_invalid_timestamp() {
        let chunk = SchemaNormalizer::default().normalize(&trip_batch("tpep"));
        assert_eq!(chunk.record(1), Err(RecordError::InvalidTimestamp));
    }

    #[test]
    fn test_unknown_prefix_drops_every_record() {
        let chunk = SchemaNormalizer::default().normalize(&trip_batch("xyz"));
        assert!(!chunk.has_field(CanonicalField::PickupTime));
        assert!(chunk.has_field(CanonicalField::Distance));
        assert!(
            chunk
                .records()
                .all(|r| r == Err(RecordError::Schema(CanonicalField::PickupTime)))
        );
    }

    #[test]
    fn test_configured_alias_is_honoured() {
        let mut aliases = ColumnAliases::new();
        aliases.insert(CanonicalField::PickupTime, vec!["xyz_pickup_datetime".to_string()]);
        let chunk = SchemaNormalizer::new(aliases).normalize(&trip_batch("xyz"));
        assert!(chunk.record(0).is_ok());
    }

    #[test]
    fn test_text_and_integer_columns_are_converted() {
        let schema = Schema::new(vec![
            Field::new("pickup_datetime", DataType::Utf8, true),
            Field::new("trip_distance", DataType::Int64, true),
            Field::new("total_amount", DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec![
                    Some("2023-01-02 03:04:05"),
                    Some("not a time"),
                    Some("2023-01-02 03:04:05"),
                ])) as ArrayRef,
                Arc::new(Int64Array::from(vec![Some(3), Some(4), None])),
                Arc::new(Float64Array::from(vec![Some(7.5), Some(8.0), Some(f64::NAN)])),
            ],
        )
        .unwrap();

        let chunk = SchemaNormalizer::default().normalize(&batch);
        let records: Vec<_> = chunk.records().collect();

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.distance, 3.0);
        assert_eq!(first.dropoff_time, None);
        assert_eq!(records[1], Err(RecordError::InvalidTimestamp));
        assert_eq!(records[2], Err(RecordError::Schema(CanonicalField::Distance)));
    }

    #[test]
    fn test_non_finite_amount_is_schema_error() {
        let schema = Schema::new(vec![
            Field::new("tpep_pickup_datetime", DataType::Utf8, true),
            Field::new("trip_distance", DataType::Float64, true),
            Field::new("total_amount", DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec!["2023-01-02 03:04:05"])) as ArrayRef,
                Arc::new(Float64Array::from(vec![1.0])),
                Arc::new(Float64Array::from(vec![f64::INFINITY])),
            ],
        )
        .unwrap();

        let chunk = SchemaNormalizer::default().normalize(&batch);
        assert_eq!(
            chunk.record(0),
            Err(RecordError::Schema(CanonicalField::TotalAmount))
        );
    }
}
