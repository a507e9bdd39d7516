use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::io::Write;
use tracing::info;

use super::TableSink;
use crate::aggregation::finalize::{FinalizedGroupStats, FinalizedTable};

/// JSON document uploaded for each table.
#[derive(Serialize)]
struct TableDocument<'a> {
    table: &'a str,
    key_column: &'a str,
    generated_at: DateTime<Utc>,
    rows: Vec<KeyedRow<'a>>,
}

/// A row whose key is emitted under the table's key column, matching the
/// CSV layout.
struct KeyedRow<'a> {
    key_column: &'a str,
    row: &'a FinalizedGroupStats,
}

impl Serialize for KeyedRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let row = self.row;
        let mut map = serializer.serialize_map(Some(11))?;
        map.serialize_entry(self.key_column, &row.key)?;
        map.serialize_entry("trip_count", &row.trip_count)?;
        map.serialize_entry("avg_distance", &row.avg_distance)?;
        map.serialize_entry("max_distance", &row.max_distance)?;
        map.serialize_entry("std_distance", &row.std_distance)?;
        map.serialize_entry("min_distance", &row.min_distance)?;
        map.serialize_entry("q1_distance", &row.q1_distance)?;
        map.serialize_entry("median_distance", &row.median_distance)?;
        map.serialize_entry("q3_distance", &row.q3_distance)?;
        map.serialize_entry("avg_amount", &row.avg_amount)?;
        map.serialize_entry("total_amount", &row.total_amount)?;
        map.end()
    }
}

/// Uploads each table as `{prefix}/{name}.json`, optionally gzip-compressed.
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    gzip: bool,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: &str, prefix: &str, gzip: bool) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
            gzip,
        }
    }

    /// Builds a sink from the ambient AWS configuration (env vars, instance
    /// profile, etc.).
    pub async fn from_env(bucket: &str, prefix: &str, gzip: bool) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, prefix, gzip)
    }

    pub fn object_key(&self, name: &str) -> String {
        let file = if self.gzip {
            format!("{name}.json.gz")
        } else {
            format!("{name}.json")
        };
        if self.prefix.is_empty() {
            file
        } else {
            format!("{}/{}", self.prefix, file)
        }
    }
}

/// Serializes `table` to JSON, gzip-compressed when requested.
fn encode_table(table: &FinalizedTable, gzip: bool) -> Result<Vec<u8>> {
    let document = TableDocument {
        table: &table.name,
        key_column: table.key_column,
        generated_at: Utc::now(),
        rows: table
            .rows
            .iter()
            .map(|row| KeyedRow {
                key_column: table.key_column,
                row,
            })
            .collect(),
    };
    let body = serde_json::to_vec(&document)?;

    if !gzip {
        return Ok(body);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)?;
    Ok(encoder.finish()?)
}

#[async_trait]
impl TableSink for S3Sink {
    async fn write_table(&self, table: &FinalizedTable) -> Result<()> {
        let key = self.object_key(&table.name);
        let body = encode_table(table, self.gzip)?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json");
        if self.gzip {
            request = request.content_encoding("gzip");
        }

        request
            .send()
            .await
            .with_context(|| format!("uploading s3://{}/{}", self.bucket, key))?;

        info!(table = %table.name, rows = table.rows.len(), bucket = %self.bucket, key = %key, "Table uploaded");
        Ok(())
    }
}
