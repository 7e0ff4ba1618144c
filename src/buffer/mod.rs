//! Durable local buffer: a size-capped SQLite file holding raw samples
//! and analytics outputs until the remote store acknowledges them.
//!
//! Two relations: `samples` and `analytics` (KPI and anomaly rows share
//! the latter, discriminated by `category`). Rows carry a nullable
//! `batch_id` lease and a `processed` flag; the upload pump assigns batch
//! ids, marks rows processed on acknowledged writes, and deletes them.
//! Unprocessed rows survive restarts, and stale batch leases from a
//! crashed process are cleared on open so the next `next_batch` call
//! serves those rows again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{
    AnalyticsRecord, AnomalyRecord, EnergyAnomaly, Hierarchy, KpiCategory, KpiRecord, Quality,
    Sample, Value,
};

/// Rows dropped per size-cap eviction pass.
const EVICTION_CHUNK: u64 = 1000;

#[derive(Debug, Snafu)]
pub enum BufferError {
    #[snafu(display("Unable to open buffer database {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[snafu(display("Buffer query failed: {source}"))]
    Sql { source: rusqlite::Error },
    #[snafu(display("Buffer worker task failed: {source}"))]
    Join { source: tokio::task::JoinError },
    #[snafu(display("Stored analytics payload is not valid JSON: {source}"))]
    Payload { source: serde_json::Error },
    #[snafu(display("Stored row has unknown {what}: {value}"))]
    Corrupt { what: &'static str, value: String },
}

/// Result of an append: whether the size cap forced a lossy eviction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    Stored,
    StoredEvicting { evicted_samples: u64 },
}

impl AppendOutcome {
    pub fn evicted(&self) -> u64 {
        match self {
            AppendOutcome::Stored => 0,
            AppendOutcome::StoredEvicting { evicted_samples } => *evicted_samples,
        }
    }
}

/// A leased batch of the oldest unprocessed rows.
#[derive(Debug)]
pub struct UploadBatch {
    pub batch_id: String,
    pub samples: Vec<Sample>,
    pub analytics: Vec<AnalyticsRecord>,
}

impl UploadBatch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.analytics.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct BufferStatus {
    pub bytes_used: u64,
    pub bytes_cap: u64,
    pub sample_count: u64,
    pub sample_unprocessed: u64,
    pub analytics_count: u64,
    pub analytics_unprocessed: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct Inner {
    conn: Mutex<Connection>,
    max_bytes: u64,
}

/// Handle to the on-disk buffer. Cheap to clone; all mutation funnels
/// through the serialized connection, so callers need no locks of their
/// own.
#[derive(Clone)]
pub struct DurableBuffer {
    inner: Arc<Inner>,
}

impl DurableBuffer {
    pub async fn open(path: impl AsRef<Path>, max_size_mb: u64) -> Result<Self, BufferError> {
        let path = path.as_ref().to_owned();
        let max_bytes = max_size_mb * 1024 * 1024;
        let inner = tokio::task::spawn_blocking(move || -> Result<Inner, BufferError> {
            let conn = Connection::open(&path).context(OpenSnafu { path: path.clone() })?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .context(OpenSnafu { path: path.clone() })?;
            init_schema(&conn).context(OpenSnafu { path: path.clone() })?;
            let released = release_stale_leases(&conn).context(OpenSnafu { path })?;
            if released > 0 {
                info!(
                    message = "Cleared batch leases left by a previous run; rows will be re-served.",
                    rows = released
                );
            }
            Ok(Inner {
                conn: Mutex::new(conn),
                max_bytes,
            })
        })
        .await
        .context(JoinSnafu)??;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BufferError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BufferError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = match inner.conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut *conn)
        })
        .await
        .context(JoinSnafu)?
    }

    /// Appends one sample; always succeeds while the database is healthy,
    /// but may evict old unprocessed samples to stay under the size cap.
    pub async fn append_sample(
        &self,
        sample: &Sample,
        batch_id: Option<&str>,
    ) -> Result<AppendOutcome, BufferError> {
        let sample = sample.clone();
        let batch_id = batch_id.map(str::to_owned);
        let max_bytes = self.inner.max_bytes;
        self.with_conn(move |conn| {
            insert_sample(conn, &sample, batch_id.as_deref()).context(SqlSnafu)?;
            enforce_size_cap(conn, max_bytes)
        })
        .await
    }

    pub async fn append_kpi(
        &self,
        kpi: &KpiRecord,
        batch_id: Option<&str>,
    ) -> Result<AppendOutcome, BufferError> {
        self.append_analytics(&AnalyticsRecord::Kpi(kpi.clone()), batch_id)
            .await
    }

    pub async fn append_anomaly(
        &self,
        anomaly: &AnomalyRecord,
        batch_id: Option<&str>,
    ) -> Result<AppendOutcome, BufferError> {
        self.append_analytics(&AnalyticsRecord::Anomaly(anomaly.clone()), batch_id)
            .await
    }

    pub async fn append_analytics(
        &self,
        record: &AnalyticsRecord,
        batch_id: Option<&str>,
    ) -> Result<AppendOutcome, BufferError> {
        let record = record.clone();
        let batch_id = batch_id.map(str::to_owned);
        let max_bytes = self.inner.max_bytes;
        self.with_conn(move |conn| {
            insert_analytics(conn, &record, batch_id.as_deref())?;
            enforce_size_cap(conn, max_bytes)
        })
        .await
    }

    /// All-or-nothing append of a mixed batch under one batch id.
    pub async fn append_batch(
        &self,
        samples: Vec<Sample>,
        analytics: Vec<AnalyticsRecord>,
        batch_id: &str,
    ) -> Result<AppendOutcome, BufferError> {
        let batch_id = batch_id.to_owned();
        let max_bytes = self.inner.max_bytes;
        self.with_conn(move |conn| {
            let tx = conn.transaction().context(SqlSnafu)?;
            for sample in &samples {
                insert_sample(&tx, sample, Some(&batch_id)).context(SqlSnafu)?;
            }
            for record in &analytics {
                insert_analytics(&tx, record, Some(&batch_id))?;
            }
            tx.commit().context(SqlSnafu)?;
            enforce_size_cap(conn, max_bytes)
        })
        .await
    }

    /// Leases the oldest unprocessed, unleased rows under a fresh batch
    /// id. Returns `None` when there is nothing to upload. No row is ever
    /// part of two leases.
    pub async fn next_batch(
        &self,
        max_samples: usize,
        max_analytics: usize,
    ) -> Result<Option<UploadBatch>, BufferError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().context(SqlSnafu)?;
            let batch_id = Uuid::new_v4().to_string();

            let leased_samples = tx
                .execute(
                    "UPDATE samples SET batch_id = ?1 WHERE id IN (
                         SELECT id FROM samples
                         WHERE processed = 0 AND batch_id IS NULL
                         ORDER BY id ASC LIMIT ?2
                     )",
                    params![batch_id, max_samples as i64],
                )
                .context(SqlSnafu)?;
            let leased_analytics = tx
                .execute(
                    "UPDATE analytics SET batch_id = ?1 WHERE id IN (
                         SELECT id FROM analytics
                         WHERE processed = 0 AND batch_id IS NULL
                         ORDER BY id ASC LIMIT ?2
                     )",
                    params![batch_id, max_analytics as i64],
                )
                .context(SqlSnafu)?;

            if leased_samples == 0 && leased_analytics == 0 {
                return Ok(None);
            }

            let samples = select_samples(&tx, &batch_id)?;
            let analytics = select_analytics(&tx, &batch_id)?;
            tx.commit().context(SqlSnafu)?;

            Ok(Some(UploadBatch {
                batch_id,
                samples,
                analytics,
            }))
        })
        .await
    }

    /// Flips `processed` on every row of the batch.
    pub async fn mark_processed(&self, batch_id: &str) -> Result<u64, BufferError> {
        let batch_id = batch_id.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context(SqlSnafu)?;
            let mut rows = tx
                .execute(
                    "UPDATE samples SET processed = 1 WHERE batch_id = ?1",
                    params![batch_id],
                )
                .context(SqlSnafu)?;
            rows += tx
                .execute(
                    "UPDATE analytics SET processed = 1 WHERE batch_id = ?1",
                    params![batch_id],
                )
                .context(SqlSnafu)?;
            tx.commit().context(SqlSnafu)?;
            Ok(rows as u64)
        })
        .await
    }

    /// Removes every row of an acknowledged batch.
    pub async fn delete_batch(&self, batch_id: &str) -> Result<u64, BufferError> {
        let batch_id = batch_id.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context(SqlSnafu)?;
            let mut rows = tx
                .execute("DELETE FROM samples WHERE batch_id = ?1", params![batch_id])
                .context(SqlSnafu)?;
            rows += tx
                .execute(
                    "DELETE FROM analytics WHERE batch_id = ?1",
                    params![batch_id],
                )
                .context(SqlSnafu)?;
            tx.commit().context(SqlSnafu)?;
            debug!(message = "Deleted acknowledged batch.", batch_id = %batch_id, rows);
            Ok(rows as u64)
        })
        .await
    }

    /// Clears the lease after a failed upload so the rows become eligible
    /// for a later batch.
    pub async fn release_batch(&self, batch_id: &str) -> Result<u64, BufferError> {
        let batch_id = batch_id.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context(SqlSnafu)?;
            let mut rows = tx
                .execute(
                    "UPDATE samples SET batch_id = NULL WHERE batch_id = ?1 AND processed = 0",
                    params![batch_id],
                )
                .context(SqlSnafu)?;
            rows += tx
                .execute(
                    "UPDATE analytics SET batch_id = NULL WHERE batch_id = ?1 AND processed = 0",
                    params![batch_id],
                )
                .context(SqlSnafu)?;
            tx.commit().context(SqlSnafu)?;
            Ok(rows as u64)
        })
        .await
    }

    /// Compaction: drops processed rows older than the given horizon.
    pub async fn delete_processed_older_than(&self, hours: i64) -> Result<u64, BufferError> {
        self.with_conn(move |conn| delete_processed_older_than_sync(conn, hours))
            .await
    }

    pub async fn status(&self) -> Result<BufferStatus, BufferError> {
        let max_bytes = self.inner.max_bytes;
        self.with_conn(move |conn| {
            let (sample_count, sample_unprocessed, sample_oldest, sample_newest) =
                table_stats(conn, "samples")?;
            let (analytics_count, analytics_unprocessed, analytics_oldest, analytics_newest) =
                table_stats(conn, "analytics")?;
            Ok(BufferStatus {
                bytes_used: bytes_used(conn).context(SqlSnafu)?,
                bytes_cap: max_bytes,
                sample_count,
                sample_unprocessed,
                analytics_count,
                analytics_unprocessed,
                oldest: [sample_oldest, analytics_oldest].into_iter().flatten().min(),
                newest: [sample_newest, analytics_newest].into_iter().flatten().max(),
            })
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    // auto_vacuum must be configured before the first table is created;
    // with it, deletes release file pages and the size cap is enforceable.
    conn.execute_batch("PRAGMA auto_vacuum = FULL;")?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS samples (
             id         INTEGER PRIMARY KEY AUTOINCREMENT,
             timestamp  TEXT NOT NULL,
             enterprise TEXT NOT NULL,
             site       TEXT NOT NULL,
             area       TEXT NOT NULL,
             line       TEXT NOT NULL,
             machine    TEXT NOT NULL,
             tag        TEXT NOT NULL,
             value_kind TEXT NOT NULL,
             value      TEXT NOT NULL,
             unit       TEXT,
             quality    TEXT NOT NULL,
             created_at TEXT NOT NULL,
             processed  INTEGER NOT NULL DEFAULT 0,
             batch_id   TEXT
         );
         CREATE TABLE IF NOT EXISTS analytics (
             id         INTEGER PRIMARY KEY AUTOINCREMENT,
             timestamp  TEXT NOT NULL,
             asset_name TEXT NOT NULL,
             category   TEXT NOT NULL,
             payload    TEXT NOT NULL,
             created_at TEXT NOT NULL,
             processed  INTEGER NOT NULL DEFAULT 0,
             batch_id   TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_samples_processed ON samples(processed, created_at);
         CREATE INDEX IF NOT EXISTS idx_samples_batch ON samples(batch_id);
         CREATE INDEX IF NOT EXISTS idx_analytics_category
             ON analytics(category, processed, created_at);
         CREATE INDEX IF NOT EXISTS idx_analytics_batch ON analytics(batch_id);",
    )
}

fn release_stale_leases(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let mut rows = conn.execute(
        "UPDATE samples SET batch_id = NULL WHERE processed = 0 AND batch_id IS NOT NULL",
        [],
    )?;
    rows += conn.execute(
        "UPDATE analytics SET batch_id = NULL WHERE processed = 0 AND batch_id IS NOT NULL",
        [],
    )?;
    Ok(rows as u64)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, BufferError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .context(CorruptSnafu {
            what: "timestamp",
            value: raw.to_owned(),
        })
}

fn insert_sample(
    conn: &Connection,
    sample: &Sample,
    batch_id: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO samples
             (timestamp, enterprise, site, area, line, machine, tag,
              value_kind, value, unit, quality, created_at, processed, batch_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13)",
        params![
            format_ts(sample.timestamp),
            sample.hierarchy.enterprise,
            sample.hierarchy.site,
            sample.hierarchy.area,
            sample.hierarchy.line,
            sample.hierarchy.machine,
            sample.tag,
            sample.value.kind(),
            sample.value.to_string(),
            sample.unit,
            sample.quality.as_str(),
            format_ts(Utc::now()),
            batch_id,
        ],
    )?;
    Ok(())
}

/// Analytics payload persisted as JSON. KPI rows store the metrics map;
/// anomaly rows store the scoring fields.
#[derive(Serialize, Deserialize)]
struct AnomalyPayload {
    tag: String,
    current_value: f64,
    baseline_mean: f64,
    z_score: f64,
    is_anomaly: bool,
    threshold_anomaly: bool,
    trend: f64,
    maintenance_score: f64,
    prediction_horizon_hours: u32,
    #[serde(default)]
    energy_anomalies: std::collections::BTreeMap<String, EnergyAnomaly>,
}

fn insert_analytics(
    conn: &Connection,
    record: &AnalyticsRecord,
    batch_id: Option<&str>,
) -> Result<(), BufferError> {
    let payload = match record {
        AnalyticsRecord::Kpi(kpi) => serde_json::to_string(&kpi.metrics).context(PayloadSnafu)?,
        AnalyticsRecord::Anomaly(anomaly) => serde_json::to_string(&AnomalyPayload {
            tag: anomaly.tag.clone(),
            current_value: anomaly.current_value,
            baseline_mean: anomaly.baseline_mean,
            z_score: anomaly.z_score,
            is_anomaly: anomaly.is_anomaly,
            threshold_anomaly: anomaly.threshold_anomaly,
            trend: anomaly.trend,
            maintenance_score: anomaly.maintenance_score,
            prediction_horizon_hours: anomaly.prediction_horizon_hours,
            energy_anomalies: anomaly.energy_anomalies.clone(),
        })
        .context(PayloadSnafu)?,
    };
    conn.execute(
        "INSERT INTO analytics
             (timestamp, asset_name, category, payload, created_at, processed, batch_id)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            format_ts(record.timestamp()),
            record.asset_name(),
            record.category(),
            payload,
            format_ts(Utc::now()),
            batch_id,
        ],
    )
    .context(SqlSnafu)?;
    Ok(())
}

fn select_samples(tx: &Transaction<'_>, batch_id: &str) -> Result<Vec<Sample>, BufferError> {
    let mut stmt = tx
        .prepare(
            "SELECT timestamp, enterprise, site, area, line, machine, tag,
                    value_kind, value, unit, quality
             FROM samples WHERE batch_id = ?1 ORDER BY id ASC",
        )
        .context(SqlSnafu)?;
    let rows = stmt
        .query_map(params![batch_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, String>(10)?,
            ))
        })
        .context(SqlSnafu)?;

    let mut samples = Vec::new();
    for row in rows {
        let (ts, enterprise, site, area, line, machine, tag, kind, value, unit, quality) =
            row.context(SqlSnafu)?;
        samples.push(Sample {
            timestamp: parse_ts(&ts)?,
            hierarchy: Hierarchy {
                enterprise,
                site,
                area,
                line,
                machine,
            },
            tag,
            value: decode_value(&kind, &value)?,
            unit,
            quality: Quality::parse(&quality).context(CorruptSnafu {
                what: "quality",
                value: quality.clone(),
            })?,
        });
    }
    Ok(samples)
}

fn decode_value(kind: &str, raw: &str) -> Result<Value, BufferError> {
    match kind {
        "float" => raw.parse::<f64>().map(Value::Float).ok(),
        "integer" => raw.parse::<i64>().map(Value::Integer).ok(),
        "bool" => raw.parse::<bool>().map(Value::Bool).ok(),
        "string" => Some(Value::String(raw.to_owned())),
        _ => None,
    }
    .context(CorruptSnafu {
        what: "value",
        value: format!("{kind}:{raw}"),
    })
}

fn select_analytics(
    tx: &Transaction<'_>,
    batch_id: &str,
) -> Result<Vec<AnalyticsRecord>, BufferError> {
    let mut stmt = tx
        .prepare(
            "SELECT timestamp, asset_name, category, payload
             FROM analytics WHERE batch_id = ?1 ORDER BY id ASC",
        )
        .context(SqlSnafu)?;
    let rows = stmt
        .query_map(params![batch_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context(SqlSnafu)?;

    let mut records = Vec::new();
    for row in rows {
        let (ts, asset_name, category, payload) = row.context(SqlSnafu)?;
        let timestamp = parse_ts(&ts)?;
        let record = if category == "predictive" {
            let decoded: AnomalyPayload = serde_json::from_str(&payload).context(PayloadSnafu)?;
            AnalyticsRecord::Anomaly(AnomalyRecord {
                timestamp,
                asset_name,
                tag: decoded.tag,
                current_value: decoded.current_value,
                baseline_mean: decoded.baseline_mean,
                z_score: decoded.z_score,
                is_anomaly: decoded.is_anomaly,
                threshold_anomaly: decoded.threshold_anomaly,
                trend: decoded.trend,
                maintenance_score: decoded.maintenance_score,
                prediction_horizon_hours: decoded.prediction_horizon_hours,
                energy_anomalies: decoded.energy_anomalies,
            })
        } else {
            let kpi_category = KpiCategory::parse(&category).context(CorruptSnafu {
                what: "category",
                value: category.clone(),
            })?;
            AnalyticsRecord::Kpi(KpiRecord {
                timestamp,
                asset_name,
                category: kpi_category,
                metrics: serde_json::from_str(&payload).context(PayloadSnafu)?,
            })
        };
        records.push(record);
    }
    Ok(records)
}

fn table_stats(
    conn: &Connection,
    table: &str,
) -> Result<(u64, u64, Option<DateTime<Utc>>, Option<DateTime<Utc>>), BufferError> {
    let sql = format!(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN processed = 0 THEN 1 ELSE 0 END), 0),
                MIN(created_at), MAX(created_at)
         FROM {table}"
    );
    let (count, unprocessed, oldest, newest): (i64, i64, Option<String>, Option<String>) = conn
        .query_row(&sql, [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .context(SqlSnafu)?;
    let oldest = oldest.as_deref().map(parse_ts).transpose()?;
    let newest = newest.as_deref().map(parse_ts).transpose()?;
    Ok((count as u64, unprocessed as u64, oldest, newest))
}

fn bytes_used(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok((page_count * page_size) as u64)
}

fn delete_processed_older_than_sync(
    conn: &mut Connection,
    hours: i64,
) -> Result<u64, BufferError> {
    let cutoff = format_ts(Utc::now() - chrono::Duration::hours(hours));
    let tx = conn.transaction().context(SqlSnafu)?;
    let mut rows = tx
        .execute(
            "DELETE FROM samples WHERE processed = 1 AND created_at < ?1",
            params![cutoff],
        )
        .context(SqlSnafu)?;
    rows += tx
        .execute(
            "DELETE FROM analytics WHERE processed = 1 AND created_at < ?1",
            params![cutoff],
        )
        .context(SqlSnafu)?;
    tx.commit().context(SqlSnafu)?;
    Ok(rows as u64)
}

/// The size-cap ladder: processed rows older than an hour go first; if
/// that is not enough, the oldest unprocessed samples are dropped.
/// Analytics rows are never evicted. Eviction is lossy and reported.
fn enforce_size_cap(conn: &mut Connection, max_bytes: u64) -> Result<AppendOutcome, BufferError> {
    if bytes_used(conn).context(SqlSnafu)? <= max_bytes {
        return Ok(AppendOutcome::Stored);
    }

    let compacted = delete_processed_older_than_sync(conn, 1)?;
    if bytes_used(conn).context(SqlSnafu)? <= max_bytes {
        if compacted > 0 {
            debug!(
                message = "Buffer size cap satisfied by compacting processed rows.",
                rows = compacted
            );
        }
        return Ok(AppendOutcome::Stored);
    }

    let evicted = conn
        .execute(
            "DELETE FROM samples WHERE id IN (
                 SELECT id FROM samples WHERE processed = 0
                 ORDER BY id ASC LIMIT ?1
             )",
            params![EVICTION_CHUNK as i64],
        )
        .context(SqlSnafu)? as u64;

    if evicted > 0 {
        warn!(
            message = "Buffer over size cap; dropped oldest unprocessed samples.",
            evicted,
            max_bytes
        );
        counter!("buffer_evicted_samples_total").increment(evicted);
        Ok(AppendOutcome::StoredEvicting {
            evicted_samples: evicted,
        })
    } else {
        Ok(AppendOutcome::Stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use crate::test_util::{kpi_record, sample_with};

    async fn temp_buffer(max_mb: u64) -> (tempfile::TempDir, DurableBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DurableBuffer::open(dir.path().join("buffer.db"), max_mb)
            .await
            .unwrap();
        (dir, buffer)
    }

    #[tokio::test]
    async fn sample_round_trips_through_a_batch() {
        let (_dir, buffer) = temp_buffer(10).await;
        let sample = sample_with("MotorSpeed", Value::Float(1789.25));
        buffer.append_sample(&sample, None).await.unwrap();

        let batch = buffer.next_batch(10, 10).await.unwrap().expect("batch");
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].tag, sample.tag);
        assert_eq!(batch.samples[0].value, sample.value);
        assert_eq!(batch.samples[0].quality, sample.quality);
        assert_eq!(batch.samples[0].hierarchy, sample.hierarchy);
    }

    #[tokio::test]
    async fn next_batch_never_serves_a_row_twice() {
        let (_dir, buffer) = temp_buffer(10).await;
        for i in 0..5 {
            buffer
                .append_sample(&sample_with("T", Value::Integer(i)), None)
                .await
                .unwrap();
        }
        let first = buffer.next_batch(3, 0).await.unwrap().expect("batch");
        assert_eq!(first.samples.len(), 3);
        let second = buffer.next_batch(10, 0).await.unwrap().expect("batch");
        assert_eq!(second.samples.len(), 2);
        assert!(buffer.next_batch(10, 10).await.unwrap().is_none());
        assert_ne!(first.batch_id, second.batch_id);
    }

    #[tokio::test]
    async fn release_makes_rows_eligible_again() {
        let (_dir, buffer) = temp_buffer(10).await;
        buffer
            .append_sample(&sample_with("T", Value::Float(1.0)), None)
            .await
            .unwrap();
        let batch = buffer.next_batch(10, 10).await.unwrap().expect("batch");
        assert!(buffer.next_batch(10, 10).await.unwrap().is_none());
        buffer.release_batch(&batch.batch_id).await.unwrap();
        let retry = buffer.next_batch(10, 10).await.unwrap().expect("batch");
        assert_eq!(retry.samples.len(), 1);
        assert_ne!(retry.batch_id, batch.batch_id);
    }

    #[tokio::test]
    async fn mark_and_delete_drain_the_batch() {
        let (_dir, buffer) = temp_buffer(10).await;
        buffer
            .append_sample(&sample_with("T", Value::Float(1.0)), None)
            .await
            .unwrap();
        buffer
            .append_kpi(&kpi_record("Press01"), None)
            .await
            .unwrap();
        let batch = buffer.next_batch(10, 10).await.unwrap().expect("batch");
        assert_eq!(buffer.mark_processed(&batch.batch_id).await.unwrap(), 2);
        assert_eq!(buffer.delete_batch(&batch.batch_id).await.unwrap(), 2);
        let status = buffer.status().await.unwrap();
        assert_eq!(status.sample_count, 0);
        assert_eq!(status.analytics_count, 0);
    }

    #[tokio::test]
    async fn unacknowledged_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        let buffer = DurableBuffer::open(&path, 10).await.unwrap();
        for i in 0..4 {
            buffer
                .append_sample(&sample_with("T", Value::Integer(i)), None)
                .await
                .unwrap();
        }
        // A batch is leased but never marked processed: the crash window.
        let batch = buffer.next_batch(2, 0).await.unwrap().expect("batch");
        assert_eq!(batch.samples.len(), 2);
        drop(buffer);

        let reopened = DurableBuffer::open(&path, 10).await.unwrap();
        let replay = reopened.next_batch(10, 10).await.unwrap().expect("batch");
        // All four rows come back, the stale lease included.
        assert_eq!(replay.samples.len(), 4);
    }

    #[tokio::test]
    async fn analytics_round_trip_preserves_kind_and_metrics() {
        let (_dir, buffer) = temp_buffer(10).await;
        let kpi = kpi_record("Press01");
        buffer.append_kpi(&kpi, None).await.unwrap();

        let anomaly = AnomalyRecord {
            timestamp: Utc::now(),
            asset_name: "Press01".into(),
            tag: "BearingVib".into(),
            current_value: 8.0,
            baseline_mean: 2.0,
            z_score: 30.0,
            is_anomaly: true,
            threshold_anomaly: true,
            trend: 0.2,
            maintenance_score: 100.0,
            prediction_horizon_hours: 24,
            energy_anomalies: Default::default(),
        };
        buffer.append_anomaly(&anomaly, None).await.unwrap();

        let batch = buffer.next_batch(10, 10).await.unwrap().expect("batch");
        assert_eq!(batch.analytics.len(), 2);
        match &batch.analytics[0] {
            AnalyticsRecord::Kpi(stored) => assert_eq!(stored.metrics, kpi.metrics),
            other => panic!("expected kpi, got {other:?}"),
        }
        match &batch.analytics[1] {
            AnalyticsRecord::Anomaly(stored) => {
                assert_eq!(stored.tag, anomaly.tag);
                assert!(stored.is_anomaly);
                assert_eq!(stored.maintenance_score, 100.0);
            }
            other => panic!("expected anomaly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn atomic_batch_append_is_all_or_nothing_under_readers() {
        let (_dir, buffer) = temp_buffer(10).await;
        let samples: Vec<Sample> = (0..10)
            .map(|i| sample_with("T", Value::Integer(i)))
            .collect();
        let analytics = vec![AnalyticsRecord::Kpi(kpi_record("Press01"))];
        buffer
            .append_batch(samples, analytics, "restore-1")
            .await
            .unwrap();
        let status = buffer.status().await.unwrap();
        assert_eq!(status.sample_count, 10);
        assert_eq!(status.analytics_count, 1);
    }

    #[tokio::test]
    async fn size_cap_evicts_unprocessed_samples_but_never_analytics() {
        // A 0 MB cap forces the eviction ladder on every append.
        let (_dir, buffer) = temp_buffer(0).await;
        for _ in 0..5 {
            buffer
                .append_kpi(&kpi_record("Press01"), None)
                .await
                .unwrap();
        }
        let mut evicted_any = false;
        for _ in 0..50 {
            let outcome = buffer
                .append_sample(&sample_with("T", Value::String("x".repeat(512))), None)
                .await
                .unwrap();
            evicted_any |= outcome.evicted() > 0;
        }
        assert!(evicted_any, "size cap never triggered eviction");
        let status = buffer.status().await.unwrap();
        // Analytics are preferentially retained.
        assert_eq!(status.analytics_count, 5);
    }

    #[tokio::test]
    async fn status_reports_counts_and_bounds() {
        let (_dir, buffer) = temp_buffer(10).await;
        buffer
            .append_sample(&sample_with("T", Value::Float(1.0)), None)
            .await
            .unwrap();
        let status = buffer.status().await.unwrap();
        assert_eq!(status.sample_count, 1);
        assert_eq!(status.sample_unprocessed, 1);
        assert_eq!(status.bytes_cap, 10 * 1024 * 1024);
        assert!(status.bytes_used > 0);
        assert!(status.oldest.is_some());
        assert!(status.newest >= status.oldest);
    }
}
