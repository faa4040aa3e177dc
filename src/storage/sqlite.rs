//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! All timestamps are stored as unix milliseconds.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{
    EndpointCounts, EndpointRepository, MetricAggregate, MetricsStore, ResultStats, StreamEntry,
    StreamSink,
};
use super::error::{StorageError, StorageResult};
use crate::metrics::{MetricType, MetricValue};
use crate::{Alert, Endpoint, MonitoringResult};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations
    ///
    /// ```no_run
    /// # use api_monitor::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./api-monitor.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub async fn close(&self) {
        info!("closing SQLite backend");
        self.pool.close().await;
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn endpoint_from_row(row: &SqliteRow) -> StorageResult<Endpoint> {
        Ok(Endpoint {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            url: row.try_get("url")?,
            check_interval: row.try_get::<i64, _>("check_interval")?.max(0) as u32,
            timeout: row.try_get::<i64, _>("timeout")?.max(0) as u64,
            headers: row.try_get("headers")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn result_from_row(row: &SqliteRow) -> StorageResult<MonitoringResult> {
        Ok(MonitoringResult {
            endpoint_id: row.try_get("endpoint_id")?,
            response_time: row.try_get::<i64, _>("response_time")?.max(0) as u64,
            status_code: row
                .try_get::<Option<i64>, _>("status_code")?
                .map(|code| code as u16),
            error_message: row.try_get("error_message")?,
            checked_at: Self::millis_to_timestamp(row.try_get("checked_at")?),
        })
    }

    fn metric_from_row(row: &SqliteRow) -> StorageResult<MetricValue> {
        let type_str: String = row.try_get("type")?;
        let tags_json: String = row.try_get("tags")?;

        Ok(MetricValue {
            name: row.try_get("name")?,
            metric_type: type_str
                .parse::<MetricType>()
                .map_err(StorageError::SerializationError)?,
            value: row.try_get("value")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?),
            tags: serde_json::from_str(&tags_json)?,
            description: row.try_get("description")?,
        })
    }
}

#[async_trait]
impl EndpointRepository for SqliteBackend {
    #[instrument(skip(self))]
    async fn get_active_endpoints(&self) -> StorageResult<Vec<Endpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, url, check_interval, timeout, headers, is_active
            FROM api_endpoints
            WHERE is_active = 1
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let endpoints = rows
            .iter()
            .map(Self::endpoint_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        debug!("loaded {} active endpoints", endpoints.len());
        Ok(endpoints)
    }

    #[instrument(skip(self))]
    async fn get_alerts_for_endpoint(&self, endpoint_id: i64) -> StorageResult<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, endpoint_id, alert_type, threshold, is_active
            FROM alerts
            WHERE endpoint_id = ? AND is_active = 1
            ORDER BY id ASC
            "#,
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<Alert> {
                Ok(Alert {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    endpoint_id: row.try_get("endpoint_id")?,
                    alert_type: row.try_get("alert_type")?,
                    threshold: row.try_get("threshold")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, result), fields(endpoint_id = result.endpoint_id))]
    async fn save_result(&self, result: &MonitoringResult) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO monitoring_results (
                endpoint_id, response_time, status_code, error_message, checked_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.endpoint_id)
        .bind(result.response_time as i64)
        .bind(result.status_code.map(i64::from))
        .bind(&result.error_message)
        .bind(Self::timestamp_to_millis(&result.checked_at))
        .bind(Self::timestamp_to_millis(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_results(
        &self,
        endpoint_id: i64,
        limit: usize,
    ) -> StorageResult<Vec<MonitoringResult>> {
        let rows = sqlx::query(
            r#"
            SELECT endpoint_id, response_time, status_code, error_message, checked_at
            FROM monitoring_results
            WHERE endpoint_id = ?
            ORDER BY checked_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(endpoint_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::result_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn result_stats(&self, since: DateTime<Utc>) -> StorageResult<ResultStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(CASE WHEN status_code IS NULL OR status_code >= 400 THEN 1 ELSE 0 END), 0) AS failed,
                AVG(CASE WHEN response_time > 0 THEN response_time END) AS avg_response_time,
                MAX(CASE WHEN response_time > 0 THEN response_time END) AS max_response_time
            FROM monitoring_results
            WHERE checked_at > ?
            "#,
        )
        .bind(Self::timestamp_to_millis(&since))
        .fetch_one(&self.pool)
        .await?;

        Ok(ResultStats {
            total: row.try_get::<i64, _>("total")? as u64,
            successful: row.try_get::<i64, _>("successful")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            avg_response_time_ms: row.try_get("avg_response_time")?,
            max_response_time_ms: row
                .try_get::<Option<i64>, _>("max_response_time")?
                .map(|v| v as u64),
        })
    }

    async fn endpoint_counts(&self) -> StorageResult<EndpointCounts> {
        let (total, active): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0) FROM api_endpoints",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(EndpointCounts {
            total: total as u64,
            active: active as u64,
        })
    }

    async fn alert_count(&self) -> StorageResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alerts WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    #[instrument(skip(self, endpoint), fields(endpoint_id = endpoint.id))]
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_endpoints (id, user_id, url, check_interval, timeout, headers, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                user_id = excluded.user_id,
                url = excluded.url,
                check_interval = excluded.check_interval,
                timeout = excluded.timeout,
                headers = excluded.headers,
                is_active = excluded.is_active
            "#,
        )
        .bind(endpoint.id)
        .bind(endpoint.user_id)
        .bind(&endpoint.url)
        .bind(i64::from(endpoint.check_interval))
        .bind(endpoint.timeout as i64)
        .bind(&endpoint.headers)
        .bind(endpoint.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_alert(&self, alert: &Alert) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, user_id, endpoint_id, alert_type, threshold, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                user_id = excluded.user_id,
                endpoint_id = excluded.endpoint_id,
                alert_type = excluded.alert_type,
                threshold = excluded.threshold,
                is_active = excluded.is_active
            "#,
        )
        .bind(alert.id)
        .bind(alert.user_id)
        .bind(alert.endpoint_id)
        .bind(&alert.alert_type)
        .bind(&alert.threshold)
        .bind(alert.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StreamSink for SqliteBackend {
    #[instrument(skip(self, fields))]
    async fn append(&self, stream: &str, fields: BTreeMap<String, String>) -> StorageResult<u64> {
        let fields_json = serde_json::to_string(&fields)?;

        let result = sqlx::query(
            "INSERT INTO stream_entries (stream, fields, created_at) VALUES (?, ?, ?)",
        )
        .bind(stream)
        .bind(fields_json)
        .bind(Self::timestamp_to_millis(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid() as u64)
    }

    #[instrument(skip(self))]
    async fn read_after(
        &self,
        stream: &str,
        after_id: u64,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, stream, fields, created_at
            FROM stream_entries
            WHERE stream = ? AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(stream)
        .bind(after_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<StreamEntry> {
                let fields_json: String = row.try_get("fields")?;
                Ok(StreamEntry {
                    id: row.try_get::<i64, _>("id")? as u64,
                    stream: row.try_get("stream")?,
                    fields: serde_json::from_str(&fields_json)?,
                    created_at: Self::millis_to_timestamp(row.try_get("created_at")?),
                })
            })
            .collect()
    }
}

#[async_trait]
impl MetricsStore for SqliteBackend {
    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    async fn store(&self, metrics: &[MetricValue]) -> StorageResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for metric in metrics {
            let tags_json = serde_json::to_string(&metric.tags)?;

            sqlx::query(
                r#"
                INSERT INTO system_metrics (name, type, value, timestamp, tags, description)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&metric.name)
            .bind(metric.metric_type.to_string())
            .bind(metric.value)
            .bind(Self::timestamp_to_millis(&metric.timestamp))
            .bind(tags_json)
            .bind(&metric.description)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StorageError::QueryFailed(format!("failed to store metric '{}': {e}", metric.name))
            })?;
        }

        tx.commit().await?;

        debug!("stored {} metrics", metrics.len());
        Ok(())
    }

    async fn retrieve(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricValue>> {
        let rows = sqlx::query(
            r#"
            SELECT name, type, value, timestamp, tags, description
            FROM system_metrics
            WHERE timestamp BETWEEN ? AND ?
            ORDER BY timestamp DESC, id DESC
            "#,
        )
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::metric_from_row).collect()
    }

    async fn retrieve_by_name(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricValue>> {
        let rows = sqlx::query(
            r#"
            SELECT name, type, value, timestamp, tags, description
            FROM system_metrics
            WHERE name = ? AND timestamp BETWEEN ? AND ?
            ORDER BY timestamp DESC, id DESC
            "#,
        )
        .bind(name)
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::metric_from_row).collect()
    }

    /// SQLite has no STDDEV, so the values are folded in process
    async fn aggregate(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<MetricAggregate> {
        let values: Vec<(f64,)> = sqlx::query_as(
            "SELECT value FROM system_metrics WHERE name = ? AND timestamp BETWEEN ? AND ?",
        )
        .bind(name)
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        let values: Vec<f64> = values.into_iter().map(|(v,)| v).collect();
        Ok(MetricAggregate::from_values(name, &values))
    }
}
