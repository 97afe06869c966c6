//! SQLite persistence boundary + HTTP fetch utilities for chargelog.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chargelog_core::{CommentEvent, Facility, StationId, StatusEvent, StatusTuple};
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::types::Json;
use sqlx::{Connection, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        station_id INTEGER PRIMARY KEY,
        title TEXT,
        operator TEXT,
        lat REAL,
        lon REAL,
        max_power_kw REAL,
        num_points INTEGER,
        last_seen_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS status_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        station_id INTEGER NOT NULL,
        status TEXT,
        is_operational BOOLEAN,
        comment_type_title TEXT,
        checkin_status_title TEXT,
        comment_text TEXT,
        recorded_at TEXT NOT NULL,
        raw_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_status_history_station
        ON status_history (station_id, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comment_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        station_id INTEGER NOT NULL,
        comment_id TEXT NOT NULL,
        comment_type_title TEXT,
        checkin_status_title TEXT,
        comment_text TEXT,
        comment_date TEXT,
        recorded_at TEXT NOT NULL,
        raw_json TEXT NOT NULL,
        UNIQUE (station_id, comment_id)
    )
    "#,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening database {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("bootstrapping schema: {0}")]
    Bootstrap(#[source] sqlx::Error),
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

/// Row counts across the three tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub stations: i64,
    pub status_events: i64,
    pub comment_events: i64,
}

/// Comment row as the deduplicator wants it written.
#[derive(Debug, Clone, Copy)]
pub struct NewCommentEvent<'a> {
    pub station_id: StationId,
    pub comment_id: &'a str,
    pub comment_type_title: Option<&'a str>,
    pub checkin_status_title: Option<&'a str>,
    pub comment_text: Option<&'a str>,
    pub comment_date: Option<&'a str>,
    pub recorded_at: DateTime<Utc>,
    pub raw_json: &'a JsonValue,
}

/// Handle on the history database.
///
/// The pool holds a single connection, so whoever owns the `Store` owns the database
/// for the duration of a run. Only one ingesting process may target a database file
/// at a time; nothing here guards against a second writer.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn parse_url(database_url: &str) -> Result<SqliteConnectOptions, StoreError> {
    SqliteConnectOptions::from_str(database_url).map_err(|source| StoreError::InvalidUrl {
        url: database_url.to_string(),
        source,
    })
}

impl Store {
    /// Open (creating if needed) the database named by a `sqlite:` url.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with(parse_url(database_url)?, true).await
    }

    /// Open the database named by a `sqlite:` url, failing if the file does not exist.
    pub async fn connect_existing(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with(parse_url(database_url)?, false).await
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref()), true).await
    }

    async fn connect_with(options: SqliteConnectOptions, create: bool) -> Result<Self, StoreError> {
        let path = options.get_filename().to_path_buf();
        if create {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.create_if_missing(create))
            .await
            .map_err(|source| StoreError::Connect {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "opened history database");
        Ok(Self { pool })
    }

    /// Create every table and index that does not exist yet. Safe to call on every run.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Bootstrap)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Bootstrap)?;
        }
        tx.commit().await.map_err(StoreError::Bootstrap)?;
        Ok(())
    }

    /// Start the transaction that scopes one poll cycle.
    pub async fn begin(&self) -> Result<Batch<'static>, StoreError> {
        Ok(Batch {
            tx: self.pool.begin().await?,
        })
    }

    /// Release the connection. Dropping the store has the same effect, without waiting.
    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn facility(&self, station_id: StationId) -> Result<Option<Facility>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT station_id, title, operator, lat, lon, max_power_kw, num_points
              FROM stations
             WHERE station_id = ?
            "#,
        )
        .bind(station_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(facility_from_row).transpose()?)
    }

    /// Full status history of a station in insertion order.
    pub async fn status_history(&self, station_id: StationId) -> Result<Vec<StatusEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, station_id, status, is_operational, comment_type_title,
                   checkin_status_title, comment_text, recorded_at, raw_json
              FROM status_history
             WHERE station_id = ?
             ORDER BY id
            "#,
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(status_event_from_row)
            .collect::<Result<_, _>>()?)
    }

    pub async fn comment_events(&self, station_id: StationId) -> Result<Vec<CommentEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, station_id, comment_id, comment_type_title, checkin_status_title,
                   comment_text, comment_date, recorded_at, raw_json
              FROM comment_events
             WHERE station_id = ?
             ORDER BY id
            "#,
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(comment_event_from_row)
            .collect::<Result<_, _>>()?)
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM stations) AS stations,
                   (SELECT COUNT(*) FROM status_history) AS status_events,
                   (SELECT COUNT(*) FROM comment_events) AS comment_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            stations: row.try_get("stations")?,
            status_events: row.try_get("status_events")?,
            comment_events: row.try_get("comment_events")?,
        })
    }
}

/// A transaction on the history database.
///
/// The outermost batch is a real transaction; batches opened with [`Batch::savepoint`]
/// are SQLite savepoints nested inside it. A batch dropped without [`Batch::commit`]
/// rolls back.
pub struct Batch<'c> {
    tx: Transaction<'c, Sqlite>,
}

impl<'c> Batch<'c> {
    pub async fn savepoint(&mut self) -> Result<Batch<'_>, StoreError> {
        let tx = Connection::begin(&mut *self.tx).await?;
        Ok(Batch { tx })
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Insert the station, or overwrite every attribute of the existing row.
    pub async fn upsert_facility(
        &mut self,
        facility: &Facility,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stations (station_id, title, operator, lat, lon, max_power_kw, num_points, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(station_id) DO UPDATE SET
                title = excluded.title,
                operator = excluded.operator,
                lat = excluded.lat,
                lon = excluded.lon,
                max_power_kw = excluded.max_power_kw,
                num_points = excluded.num_points,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(facility.station_id)
        .bind(&facility.title)
        .bind(&facility.operator)
        .bind(facility.lat)
        .bind(facility.lon)
        .bind(facility.max_power_kw)
        .bind(facility.num_points)
        .bind(seen_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Most recently inserted status row for a station, by insertion sequence.
    pub async fn latest_status_event(
        &mut self,
        station_id: StationId,
    ) -> Result<Option<StatusEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, station_id, status, is_operational, comment_type_title,
                   checkin_status_title, comment_text, recorded_at, raw_json
              FROM status_history
             WHERE station_id = ?
             ORDER BY id DESC
             LIMIT 1
            "#,
        )
        .bind(station_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(status_event_from_row).transpose()?)
    }

    /// Append a status row and return its insertion sequence.
    pub async fn append_status_event(
        &mut self,
        station_id: StationId,
        tuple: &StatusTuple,
        recorded_at: DateTime<Utc>,
        raw_json: &JsonValue,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO status_history (
                station_id, status, is_operational, comment_type_title,
                checkin_status_title, comment_text, recorded_at, raw_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(station_id)
        .bind(&tuple.status)
        .bind(tuple.is_operational)
        .bind(&tuple.comment_type_title)
        .bind(&tuple.checkin_status_title)
        .bind(&tuple.comment_text)
        .bind(recorded_at)
        .bind(Json(raw_json))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn comment_exists(
        &mut self,
        station_id: StationId,
        comment_id: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present
              FROM comment_events
             WHERE station_id = ? AND comment_id = ?
             LIMIT 1
            "#,
        )
        .bind(station_id)
        .bind(comment_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.is_some())
    }

    /// Insert a comment row. Fails on a duplicate `(station_id, comment_id)`.
    pub async fn insert_comment_event(
        &mut self,
        comment: &NewCommentEvent<'_>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO comment_events (
                station_id, comment_id, comment_type_title, checkin_status_title,
                comment_text, comment_date, recorded_at, raw_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(comment.station_id)
        .bind(comment.comment_id)
        .bind(comment.comment_type_title)
        .bind(comment.checkin_status_title)
        .bind(comment.comment_text)
        .bind(comment.comment_date)
        .bind(comment.recorded_at)
        .bind(Json(comment.raw_json))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

fn facility_from_row(row: &SqliteRow) -> Result<Facility, sqlx::Error> {
    Ok(Facility {
        station_id: row.try_get("station_id")?,
        title: row.try_get("title")?,
        operator: row.try_get("operator")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
        max_power_kw: row.try_get("max_power_kw")?,
        num_points: row.try_get("num_points")?,
    })
}

fn status_event_from_row(row: &SqliteRow) -> Result<StatusEvent, sqlx::Error> {
    let raw: Json<JsonValue> = row.try_get("raw_json")?;
    Ok(StatusEvent {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        tuple: StatusTuple {
            status: row.try_get("status")?,
            is_operational: row.try_get("is_operational")?,
            comment_type_title: row.try_get("comment_type_title")?,
            checkin_status_title: row.try_get("checkin_status_title")?,
            comment_text: row.try_get("comment_text")?,
        },
        recorded_at: row.try_get("recorded_at")?,
        raw_json: raw.0,
    })
}

fn comment_event_from_row(row: &SqliteRow) -> Result<CommentEvent, sqlx::Error> {
    let raw: Json<JsonValue> = row.try_get("raw_json")?;
    Ok(CommentEvent {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        comment_id: row.try_get("comment_id")?,
        comment_type_title: row.try_get("comment_type_title")?,
        checkin_status_title: row.try_get("checkin_status_title")?,
        comment_text: row.try_get("comment_text")?,
        comment_date: row.try_get("comment_date")?,
        recorded_at: row.try_get("recorded_at")?,
        raw_json: raw.0,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {host}")]
    HttpStatus { status: u16, host: String },
}

/// Retrying GET client. Poll cycles are sequential, so requests are never issued concurrently.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures. Query strings are kept out of the logs
    /// because they may carry an API key.
    pub async fn fetch_bytes(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        let host = url.host_str().unwrap_or_default().to_string();
        let span = info_span!("http_fetch", host = %host, path = url.path());
        self.fetch_with_retries(url, &host).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &Url, host: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { status, body });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable || !can_retry {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            host: host.to_string(),
                        });
                    }
                    debug!(attempt, status = status.as_u16(), "retrying after http status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !can_retry {
                        return Err(FetchError::Request(err.without_url()));
                    }
                    debug!(attempt, error = %err.without_url(), "retrying after request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
