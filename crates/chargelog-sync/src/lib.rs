//! Poll-cycle orchestration: fetch snapshots, fold them into the history store.

mod comments;
mod detect;
mod ingest;
mod upsert;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chargelog_adapters::{OpenChargeMapQuery, OpenChargeMapSource, SnapshotSource, SourceError};
use chargelog_core::{CommentEvent, Facility, StationId, StatusEvent};
use chargelog_storage::{HttpClientConfig, HttpFetcher, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use comments::{CommentDeduplicator, CommentError, CommentOutcome};
pub use detect::{needs_event, StatusChange, StatusChangeDetector};
pub use ingest::{
    BatchError, BatchReport, IngestCounts, IngestIssue, RecordError, RecordOutcome, RecordReport,
    SnapshotIngestor,
};
pub use upsert::StationUpserter;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub api_key: Option<String>,
    pub country_code: String,
    pub max_results: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/ev.db".to_string(),
            api_key: None,
            country_code: "DE".to_string(),
            max_results: 500,
            http_timeout_secs: 15,
            user_agent: "chargelog/0.1".to_string(),
            scheduler_enabled: false,
            poll_cron: "0 */15 * * * *".to_string(),
        }
    }
}

impl IngestConfig {
    /// Read once at startup; the resulting value is passed down explicitly.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("CHARGELOG_DATABASE_URL").unwrap_or(defaults.database_url),
            api_key: std::env::var("OCM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            country_code: std::env::var("CHARGELOG_COUNTRY_CODE").unwrap_or(defaults.country_code),
            max_results: std::env::var("CHARGELOG_MAX_RESULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_results),
            http_timeout_secs: std::env::var("CHARGELOG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("CHARGELOG_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("CHARGELOG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            poll_cron: std::env::var("CHARGELOG_POLL_CRON").unwrap_or(defaults.poll_cron),
        }
    }

    pub fn open_charge_map_query(&self) -> OpenChargeMapQuery {
        OpenChargeMapQuery {
            country_code: self.country_code.clone(),
            max_results: self.max_results,
            api_key: self.api_key.clone(),
        }
    }
}

/// Run-level failure. Per-record problems never surface here; they are in
/// [`IngestSummary::issues`].
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetching snapshots from {source_id}: {source}")]
    Transport {
        source_id: &'static str,
        source: SourceError,
    },
    #[error("{source_id} returned no station snapshots")]
    NoData { source_id: &'static str },
    #[error("opening history store: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub source_id: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: IngestCounts,
}

#[derive(Debug)]
pub struct IngestSummary {
    pub run: RunRecord,
    pub issues: Vec<IngestIssue>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    source: Box<dyn SnapshotSource>,
    ingestor: SnapshotIngestor,
    running: Mutex<()>,
}

impl IngestPipeline {
    /// Pipeline polling OpenChargeMap with the configured query.
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = OpenChargeMapSource::new(http, config.open_charge_map_query());
        Ok(Self::with_source(config, Box::new(source)))
    }

    pub fn with_source(config: IngestConfig, source: Box<dyn SnapshotSource>) -> Self {
        Self {
            config,
            source,
            ingestor: SnapshotIngestor::new(),
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Run one poll cycle, waiting for any cycle already in progress.
    pub async fn run_once(&self) -> Result<IngestSummary, IngestError> {
        let _running = self.running.lock().await;
        self.run_cycle().await
    }

    /// Scheduler entry point: a tick that lands while a cycle is running is skipped.
    pub async fn run_scheduled_tick(&self) {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous poll cycle still running; skipping scheduled tick");
            return;
        };
        match self.run_cycle().await {
            Ok(summary) => {
                if !summary.issues.is_empty() {
                    warn!(
                        run_id = %summary.run.run_id,
                        issues = summary.issues.len(),
                        "scheduled poll cycle completed with issues"
                    );
                }
            }
            Err(err) => error!(error = %err, "scheduled poll cycle failed"),
        }
    }

    async fn run_cycle(&self) -> Result<IngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.source_id());
        self.run_cycle_inner(run_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: Uuid) -> Result<IngestSummary, IngestError> {
        let started_at = Utc::now();
        let source_id = self.source.source_id();

        let records = self
            .source
            .fetch_snapshots()
            .await
            .map_err(|source| IngestError::Transport { source_id, source })?;
        if records.is_empty() {
            return Err(IngestError::NoData { source_id });
        }

        let store = Store::connect(&self.config.database_url)
            .await
            .map_err(IngestError::Store)?;
        let result = match store.bootstrap().await {
            Ok(()) => self.ingestor.ingest(&store, &records).await.map_err(IngestError::from),
            Err(err) => Err(IngestError::Store(err)),
        };
        store.close().await;
        let report = result?;

        let run = RunRecord {
            run_id,
            source_id,
            started_at,
            finished_at: Utc::now(),
            counts: report.counts,
        };
        info!(
            records = run.counts.records_seen,
            ingested = run.counts.records_ingested,
            skipped = run.counts.records_skipped,
            failed = run.counts.records_failed,
            status_events = run.counts.status_events_written,
            comments_inserted = run.counts.comments_inserted,
            "poll cycle committed"
        );
        Ok(IngestSummary {
            run,
            issues: report.issues,
        })
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(self.config.poll_cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                pipeline.run_scheduled_tick().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.poll_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Initialise the store at the configured location without polling.
pub async fn bootstrap_store(config: &IngestConfig) -> Result<()> {
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let result = store.bootstrap().await.context("bootstrapping schema");
    store.close().await;
    result
}

/// Everything recorded for one station.
#[derive(Debug, Clone, Serialize)]
pub struct StationReport {
    pub facility: Facility,
    pub status_history: Vec<StatusEvent>,
    pub comments: Vec<CommentEvent>,
}

/// Read a station's projection and history. Never creates a database; `None` when
/// the station has not been ingested.
pub async fn station_report(
    config: &IngestConfig,
    station_id: StationId,
) -> Result<Option<StationReport>> {
    let store = Store::connect_existing(&config.database_url)
        .await
        .with_context(|| {
            format!(
                "no history database at {}; run `chargelog init-db` or `chargelog ingest` first",
                config.database_url
            )
        })?;
    let result = load_station_report(&store, station_id).await;
    store.close().await;
    result
}

async fn load_station_report(store: &Store, station_id: StationId) -> Result<Option<StationReport>> {
    store.bootstrap().await.context("bootstrapping schema")?;
    let Some(facility) = store.facility(station_id).await? else {
        return Ok(None);
    };
    Ok(Some(StationReport {
        facility,
        status_history: store.status_history(station_id).await?,
        comments: store.comment_events(station_id).await?,
    }))
}
