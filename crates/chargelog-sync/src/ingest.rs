use chargelog_core::{
    comment_records, derive_status_tuple, extract_comment, extract_facility, station_id,
    ExtractedComment, StationId, StationIdLookup,
};
use chargelog_storage::{Batch, Store, StoreError};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::comments::{CommentDeduplicator, CommentError, CommentOutcome};
use crate::detect::{StatusChange, StatusChangeDetector};
use crate::upsert::StationUpserter;

/// A record that could not be applied. Everything it wrote was rolled back.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record #{index} has an unusable station id {value}")]
    UnusableId { index: usize, value: JsonValue },
    #[error("station {station_id}: {source}")]
    Store {
        station_id: StationId,
        #[source]
        source: StoreError,
    },
}

/// Something worth reporting that did not stop the batch.
#[derive(Debug, Error)]
pub enum IngestIssue {
    #[error("record #{index} has no station id; skipped")]
    MissingStationId { index: usize },
    #[error("comment #{index} of station {station_id} has no external id; skipped")]
    MissingCommentId { station_id: StationId, index: usize },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Comment(#[from] CommentError),
}

/// Per-record result handed back to the orchestrator.
#[derive(Debug)]
pub enum RecordOutcome {
    Ingested(RecordReport),
    SkippedMissingId { index: usize },
    Failed(RecordError),
}

#[derive(Debug)]
pub struct RecordReport {
    pub station_id: StationId,
    pub status: StatusChange,
    pub comments: Vec<CommentOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub records_seen: usize,
    pub records_ingested: usize,
    pub records_skipped: usize,
    pub records_failed: usize,
    pub status_events_written: usize,
    pub status_unchanged: usize,
    pub comments_inserted: usize,
    pub comments_already_recorded: usize,
    pub comments_skipped: usize,
    pub comments_failed: usize,
}

/// Aggregate of one batch: counters plus every reported issue.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub counts: IngestCounts,
    pub issues: Vec<IngestIssue>,
}

impl BatchReport {
    fn absorb(&mut self, outcome: RecordOutcome) {
        self.counts.records_seen += 1;
        match outcome {
            RecordOutcome::SkippedMissingId { index } => {
                self.counts.records_skipped += 1;
                self.issues.push(IngestIssue::MissingStationId { index });
            }
            RecordOutcome::Failed(err) => {
                self.counts.records_failed += 1;
                self.issues.push(err.into());
            }
            RecordOutcome::Ingested(report) => {
                self.counts.records_ingested += 1;
                if report.status.wrote_event() {
                    self.counts.status_events_written += 1;
                } else {
                    self.counts.status_unchanged += 1;
                }
                for comment in report.comments {
                    match comment {
                        CommentOutcome::Inserted { .. } => self.counts.comments_inserted += 1,
                        CommentOutcome::AlreadyRecorded { .. } => {
                            self.counts.comments_already_recorded += 1;
                        }
                        CommentOutcome::MissingId { index } => {
                            self.counts.comments_skipped += 1;
                            self.issues.push(IngestIssue::MissingCommentId {
                                station_id: report.station_id,
                                index,
                            });
                        }
                        CommentOutcome::Failed(err) => {
                            self.counts.comments_failed += 1;
                            self.issues.push(err.into());
                        }
                    }
                }
            }
        }
    }
}

/// Failure that ends the batch. Nothing from it is persisted.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("starting poll transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("committing poll cycle, all changes rolled back: {0}")]
    Commit(#[source] StoreError),
}

/// Drives one poll cycle's records through upsert, change detection and comment dedup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotIngestor {
    upserter: StationUpserter,
    detector: StatusChangeDetector,
    deduplicator: CommentDeduplicator,
}

impl SnapshotIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `records` inside one transaction and commit it.
    ///
    /// Each record runs inside its own savepoint, so a failing record leaves no
    /// partial rows and the rest of the batch carries on.
    pub async fn ingest(&self, store: &Store, records: &[JsonValue]) -> Result<BatchReport, BatchError> {
        let mut batch = store.begin().await.map_err(BatchError::Begin)?;
        let mut report = BatchReport::default();
        for (index, record) in records.iter().enumerate() {
            let outcome = self.ingest_record(&mut batch, index, record).await;
            report.absorb(outcome);
        }
        batch.commit().await.map_err(BatchError::Commit)?;
        Ok(report)
    }

    pub async fn ingest_record(
        &self,
        batch: &mut Batch<'_>,
        index: usize,
        record: &JsonValue,
    ) -> RecordOutcome {
        let station_id = match station_id(record) {
            StationIdLookup::Found(id) => id,
            StationIdLookup::Missing => {
                warn!(index, "snapshot record has no station id; skipped");
                return RecordOutcome::SkippedMissingId { index };
            }
            StationIdLookup::Unusable(value) => {
                let err = RecordError::UnusableId { index, value };
                warn!(index, error = %err, "snapshot record not ingested");
                return RecordOutcome::Failed(err);
            }
        };

        match self.apply(batch, station_id, record).await {
            Ok(report) => {
                debug!(station_id, status = ?report.status, "station ingested");
                RecordOutcome::Ingested(report)
            }
            Err(source) => {
                let err = RecordError::Store { station_id, source };
                warn!(station_id, error = %err, "snapshot record not ingested");
                RecordOutcome::Failed(err)
            }
        }
    }

    async fn apply(
        &self,
        batch: &mut Batch<'_>,
        station_id: StationId,
        record: &JsonValue,
    ) -> Result<RecordReport, StoreError> {
        let observed_at = Utc::now();
        let facility = extract_facility(station_id, record);
        let comments: Vec<Option<ExtractedComment>> =
            comment_records(record).iter().map(extract_comment).collect();
        let tuple = derive_status_tuple(record, comments.iter().flatten());

        let mut scope = batch.savepoint().await?;
        self.upserter.upsert(&mut scope, &facility, observed_at).await?;
        let status = self
            .detector
            .observe(&mut scope, station_id, &tuple, record, observed_at)
            .await?;
        let comments = self
            .deduplicator
            .record_all(&mut scope, station_id, &comments, observed_at)
            .await;
        scope.commit().await?;

        Ok(RecordReport {
            station_id,
            status,
            comments,
        })
    }
}
