use chargelog_core::{ExtractedComment, StationId};
use chargelog_storage::{Batch, NewCommentEvent, StoreError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommentError {
    #[error("comment #{index} of station {station_id} is not an object")]
    NotAnObject { station_id: StationId, index: usize },
    #[error("storing comment {comment_id} of station {station_id}: {source}")]
    Store {
        station_id: StationId,
        comment_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug)]
pub enum CommentOutcome {
    Inserted { comment_id: String, event_id: i64 },
    AlreadyRecorded { comment_id: String },
    /// No external id, so there is no safe dedup key. Skipped.
    MissingId { index: usize },
    Failed(CommentError),
}

/// Mirrors each externally authored comment exactly once per `(station_id, comment_id)`.
///
/// First write wins: a stored comment is never updated, even when the provider
/// later delivers edited text under the same id.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommentDeduplicator;

impl CommentDeduplicator {
    /// Record every comment of one station. `None` entries are sub-records that were
    /// not objects. One comment failing does not stop the others.
    pub async fn record_all(
        &self,
        batch: &mut Batch<'_>,
        station_id: StationId,
        comments: &[Option<ExtractedComment>],
        recorded_at: DateTime<Utc>,
    ) -> Vec<CommentOutcome> {
        let mut outcomes = Vec::with_capacity(comments.len());
        for (index, comment) in comments.iter().enumerate() {
            let outcome = match comment {
                None => CommentOutcome::Failed(CommentError::NotAnObject { station_id, index }),
                Some(comment) => match comment.comment_id.as_deref() {
                    None => CommentOutcome::MissingId { index },
                    Some(comment_id) => {
                        self.record_one(batch, station_id, comment_id, comment, recorded_at)
                            .await
                            .unwrap_or_else(|source| {
                                CommentOutcome::Failed(CommentError::Store {
                                    station_id,
                                    comment_id: comment_id.to_string(),
                                    source,
                                })
                            })
                    }
                },
            };

            match &outcome {
                CommentOutcome::MissingId { index } => {
                    warn!(station_id, index, "comment has no external id; skipped");
                }
                CommentOutcome::Failed(err) => {
                    warn!(station_id, error = %err, "comment not recorded");
                }
                CommentOutcome::Inserted { comment_id, .. } => {
                    debug!(station_id, comment_id = %comment_id, "comment recorded");
                }
                CommentOutcome::AlreadyRecorded { .. } => {}
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn record_one(
        &self,
        batch: &mut Batch<'_>,
        station_id: StationId,
        comment_id: &str,
        comment: &ExtractedComment,
        recorded_at: DateTime<Utc>,
    ) -> Result<CommentOutcome, StoreError> {
        let mut scope = batch.savepoint().await?;
        if scope.comment_exists(station_id, comment_id).await? {
            scope.commit().await?;
            return Ok(CommentOutcome::AlreadyRecorded {
                comment_id: comment_id.to_string(),
            });
        }

        let event_id = scope
            .insert_comment_event(&NewCommentEvent {
                station_id,
                comment_id,
                comment_type_title: comment.comment_type_title.as_deref(),
                checkin_status_title: comment.checkin_status_title.as_deref(),
                comment_text: comment.comment_text.as_deref(),
                comment_date: comment.comment_date.as_deref(),
                recorded_at,
                raw_json: &comment.raw,
            })
            .await?;
        scope.commit().await?;
        Ok(CommentOutcome::Inserted {
            comment_id: comment_id.to_string(),
            event_id,
        })
    }
}
