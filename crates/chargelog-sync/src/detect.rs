use chargelog_core::{StationId, StatusTuple};
use chargelog_storage::{Batch, StoreError};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// What the detector did with one observed status tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// No earlier row existed for the station.
    First { event_id: i64 },
    Changed { event_id: i64, previous_id: i64 },
    /// Identical to the latest row; nothing written.
    Unchanged { latest_id: i64 },
}

impl StatusChange {
    pub fn wrote_event(&self) -> bool {
        !matches!(self, StatusChange::Unchanged { .. })
    }
}

/// A new row is due when there is no previous tuple or any field differs.
pub fn needs_event(previous: Option<&StatusTuple>, observed: &StatusTuple) -> bool {
    previous != Some(observed)
}

/// Appends to `status_history` only when the observed tuple differs from the latest row.
///
/// "Latest" is the highest insertion sequence for the station, never the newest
/// `recorded_at`, so skewed clocks cannot reorder history.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusChangeDetector;

impl StatusChangeDetector {
    pub async fn observe(
        &self,
        batch: &mut Batch<'_>,
        station_id: StationId,
        observed: &StatusTuple,
        raw_record: &JsonValue,
        recorded_at: DateTime<Utc>,
    ) -> Result<StatusChange, StoreError> {
        let latest = batch.latest_status_event(station_id).await?;
        if let Some(latest) = &latest {
            if !needs_event(Some(&latest.tuple), observed) {
                return Ok(StatusChange::Unchanged {
                    latest_id: latest.id,
                });
            }
        }

        let event_id = batch
            .append_status_event(station_id, observed, recorded_at, raw_record)
            .await?;
        Ok(match latest {
            None => StatusChange::First { event_id },
            Some(previous) => StatusChange::Changed {
                event_id,
                previous_id: previous.id,
            },
        })
    }
}
