use chargelog_core::Facility;
use chargelog_storage::{Batch, StoreError};
use chrono::{DateTime, Utc};

/// Keeps `stations` as a projection of what the provider says right now.
///
/// Every attribute is overwritten on each sighting, including with `NULL` when the
/// provider stopped sending it. No earlier value survives.
#[derive(Debug, Default, Clone, Copy)]
pub struct StationUpserter;

impl StationUpserter {
    pub async fn upsert(
        &self,
        batch: &mut Batch<'_>,
        facility: &Facility,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        batch.upsert_facility(facility, seen_at).await
    }
}
