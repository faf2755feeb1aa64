use crate::errors::AppResult;
use crate::models::{Period, RecordFilters, RecordStatus, ServiceRecord};
use chrono::{DateTime, Utc};

/// Result of a conditional transition applied against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckAndSet {
    Applied(ServiceRecord),
    NotRegistered(RecordStatus),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTotal {
    pub community_id: String,
    pub method: String,
    pub quantity: u64,
}

pub trait RecordStore: Send + Sync {
    fn insert_record(&self, record: &ServiceRecord) -> AppResult<()>;

    fn get_record(&self, record_id: &str) -> AppResult<Option<ServiceRecord>>;

    /// Matching records, most recent event first.
    fn list_records(&self, filters: &RecordFilters) -> AppResult<Vec<ServiceRecord>>;

    /// Moves a record from `registered` to `validated` in one step. Nothing is
    /// written unless the record is still `registered`.
    fn validate_if_registered(
        &self,
        record_id: &str,
        validator_id: &str,
        validated_at: DateTime<Utc>,
        note: Option<&str>,
    ) -> AppResult<CheckAndSet>;

    /// Removes a `registered` record. `before_remove` runs inside the same
    /// atomic step; an error from it leaves the record in place.
    fn remove_if_registered(
        &self,
        record_id: &str,
        before_remove: &dyn Fn(&ServiceRecord) -> AppResult<()>,
    ) -> AppResult<CheckAndSet>;

    /// Community of a record that has already been removed, if any.
    fn retired_record_community(&self, record_id: &str) -> AppResult<Option<String>>;

    fn validated_totals(&self, community_ids: &[String], period: &Period) -> AppResult<Vec<MethodTotal>>;
}
