use crate::audit::AuditSink;
use crate::directory::Directory;
use crate::errors::{AppError, AppResult};
use crate::models::{AuditAction, AuditEvent, NewRecordPayload, RecordStatus, ServiceRecord, User};
use crate::policy::{Action, PolicyEngine};
use crate::store::{CheckAndSet, RecordStore};
use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub const ADMINISTRATIVE_DELETE_MOTIVE: &str = "administrative delete";

#[derive(Debug, Clone, Copy)]
enum Transition {
    Validate,
    Remove,
}

impl Transition {
    fn action(self, community_id: &str) -> Action<'_> {
        match self {
            Self::Validate => Action::ValidateRecord { community_id },
            Self::Remove => Action::DeleteRecord { community_id },
        }
    }
}

/// Status transitions for a single record.
///
/// Checks run in a fixed order: existence, permission, input, status. The
/// status precondition is re-checked by the store in the same step that
/// writes, so of two racing transitions only one is applied.
#[derive(Clone)]
pub struct RecordWorkflow {
    records: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditSink>,
    policy: PolicyEngine,
}

impl RecordWorkflow {
    pub fn new(records: Arc<dyn RecordStore>, directory: Arc<dyn Directory>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            records,
            directory,
            audit,
            policy: PolicyEngine::new(),
        }
    }

    pub fn register(&self, actor_id: &str, payload: &NewRecordPayload) -> AppResult<ServiceRecord> {
        let actor = self.directory.require_user(actor_id)?;
        let community = self.directory.require_community(payload.community_id.trim())?;
        self.policy.authorize(
            &actor,
            &Action::CreateRecord {
                community_id: &community.id,
            },
        )?;
        let (method, quantity) = payload.validate()?;

        let record = ServiceRecord {
            id: Uuid::new_v4().to_string(),
            community_id: community.id,
            registered_by: actor.id.clone(),
            method,
            quantity,
            event_at: payload.event_at.trunc_subsecs(6),
            created_at: Utc::now().trunc_subsecs(6),
            status: RecordStatus::Registered,
            validator_id: None,
            validated_at: None,
            note: normalize_text(payload.note.as_deref()),
        };
        self.records.insert_record(&record)?;

        tracing::info!(
            record_id = %record.id,
            community_id = %record.community_id,
            actor_id = %actor.id,
            quantity = record.quantity,
            "record registered"
        );
        Ok(record)
    }

    pub fn get_record(&self, record_id: &str) -> AppResult<ServiceRecord> {
        self.records
            .get_record(record_id)?
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", record_id)))
    }

    pub fn get_record_as(&self, actor_id: &str, record_id: &str) -> AppResult<ServiceRecord> {
        let actor = self.directory.require_user(actor_id)?;
        let record = self.get_record(record_id)?;
        self.policy.authorize(&actor, &Action::view(&record))?;
        Ok(record)
    }

    pub fn approve(&self, record_id: &str, actor_id: &str, note: Option<&str>) -> AppResult<ServiceRecord> {
        let actor = self.directory.require_user(actor_id)?;
        let record = self.locate(&actor, record_id, Transition::Validate)?;
        ensure_registered(&record)?;

        let note = normalize_text(note);
        let outcome = self.records.validate_if_registered(
            &record.id,
            &actor.id,
            Utc::now().trunc_subsecs(6),
            note.as_deref(),
        )?;

        match outcome {
            CheckAndSet::Applied(validated) => {
                tracing::info!(record_id = %validated.id, actor_id = %actor.id, "record validated");
                Ok(validated)
            }
            CheckAndSet::NotRegistered(status) => Err(conflict(record_id, status)),
            CheckAndSet::Missing => Err(removed_conflict(record_id)),
        }
    }

    pub fn reject(&self, record_id: &str, actor_id: &str, motive: &str) -> AppResult<()> {
        self.remove(record_id, actor_id, motive, AuditAction::Rejected)
    }

    /// Administrative hard delete. Same permission and audit contract as
    /// `reject`.
    pub fn delete_record(&self, record_id: &str, actor_id: &str, motive: Option<&str>) -> AppResult<()> {
        let motive = normalize_text(motive).unwrap_or_else(|| ADMINISTRATIVE_DELETE_MOTIVE.to_string());
        self.remove(record_id, actor_id, &motive, AuditAction::Purged)
    }

    fn remove(&self, record_id: &str, actor_id: &str, motive: &str, action: AuditAction) -> AppResult<()> {
        let actor = self.directory.require_user(actor_id)?;
        let record = self.locate(&actor, record_id, Transition::Remove)?;

        let motive = motive.trim();
        if motive.is_empty() {
            return Err(AppError::validation("motive", "a motive is required to reject a record"));
        }
        ensure_registered(&record)?;

        let outcome = self.records.remove_if_registered(&record.id, &|current| {
            self.audit.emit(&AuditEvent {
                id: Uuid::new_v4().to_string(),
                action,
                record: current.clone(),
                actor_id: actor.id.clone(),
                motive: motive.to_string(),
                occurred_at: Utc::now(),
            })
        })?;

        match outcome {
            CheckAndSet::Applied(removed) => {
                tracing::info!(
                    record_id = %removed.id,
                    actor_id = %actor.id,
                    action = action.as_str(),
                    "record removed"
                );
                Ok(())
            }
            CheckAndSet::NotRegistered(status) => Err(conflict(record_id, status)),
            CheckAndSet::Missing => Err(removed_conflict(record_id)),
        }
    }

    /// Resolves the record and checks the actor may transition it. Records
    /// that were already removed still go through the gate before reporting
    /// a conflict.
    fn locate(&self, actor: &User, record_id: &str, transition: Transition) -> AppResult<ServiceRecord> {
        if let Some(record) = self.records.get_record(record_id)? {
            self.policy.authorize(actor, &transition.action(&record.community_id))?;
            return Ok(record);
        }

        match self.records.retired_record_community(record_id)? {
            Some(community_id) => {
                self.policy.authorize(actor, &transition.action(&community_id))?;
                tracing::warn!(record_id = %record_id, actor_id = %actor.id, "transition on removed record");
                Err(removed_conflict(record_id))
            }
            None => Err(AppError::NotFound(format!("Record {} not found", record_id))),
        }
    }
}

fn ensure_registered(record: &ServiceRecord) -> AppResult<()> {
    if record.status == RecordStatus::Registered {
        return Ok(());
    }
    Err(conflict(&record.id, record.status))
}

fn conflict(record_id: &str, status: RecordStatus) -> AppError {
    tracing::warn!(record_id = %record_id, status = status.as_str(), "transition rejected by status");
    AppError::Conflict(format!(
        "Record {} is already {}; no further transitions are allowed",
        record_id,
        status.as_str()
    ))
}

fn removed_conflict(record_id: &str) -> AppError {
    AppError::Conflict(format!("Record {} has already been removed", record_id))
}

fn normalize_text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
