use crate::errors::{AppError, AppResult};
use crate::models::{Role, ServiceRecord, User};
use std::collections::BTreeSet;

/// Scope as seen by the gate. Territory membership is resolved by the caller
/// so that evaluation never touches the directory.
#[derive(Debug, Clone, Copy)]
pub enum ScopeRef<'a> {
    Municipality,
    Territory {
        id: &'a str,
        community_ids: &'a BTreeSet<String>,
    },
    Community {
        id: &'a str,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    CreateRecord { community_id: &'a str },
    ValidateRecord { community_id: &'a str },
    DeleteRecord { community_id: &'a str },
    ViewRecord { community_id: &'a str, registered_by: &'a str },
    ViewAggregate(ScopeRef<'a>),
}

impl<'a> Action<'a> {
    pub fn view(record: &'a ServiceRecord) -> Self {
        Self::ViewRecord {
            community_id: &record.community_id,
            registered_by: &record.registered_by,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::CreateRecord { community_id } => format!("create records in community {}", community_id),
            Self::ValidateRecord { community_id } => format!("validate records in community {}", community_id),
            Self::DeleteRecord { community_id } => format!("delete records in community {}", community_id),
            Self::ViewRecord { community_id, .. } => format!("view records in community {}", community_id),
            Self::ViewAggregate(ScopeRef::Municipality) => "view municipality aggregates".to_string(),
            Self::ViewAggregate(ScopeRef::Territory { id, .. }) => format!("view aggregates of territory {}", id),
            Self::ViewAggregate(ScopeRef::Community { id }) => format!("view aggregates of community {}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn can_act(&self, user: &User, action: &Action<'_>) -> bool {
        match (user.role, action) {
            (Role::FieldWorker, Action::CreateRecord { community_id }) => user.is_assigned_to(community_id),
            (Role::FieldWorker, Action::ValidateRecord { .. } | Action::DeleteRecord { .. }) => false,
            (Role::FieldWorker, Action::ViewRecord { registered_by, .. }) => *registered_by == user.id,
            (Role::FieldWorker, Action::ViewAggregate(_)) => false,

            (Role::TechnicalAssistant, Action::CreateRecord { .. }) => false,
            (
                Role::TechnicalAssistant,
                Action::ValidateRecord { community_id }
                | Action::DeleteRecord { community_id }
                | Action::ViewRecord { community_id, .. },
            ) => user.is_assigned_to(community_id),
            (Role::TechnicalAssistant, Action::ViewAggregate(scope)) => match scope {
                ScopeRef::Municipality => false,
                ScopeRef::Territory { community_ids, .. } => {
                    community_ids.iter().any(|id| user.is_assigned_to(id))
                }
                ScopeRef::Community { id } => user.is_assigned_to(id),
            },

            (Role::DistrictManager, Action::CreateRecord { .. }) => false,
            (
                Role::DistrictManager,
                Action::ValidateRecord { .. }
                | Action::DeleteRecord { .. }
                | Action::ViewRecord { .. }
                | Action::ViewAggregate(_),
            ) => true,

            (
                Role::MunicipalCoordinator,
                Action::CreateRecord { .. } | Action::ValidateRecord { .. } | Action::DeleteRecord { .. },
            ) => false,
            (Role::MunicipalCoordinator, Action::ViewRecord { .. } | Action::ViewAggregate(_)) => true,
        }
    }

    pub fn authorize(&self, user: &User, action: &Action<'_>) -> AppResult<()> {
        if self.can_act(user, action) {
            return Ok(());
        }
        tracing::warn!(
            user_id = %user.id,
            role = user.role.as_str(),
            action = %action.describe(),
            "permission denied"
        );
        Err(AppError::Forbidden(format!(
            "{} '{}' may not {}",
            user.role.as_str(),
            user.id,
            action.describe()
        )))
    }
}
