use crate::aggregation::AggregationEngine;
use crate::audit::AuditSink;
use crate::config::ReferenceData;
use crate::db::Database;
use crate::directory::Directory;
use crate::errors::AppResult;
use crate::kpi::{ExecutiveKpis, KpiSnapshot};
use crate::models::{
    AggregateSnapshot, CoverageSettings, NewRecordPayload, Period, RecordFilters, RecordStatus, Role,
    RoleDashboard, Scope, ScopeKpiView, ServiceRecord, User,
};
use crate::policy::{Action, PolicyEngine, ScopeRef};
use crate::store::RecordStore;
use crate::workflow::RecordWorkflow;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

const DATABASE_FILE: &str = "coverage.sqlite";

/// Entry point for callers. Every operation takes the acting user's id and
/// runs the synchronous core on the blocking pool.
#[derive(Clone)]
pub struct CoverageService {
    db: Arc<Database>,
    records: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    workflow: RecordWorkflow,
    policy: PolicyEngine,
}

impl CoverageService {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditSink>) -> Self {
        let records: Arc<dyn RecordStore> = db.clone();
        let directory: Arc<dyn Directory> = db.clone();
        let workflow = RecordWorkflow::new(records.clone(), directory.clone(), audit);
        Self {
            db,
            records,
            directory,
            workflow,
            policy: PolicyEngine::new(),
        }
    }

    pub fn open(data_dir: &Path, audit: Arc<dyn AuditSink>) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        tracing::info!(path = %db.path().display(), "coverage store opened");
        Ok(Self::new(db, audit))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub async fn import_reference_data(&self, data: ReferenceData) -> AppResult<()> {
        self.blocking(move |service| service.db.import_reference_data(&data)).await
    }

    pub async fn get_settings(&self) -> AppResult<CoverageSettings> {
        self.blocking(|service| service.db.get_settings()).await
    }

    pub async fn update_settings(&self, update: serde_json::Value) -> AppResult<CoverageSettings> {
        self.blocking(move |service| service.db.update_settings(update)).await
    }

    pub async fn register_record(&self, actor_id: &str, payload: NewRecordPayload) -> AppResult<ServiceRecord> {
        let actor_id = actor_id.to_string();
        self.blocking(move |service| service.workflow.register(&actor_id, &payload))
            .await
    }

    pub async fn get_record(&self, actor_id: &str, record_id: &str) -> AppResult<ServiceRecord> {
        let actor_id = actor_id.to_string();
        let record_id = record_id.to_string();
        self.blocking(move |service| service.workflow.get_record_as(&actor_id, &record_id))
            .await
    }

    pub async fn list_pending(&self, actor_id: &str, scope: Scope, limit: u32) -> AppResult<Vec<ServiceRecord>> {
        let actor_id = actor_id.to_string();
        self.blocking(move |service| service.pending_in_scope(&actor_id, &scope, limit))
            .await
    }

    pub async fn approve(&self, record_id: &str, actor_id: &str, note: Option<String>) -> AppResult<ServiceRecord> {
        let record_id = record_id.to_string();
        let actor_id = actor_id.to_string();
        self.blocking(move |service| service.workflow.approve(&record_id, &actor_id, note.as_deref()))
            .await
    }

    pub async fn reject(&self, record_id: &str, actor_id: &str, motive: &str) -> AppResult<()> {
        let record_id = record_id.to_string();
        let actor_id = actor_id.to_string();
        let motive = motive.to_string();
        self.blocking(move |service| service.workflow.reject(&record_id, &actor_id, &motive))
            .await
    }

    pub async fn delete_record(&self, record_id: &str, actor_id: &str, motive: Option<String>) -> AppResult<()> {
        let record_id = record_id.to_string();
        let actor_id = actor_id.to_string();
        self.blocking(move |service| {
            service
                .workflow
                .delete_record(&record_id, &actor_id, motive.as_deref())
        })
        .await
    }

    pub async fn get_aggregate(&self, actor_id: &str, scope: Scope, period: Period) -> AppResult<AggregateSnapshot> {
        let actor_id = actor_id.to_string();
        self.blocking(move |service| {
            period.validate()?;
            let actor = service.directory.require_user(&actor_id)?;
            service.authorize_scope(&actor, &scope)?;
            service.engine()?.aggregate(&scope, &period)
        })
        .await
    }

    /// Snapshots of every direct child of `scope`.
    pub async fn get_breakdown(
        &self,
        actor_id: &str,
        scope: Scope,
        period: Period,
    ) -> AppResult<Vec<AggregateSnapshot>> {
        let actor_id = actor_id.to_string();
        self.blocking(move |service| {
            period.validate()?;
            let actor = service.directory.require_user(&actor_id)?;
            service.authorize_scope(&actor, &scope)?;
            service.engine()?.breakdown(&scope, &period)
        })
        .await
    }

    pub async fn get_executive_kpis(&self, actor_id: &str, scope: Scope, year: i32) -> AppResult<ExecutiveKpis> {
        let actor_id = actor_id.to_string();
        self.blocking(move |service| {
            let period = Period::year(year)?;
            let actor = service.directory.require_user(&actor_id)?;
            service.authorize_scope(&actor, &scope)?;
            service.executive_kpis(&service.engine()?, &scope, &period)
        })
        .await
    }

    pub async fn role_dashboard(&self, actor_id: &str, year: i32) -> AppResult<RoleDashboard> {
        let actor_id = actor_id.to_string();
        self.blocking(move |service| service.dashboard_for(&actor_id, year))
            .await
    }

    async fn blocking<T, F>(&self, task: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(CoverageService) -> AppResult<T> + Send + 'static,
    {
        let service = self.clone();
        tokio::task::spawn_blocking(move || task(service)).await?
    }

    fn engine(&self) -> AppResult<AggregationEngine> {
        let settings = self.db.get_settings()?;
        Ok(AggregationEngine::new(self.records.clone(), self.directory.clone())
            .with_precision(settings.display_precision))
    }

    /// Existence is checked before permission so unknown scopes report
    /// `NotFound` for every role.
    fn authorize_scope(&self, actor: &User, scope: &Scope) -> AppResult<()> {
        match scope {
            Scope::Municipality => self
                .policy
                .authorize(actor, &Action::ViewAggregate(ScopeRef::Municipality)),
            Scope::Territory(id) => {
                let territory = self.directory.require_territory(id)?;
                self.policy.authorize(
                    actor,
                    &Action::ViewAggregate(ScopeRef::Territory {
                        id: &territory.id,
                        community_ids: &territory.community_ids,
                    }),
                )
            }
            Scope::Community(id) => {
                let community = self.directory.require_community(id)?;
                self.policy
                    .authorize(actor, &Action::ViewAggregate(ScopeRef::Community { id: &community.id }))
            }
        }
    }

    fn pending_in_scope(&self, actor_id: &str, scope: &Scope, limit: u32) -> AppResult<Vec<ServiceRecord>> {
        let actor = self.directory.require_user(actor_id)?;
        let communities = self.directory.communities_in(scope)?;
        let mut filters = RecordFilters {
            status: Some(RecordStatus::Registered),
            ..RecordFilters::default()
        };

        let community_ids: Vec<String> = match actor.role {
            Role::FieldWorker => {
                filters.registered_by = Some(actor.id.clone());
                communities.into_iter().map(|community| community.id).collect()
            }
            Role::TechnicalAssistant => {
                self.authorize_scope(&actor, scope)?;
                communities
                    .into_iter()
                    .filter(|community| actor.is_assigned_to(&community.id))
                    .map(|community| community.id)
                    .collect()
            }
            Role::DistrictManager | Role::MunicipalCoordinator => {
                self.authorize_scope(&actor, scope)?;
                communities.into_iter().map(|community| community.id).collect()
            }
        };

        let settings = self.db.get_settings()?;
        filters.community_ids = Some(community_ids);
        filters.limit = Some(settings.effective_limit(limit));

        let pending = self.records.list_records(&filters)?;
        tracing::debug!(actor_id = %actor.id, scope = %scope, count = pending.len(), "pending records listed");
        Ok(pending)
    }

    fn executive_kpis(&self, engine: &AggregationEngine, scope: &Scope, period: &Period) -> AppResult<ExecutiveKpis> {
        let snapshot = engine.aggregate(scope, period)?;
        let communities = self.directory.communities_in(scope)?;
        let territory_count = communities
            .iter()
            .map(|community| community.territory_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let active_assistant_count = self
            .directory
            .users_with_role(Role::TechnicalAssistant)?
            .iter()
            .filter(|assistant| {
                communities
                    .iter()
                    .any(|community| assistant.is_assigned_to(&community.id))
            })
            .count();
        let kpis = ExecutiveKpis::derive(&snapshot, territory_count, active_assistant_count);
        tracing::debug!(
            scope = %scope,
            year = period.year,
            tier = kpis.tier.as_str(),
            goal_tier = kpis.goal_tier.as_str(),
            "executive kpis derived"
        );
        Ok(kpis)
    }

    fn dashboard_for(&self, actor_id: &str, year: i32) -> AppResult<RoleDashboard> {
        let period = Period::year(year)?;
        let actor = self.directory.require_user(actor_id)?;

        match actor.role {
            Role::FieldWorker => {
                let own = RecordFilters {
                    registered_by: Some(actor.id.clone()),
                    period: Some(period),
                    ..RecordFilters::default()
                };
                let records = self.records.list_records(&own)?;
                let (validated, pending): (Vec<_>, Vec<_>) = records
                    .iter()
                    .partition(|record| record.status == RecordStatus::Validated);
                let validated_quantity = validated
                    .iter()
                    .fold(0u64, |acc, record| acc.saturating_add(record.quantity));
                Ok(RoleDashboard::FieldWorker {
                    user_id: actor.id,
                    year,
                    pending_records: pending.len(),
                    validated_records: validated.len(),
                    validated_quantity,
                })
            }
            Role::TechnicalAssistant => {
                let assigned: Vec<String> = actor.community_ids.iter().cloned().collect();
                let pending = self.records.list_records(&RecordFilters {
                    status: Some(RecordStatus::Registered),
                    community_ids: Some(assigned.clone()),
                    ..RecordFilters::default()
                })?;
                let engine = self.engine()?;
                let scopes: Vec<Scope> = assigned.into_iter().map(Scope::Community).collect();
                let communities = engine
                    .aggregate_many(&scopes, &period)?
                    .into_iter()
                    .map(scope_view)
                    .collect();
                Ok(RoleDashboard::TechnicalAssistant {
                    user_id: actor.id,
                    year,
                    pending_records: pending.len(),
                    communities,
                })
            }
            Role::DistrictManager | Role::MunicipalCoordinator => {
                self.authorize_scope(&actor, &Scope::Municipality)?;
                let engine = self.engine()?;
                let kpis = self.executive_kpis(&engine, &Scope::Municipality, &period)?;
                let territories = engine
                    .breakdown(&Scope::Municipality, &period)?
                    .into_iter()
                    .map(scope_view)
                    .collect();
                Ok(RoleDashboard::Executive {
                    user_id: actor.id,
                    year,
                    kpis,
                    territories,
                })
            }
        }
    }
}

fn scope_view(snapshot: AggregateSnapshot) -> ScopeKpiView {
    ScopeKpiView {
        kpis: KpiSnapshot::from_aggregate(&snapshot),
        snapshot,
    }
}
