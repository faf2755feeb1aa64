use crate::errors::{AppError, AppResult};
use crate::kpi::{ExecutiveKpis, KpiSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const MIN_PERIOD_YEAR: i32 = 1900;
const MAX_PERIOD_YEAR: i32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    FieldWorker,
    TechnicalAssistant,
    DistrictManager,
    MunicipalCoordinator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FieldWorker => "field_worker",
            Self::TechnicalAssistant => "technical_assistant",
            Self::DistrictManager => "district_manager",
            Self::MunicipalCoordinator => "municipal_coordinator",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "field_worker" => Ok(Self::FieldWorker),
            "technical_assistant" => Ok(Self::TechnicalAssistant),
            "district_manager" => Ok(Self::DistrictManager),
            "municipal_coordinator" => Ok(Self::MunicipalCoordinator),
            other => Err(AppError::validation("role", format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub community_ids: BTreeSet<String>,
}

impl User {
    pub fn is_assigned_to(&self, community_id: &str) -> bool {
        self.community_ids.contains(community_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    pub id: String,
    pub code: String,
    pub name: String,
    pub territory_id: String,
    pub baseline_population: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Territory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub community_ids: BTreeSet<String>,
}

/// Stored lifecycle state. Deletion is not a stored state: a rejected record
/// leaves the store after its audit event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Registered,
    Validated,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Validated => "validated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: String,
    pub community_id: String,
    pub registered_by: String,
    pub method: String,
    pub quantity: u64,
    pub event_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
    pub validator_id: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecordPayload {
    pub community_id: String,
    pub method: String,
    pub quantity: i64,
    pub event_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

impl NewRecordPayload {
    /// Returns the normalized method and the quantity as an unsigned count.
    pub fn validate(&self) -> AppResult<(String, u64)> {
        if self.community_id.trim().is_empty() {
            return Err(AppError::validation("communityId", "community id cannot be empty"));
        }
        let method = self.method.trim().to_lowercase();
        if method.is_empty() {
            return Err(AppError::validation("method", "method category cannot be empty"));
        }
        let quantity = u64::try_from(self.quantity).map_err(|_| {
            AppError::validation(
                "quantity",
                format!("administered quantity {} cannot be negative", self.quantity),
            )
        })?;
        Ok((method, quantity))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub year: i32,
    pub month: Option<u32>,
}

impl Period {
    pub fn new(year: i32, month: Option<u32>) -> AppResult<Self> {
        let period = Self { year, month };
        period.validate()?;
        Ok(period)
    }

    pub fn year(year: i32) -> AppResult<Self> {
        Self::new(year, None)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(MIN_PERIOD_YEAR..=MAX_PERIOD_YEAR).contains(&self.year) {
            return Err(AppError::validation(
                "period.year",
                format!(
                    "year {} is out of allowed range ({}..={})",
                    self.year, MIN_PERIOD_YEAR, MAX_PERIOD_YEAR
                ),
            ));
        }
        if let Some(month) = self.month {
            if !(1..=12).contains(&month) {
                return Err(AppError::validation(
                    "period.month",
                    format!("month {} is out of allowed range (1..=12)", month),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Municipality,
    Territory(String),
    Community(String),
}

impl Scope {
    pub fn parse(kind: &str, id: Option<&str>) -> AppResult<Self> {
        let id = id.map(str::trim).filter(|value| !value.is_empty());
        match (kind.trim(), id) {
            ("municipality", _) => Ok(Self::Municipality),
            ("territory", Some(id)) => Ok(Self::Territory(id.to_string())),
            ("community", Some(id)) => Ok(Self::Community(id.to_string())),
            ("territory" | "community", None) => Err(AppError::validation(
                "scope.id",
                format!("scope '{}' requires an id", kind.trim()),
            )),
            (other, _) => Err(AppError::validation("scope.kind", format!("unknown scope '{}'", other))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Municipality => "municipality",
            Self::Territory(_) => "territory",
            Self::Community(_) => "community",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Municipality => None,
            Self::Territory(id) | Self::Community(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{}", self.kind(), id),
            None => write!(f, "{}", self.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilters {
    pub status: Option<RecordStatus>,
    pub community_ids: Option<Vec<String>>,
    pub registered_by: Option<String>,
    pub period: Option<Period>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Rejected,
    Purged,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Purged => "purged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub action: AuditAction,
    pub record: ServiceRecord,
    pub actor_id: String,
    pub motive: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub scope: Scope,
    pub period: Period,
    pub total_quantity: u64,
    pub by_method: BTreeMap<String, u64>,
    pub community_count: usize,
    pub contributing_communities: usize,
    pub contributing_territories: usize,
    pub target_population: u64,
    pub coverage_pct: f64,
    pub annual_goal: Option<u64>,
    pub goal_progress_pct: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKpiView {
    pub snapshot: AggregateSnapshot,
    pub kpis: KpiSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleDashboard {
    FieldWorker {
        user_id: String,
        year: i32,
        pending_records: usize,
        validated_records: usize,
        validated_quantity: u64,
    },
    TechnicalAssistant {
        user_id: String,
        year: i32,
        pending_records: usize,
        communities: Vec<ScopeKpiView>,
    },
    Executive {
        user_id: String,
        year: i32,
        kpis: ExecutiveKpis,
        territories: Vec<ScopeKpiView>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CoverageSettings {
    pub municipality_name: String,
    pub display_precision: u32,
    pub default_pending_limit: u32,
    pub max_pending_limit: u32,
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            municipality_name: "Municipality".to_string(),
            display_precision: 1,
            default_pending_limit: 50,
            max_pending_limit: 500,
        }
    }
}

impl CoverageSettings {
    pub fn effective_limit(&self, requested: u32) -> u32 {
        if requested == 0 {
            return self.default_pending_limit.min(self.max_pending_limit);
        }
        requested.min(self.max_pending_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::{NewRecordPayload, Period, Role, Scope};
    use crate::errors::AppError;
    use chrono::Utc;

    #[test]
    fn rejects_negative_quantity_and_blank_method() {
        let mut payload = NewRecordPayload {
            community_id: "c1".to_string(),
            method: "  Implant ".to_string(),
            quantity: 3,
            event_at: Utc::now(),
            note: None,
        };
        let (method, quantity) = payload.validate().expect("valid payload");
        assert_eq!(method, "implant");
        assert_eq!(quantity, 3);

        payload.quantity = -1;
        match payload.validate() {
            Err(AppError::Validation { field, .. }) => assert_eq!(field, "quantity"),
            other => panic!("expected validation error, got {:?}", other),
        }

        payload.quantity = 1;
        payload.method = "   ".to_string();
        assert!(matches!(payload.validate(), Err(AppError::Validation { .. })));
    }

    #[test]
    fn period_rejects_out_of_range_year_and_month() {
        assert!(Period::new(2025, Some(3)).is_ok());
        assert!(Period::new(2025, Some(0)).is_err());
        assert!(Period::new(2025, Some(13)).is_err());
        assert!(Period::new(12, None).is_err());
    }

    #[test]
    fn parses_scope_and_role_strings() {
        assert_eq!(Scope::parse("municipality", None).expect("scope"), Scope::Municipality);
        assert_eq!(
            Scope::parse("territory", Some(" t1 ")).expect("scope"),
            Scope::Territory("t1".to_string())
        );
        assert!(Scope::parse("community", Some("  ")).is_err());
        assert!(Scope::parse("region", Some("r1")).is_err());

        assert_eq!(Role::parse("technical_assistant").expect("role"), Role::TechnicalAssistant);
        assert!(Role::parse("auxiliar_enfermeria").is_err());
    }
}
