use crate::audit::AuditSink;
use crate::config::ReferenceData;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{AuditEvent, RecordStatus, ServiceRecord};
use crate::store::RecordStore;
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};

pub const REFERENCE: &str = r#"
territories:
  - id: t1
    name: Rio Norte
  - id: t2
    name: Rio Sur
  - id: t3
    name: Sierra
communities:
  - id: c1
    code: C-001
    name: La Esperanza
    territory: t1
    baselinePopulation: 100
  - id: c2
    code: C-002
    name: San Isidro
    territory: t1
    baselinePopulation: 50
  - id: c3
    code: C-003
    name: El Carmen
    territory: t2
    baselinePopulation: 0
  - id: c4
    code: C-004
    name: Alto Verde
    territory: t3
    baselinePopulation: 80
users:
  - id: fw1
    name: Field Worker One
    role: field_worker
    communities: [c1]
  - id: fw2
    name: Field Worker Two
    role: field_worker
    communities: [c3]
  - id: ta1
    name: Assistant One
    role: technical_assistant
    communities: [c1, c2]
  - id: ta2
    name: Assistant Two
    role: technical_assistant
    communities: [c3]
  - id: dm1
    name: District Manager
    role: district_manager
  - id: mc1
    name: Municipal Coordinator
    role: municipal_coordinator
goals:
  - scope: municipality
    year: 2025
    goal: 1000
  - scope: territory
    id: t1
    year: 2025
    goal: 300
  - scope: community
    id: c1
    year: 2025
    goal: 24
"#;

pub fn open_database() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("coverage.sqlite")).expect("db");
    let data = ReferenceData::from_yaml_str(REFERENCE).expect("reference data");
    db.import_reference_data(&data).expect("import reference data");
    (dir, Arc::new(db))
}

pub fn seed_record(
    db: &Database,
    id: &str,
    community_id: &str,
    quantity: u64,
    (year, month, day): (i32, u32, u32),
    status: RecordStatus,
) -> ServiceRecord {
    let event_at = Utc
        .with_ymd_and_hms(year, month, day, 9, 30, 0)
        .single()
        .expect("timestamp");
    let validated = status == RecordStatus::Validated;
    let record = ServiceRecord {
        id: id.to_string(),
        community_id: community_id.to_string(),
        registered_by: "fw1".to_string(),
        method: "oral".to_string(),
        quantity,
        event_at,
        created_at: event_at,
        status,
        validator_id: validated.then(|| "ta1".to_string()),
        validated_at: validated.then_some(event_at),
        note: None,
    };
    db.insert_record(&record).expect("insert record");
    record
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    fail: bool,
}

impl MemoryAuditSink {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit lock").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) -> AppResult<()> {
        if self.fail {
            return Err(AppError::Io("audit sink unavailable".to_string()));
        }
        self.events.lock().expect("audit lock").push(event.clone());
        Ok(())
    }
}
