use crate::config::ReferenceData;
use crate::directory::Directory;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Community, CoverageSettings, Period, RecordFilters, RecordStatus, Role, Scope, ServiceRecord, Territory, User,
};
use crate::store::{CheckAndSet, MethodTotal, RecordStore};
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const RECORD_COLUMNS: &str =
    "id, community_id, registered_by, method, quantity, event_at, created_at, status, validator_id, validated_at, note";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_settings(&self) -> AppResult<CoverageSettings> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'coverage'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => serde_json::from_str::<CoverageSettings>(&raw)
                .map_err(|err| AppError::Config(format!("stored coverage settings are unreadable: {}", err))),
            None => Ok(CoverageSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<CoverageSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: CoverageSettings = serde_json::from_value(merged)
            .map_err(|err| AppError::validation("settings", err.to_string()))?;
        if settings.max_pending_limit == 0 {
            return Err(AppError::validation("settings.maxPendingLimit", "must be greater than zero"));
        }

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('coverage', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, format_time(&Utc::now())],
        )?;

        Ok(settings)
    }

    pub fn import_reference_data(&self, data: &ReferenceData) -> AppResult<()> {
        data.validate()?;

        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        for territory in &data.territories {
            tx.execute(
                "INSERT INTO territories (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![territory.id, territory.name],
            )?;
        }

        for community in &data.communities {
            let baseline = i64::try_from(community.baseline_population).map_err(|_| {
                AppError::Config(format!("Baseline population of {} is out of range", community.id))
            })?;
            tx.execute(
                "INSERT INTO communities (id, code, name, territory_id, baseline_population)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   code = excluded.code,
                   name = excluded.name,
                   territory_id = excluded.territory_id,
                   baseline_population = excluded.baseline_population",
                params![community.id, community.code, community.name, community.territory, baseline],
            )?;
        }

        for user in &data.users {
            tx.execute(
                "INSERT INTO users (id, name, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, role = excluded.role",
                params![user.id, user.name, user.role.as_str()],
            )?;
            tx.execute("DELETE FROM user_assignments WHERE user_id = ?1", [&user.id])?;
            for community_id in &user.communities {
                tx.execute(
                    "INSERT OR IGNORE INTO user_assignments (user_id, community_id) VALUES (?1, ?2)",
                    params![user.id, community_id],
                )?;
            }
        }

        for goal in &data.goals {
            let scope = goal.scope()?;
            let value = i64::try_from(goal.goal)
                .map_err(|_| AppError::Config(format!("Goal for {} is out of range", scope)))?;
            upsert_goal(&tx, &scope, goal.year, value)?;
        }

        tx.commit()?;

        tracing::info!(
            territories = data.territories.len(),
            communities = data.communities.len(),
            users = data.users.len(),
            goals = data.goals.len(),
            "reference data imported"
        );
        Ok(())
    }

    pub fn set_annual_goal(&self, scope: &Scope, year: i32, goal: u64) -> AppResult<()> {
        Period::year(year)?;
        let value = i64::try_from(goal).map_err(|_| AppError::validation("goal", "goal is out of range"))?;
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        upsert_goal(&conn, scope, year, value)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = 'coverage'",
            [],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('coverage', ?1, ?2)",
                params![
                    serde_json::to_string(&CoverageSettings::default())?,
                    format_time(&Utc::now())
                ],
            )?;
        }
        Ok(())
    }
}

impl Directory for Database {
    fn user(&self, user_id: &str) -> AppResult<Option<User>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let row = conn
            .query_row(
                "SELECT id, name, role FROM users WHERE id = ?1",
                [user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        parse_role(&row.get::<_, String>(2)?)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, role)) = row else {
            return Ok(None);
        };
        let community_ids = load_assignments(&conn, &id)?;
        Ok(Some(User {
            id,
            name,
            role,
            community_ids,
        }))
    }

    fn community(&self, community_id: &str) -> AppResult<Option<Community>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT id, code, name, territory_id, baseline_population FROM communities WHERE id = ?1",
            [community_id],
            parse_community_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn territory(&self, territory_id: &str) -> AppResult<Option<Territory>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let row = conn
            .query_row(
                "SELECT id, name FROM territories WHERE id = ?1",
                [territory_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((id, name)) = row else {
            return Ok(None);
        };
        let mut stmt = conn.prepare("SELECT id FROM communities WHERE territory_id = ?1 ORDER BY id ASC")?;
        let community_ids = stmt
            .query_map([&id], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Some(Territory {
            id,
            name,
            community_ids,
        }))
    }

    fn communities(&self) -> AppResult<Vec<Community>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, code, name, territory_id, baseline_population FROM communities ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], parse_community_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn territories(&self) -> AppResult<Vec<Territory>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;

        let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut member_stmt = conn.prepare("SELECT territory_id, id FROM communities")?;
        let mut rows = member_stmt.query([])?;
        while let Some(row) = rows.next()? {
            members
                .entry(row.get::<_, String>(0)?)
                .or_default()
                .insert(row.get::<_, String>(1)?);
        }

        let mut stmt = conn.prepare("SELECT id, name FROM territories ORDER BY id ASC")?;
        let territories = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(territories
            .into_iter()
            .map(|(id, name)| Territory {
                community_ids: members.remove(&id).unwrap_or_default(),
                id,
                name,
            })
            .collect())
    }

    fn users_with_role(&self, role: Role) -> AppResult<Vec<User>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare("SELECT id, name FROM users WHERE role = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map([role.as_str()], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut users = Vec::with_capacity(rows.len());
        for (id, name) in rows {
            let community_ids = load_assignments(&conn, &id)?;
            users.push(User {
                id,
                name,
                role,
                community_ids,
            });
        }
        Ok(users)
    }

    fn annual_goal(&self, scope: &Scope, year: i32) -> AppResult<Option<u64>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let goal: Option<i64> = conn
            .query_row(
                "SELECT goal FROM annual_goals WHERE scope_kind = ?1 AND scope_id = ?2 AND year = ?3",
                params![scope.kind(), scope.id().unwrap_or_default(), year],
                |row| row.get(0),
            )
            .optional()?;
        Ok(goal.and_then(|value| u64::try_from(value).ok()))
    }
}

impl RecordStore for Database {
    fn insert_record(&self, record: &ServiceRecord) -> AppResult<()> {
        let quantity = i64::try_from(record.quantity)
            .map_err(|_| AppError::validation("quantity", "administered quantity is out of range"))?;
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO service_records (
               id, community_id, registered_by, method, quantity, event_at, event_year, event_month,
               created_at, status, validator_id, validated_at, note
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id,
                record.community_id,
                record.registered_by,
                record.method,
                quantity,
                format_time(&record.event_at),
                record.event_at.year(),
                record.event_at.month(),
                format_time(&record.created_at),
                record.status.as_str(),
                record.validator_id,
                record.validated_at.as_ref().map(format_time),
                record.note,
            ],
        )?;
        Ok(())
    }

    fn get_record(&self, record_id: &str) -> AppResult<Option<ServiceRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        query_record(&conn, record_id)
    }

    fn list_records(&self, filters: &RecordFilters) -> AppResult<Vec<ServiceRecord>> {
        let mut query = format!("SELECT {} FROM service_records WHERE 1 = 1", RECORD_COLUMNS);
        let mut params_vec: Vec<Value> = Vec::new();

        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(community_ids) = &filters.community_ids {
            if community_ids.is_empty() {
                return Ok(Vec::new());
            }
            query.push_str(&format!(" AND community_id IN ({})", placeholders(community_ids.len())));
            params_vec.extend(community_ids.iter().map(|id| Value::Text(id.clone())));
        }
        if let Some(registered_by) = &filters.registered_by {
            query.push_str(" AND registered_by = ?");
            params_vec.push(Value::Text(registered_by.clone()));
        }
        if let Some(period) = &filters.period {
            query.push_str(" AND event_year = ?");
            params_vec.push(Value::Integer(i64::from(period.year)));
            if let Some(month) = period.month {
                query.push_str(" AND event_month = ?");
                params_vec.push(Value::Integer(i64::from(month)));
            }
        }

        query.push_str(" ORDER BY event_at DESC, created_at DESC, id ASC");

        if let Some(limit) = filters.limit {
            query.push_str(" LIMIT ?");
            params_vec.push(Value::Integer(i64::from(limit)));
        }

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec), parse_record_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn validate_if_registered(
        &self,
        record_id: &str,
        validator_id: &str,
        validated_at: DateTime<Utc>,
        note: Option<&str>,
    ) -> AppResult<CheckAndSet> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE service_records
             SET status = 'validated', validator_id = ?1, validated_at = ?2, note = COALESCE(?3, note)
             WHERE id = ?4 AND status = 'registered'",
            params![validator_id, format_time(&validated_at), note, record_id],
        )?;

        let current = query_record(&conn, record_id)?;
        Ok(match (changed, current) {
            (1, Some(record)) => CheckAndSet::Applied(record),
            (_, Some(record)) => CheckAndSet::NotRegistered(record.status),
            (_, None) => CheckAndSet::Missing,
        })
    }

    fn remove_if_registered(
        &self,
        record_id: &str,
        before_remove: &dyn Fn(&ServiceRecord) -> AppResult<()>,
    ) -> AppResult<CheckAndSet> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        let Some(record) = query_record(&tx, record_id)? else {
            return Ok(CheckAndSet::Missing);
        };
        if record.status != RecordStatus::Registered {
            return Ok(CheckAndSet::NotRegistered(record.status));
        }

        before_remove(&record)?;

        let deleted = tx.execute(
            "DELETE FROM service_records WHERE id = ?1 AND status = 'registered'",
            [record_id],
        )?;
        if deleted != 1 {
            return Err(AppError::Internal(format!(
                "Record {} changed while being removed",
                record_id
            )));
        }
        tx.execute(
            "INSERT OR REPLACE INTO retired_records (id, community_id, retired_at) VALUES (?1, ?2, ?3)",
            params![record.id, record.community_id, format_time(&Utc::now())],
        )?;
        tx.commit()?;

        Ok(CheckAndSet::Applied(record))
    }

    fn retired_record_community(&self, record_id: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT community_id FROM retired_records WHERE id = ?1",
            [record_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    fn validated_totals(&self, community_ids: &[String], period: &Period) -> AppResult<Vec<MethodTotal>> {
        if community_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = String::from(
            "SELECT community_id, method, quantity FROM service_records
             WHERE status = 'validated' AND event_year = ?",
        );
        let mut params_vec: Vec<Value> = vec![Value::Integer(i64::from(period.year))];
        if let Some(month) = period.month {
            query.push_str(" AND event_month = ?");
            params_vec.push(Value::Integer(i64::from(month)));
        }
        query.push_str(&format!(" AND community_id IN ({})", placeholders(community_ids.len())));
        params_vec.extend(community_ids.iter().map(|id| Value::Text(id.clone())));
        query.push_str(" ORDER BY community_id ASC, method ASC");

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                to_unsigned(2, row.get::<_, i64>(2)?)?,
            ))
        })?;

        // Summed here rather than with SUM(), which raises on i64 overflow.
        let mut sums: BTreeMap<(String, String), u64> = BTreeMap::new();
        for row in rows {
            let (community_id, method, quantity) = row?;
            let sum = sums.entry((community_id, method)).or_insert(0);
            *sum = sum.saturating_add(quantity);
        }
        Ok(sums
            .into_iter()
            .map(|((community_id, method), quantity)| MethodTotal {
                community_id,
                method,
                quantity,
            })
            .collect())
    }
}

fn query_record(conn: &Connection, record_id: &str) -> AppResult<Option<ServiceRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM service_records WHERE id = ?1", RECORD_COLUMNS),
        [record_id],
        parse_record_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn load_assignments(conn: &Connection, user_id: &str) -> AppResult<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT community_id FROM user_assignments WHERE user_id = ?1")?;
    let ids = stmt
        .query_map([user_id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

fn upsert_goal(conn: &Connection, scope: &Scope, year: i32, goal: i64) -> AppResult<()> {
    conn.execute(
        "INSERT INTO annual_goals (scope_kind, scope_id, year, goal) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(scope_kind, scope_id, year) DO UPDATE SET goal = excluded.goal",
        params![scope.kind(), scope.id().unwrap_or_default(), year, goal],
    )?;
    Ok(())
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceRecord> {
    Ok(ServiceRecord {
        id: row.get(0)?,
        community_id: row.get(1)?,
        registered_by: row.get(2)?,
        method: row.get(3)?,
        quantity: to_unsigned(4, row.get::<_, i64>(4)?)?,
        event_at: parse_time(&row.get::<_, String>(5)?)?,
        created_at: parse_time(&row.get::<_, String>(6)?)?,
        status: parse_status(&row.get::<_, String>(7)?)?,
        validator_id: row.get(8)?,
        validated_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        note: row.get(10)?,
    })
}

fn parse_community_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Community> {
    Ok(Community {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        territory_id: row.get(3)?,
        baseline_population: to_unsigned(4, row.get::<_, i64>(4)?)?,
    })
}

fn to_unsigned(column: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Integer, Box::new(error))
    })
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    Role::parse(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
        )
    })
}

fn parse_status(raw: &str) -> rusqlite::Result<RecordStatus> {
    match raw {
        "registered" => Ok(RecordStatus::Registered),
        "validated" => Ok(RecordStatus::Validated),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown record status '{}'", other),
            )),
        )),
    }
}

fn format_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::config::ReferenceData;
    use crate::directory::Directory;
    use crate::errors::AppError;
    use crate::models::{Period, RecordFilters, RecordStatus, Role, Scope, ServiceRecord};
    use crate::store::{CheckAndSet, RecordStore};
    use chrono::{TimeZone, Utc};

    const REFERENCE: &str = r#"
territories:
  - id: t1
    name: North
  - id: t2
    name: South
communities:
  - id: c1
    code: C-001
    name: Alpha
    territory: t1
    baselinePopulation: 100
  - id: c2
    code: C-002
    name: Beta
    territory: t1
    baselinePopulation: 50
  - id: c3
    code: C-003
    name: Gamma
    territory: t2
    baselinePopulation: 0
users:
  - id: fw1
    name: Worker
    role: field_worker
    communities: [c1]
  - id: ta1
    name: Assistant
    role: technical_assistant
    communities: [c1, c2]
goals:
  - scope: territory
    id: t1
    year: 2025
    goal: 300
"#;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        let data = ReferenceData::from_yaml_str(REFERENCE).expect("reference data");
        db.import_reference_data(&data).expect("import reference data");
        (dir, db)
    }

    fn record(id: &str, community: &str, quantity: u64, month: u32, status: RecordStatus) -> ServiceRecord {
        let event_at = Utc
            .with_ymd_and_hms(2025, month, 10, 8, 0, 0)
            .single()
            .expect("timestamp");
        ServiceRecord {
            id: id.to_string(),
            community_id: community.to_string(),
            registered_by: "fw1".to_string(),
            method: "injectable".to_string(),
            quantity,
            event_at,
            created_at: event_at,
            status,
            validator_id: None,
            validated_at: None,
            note: None,
        }
    }

    #[test]
    fn directory_lookups_follow_imported_reference_data() {
        let (_dir, db) = open();

        let assistant = db.require_user("ta1").expect("assistant");
        assert_eq!(assistant.role, Role::TechnicalAssistant);
        assert!(assistant.is_assigned_to("c2"));

        let north = db.require_territory("t1").expect("territory");
        assert_eq!(north.community_ids.len(), 2);
        assert_eq!(db.territories().expect("territories").len(), 2);
        assert_eq!(db.users_with_role(Role::FieldWorker).expect("workers").len(), 1);

        let in_scope = db
            .communities_in(&Scope::Territory("t1".to_string()))
            .expect("communities in territory");
        assert_eq!(in_scope.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c1", "c2"]);

        assert_eq!(
            db.annual_goal(&Scope::Territory("t1".to_string()), 2025).expect("goal"),
            Some(300)
        );
        assert_eq!(db.annual_goal(&Scope::Municipality, 2025).expect("goal"), None);
        assert!(matches!(db.require_community("c9"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn conditional_validation_applies_once() {
        let (_dir, db) = open();
        db.insert_record(&record("r1", "c1", 5, 3, RecordStatus::Registered))
            .expect("insert record");

        let first = db
            .validate_if_registered("r1", "ta1", Utc::now(), Some("checked"))
            .expect("first validation");
        match first {
            CheckAndSet::Applied(record) => {
                assert_eq!(record.status, RecordStatus::Validated);
                assert_eq!(record.validator_id.as_deref(), Some("ta1"));
                assert_eq!(record.note.as_deref(), Some("checked"));
            }
            other => panic!("expected applied, got {:?}", other),
        }

        let second = db
            .validate_if_registered("r1", "ta1", Utc::now(), None)
            .expect("second validation");
        assert_eq!(second, CheckAndSet::NotRegistered(RecordStatus::Validated));

        let missing = db
            .validate_if_registered("nope", "ta1", Utc::now(), None)
            .expect("missing validation");
        assert_eq!(missing, CheckAndSet::Missing);
    }

    #[test]
    fn failed_pre_removal_hook_keeps_record() {
        let (_dir, db) = open();
        db.insert_record(&record("r1", "c1", 5, 3, RecordStatus::Registered))
            .expect("insert record");

        let result = db.remove_if_registered("r1", &|_| Err(AppError::Io("sink offline".to_string())));
        assert!(matches!(result, Err(AppError::Io(_))));
        assert!(db.get_record("r1").expect("get record").is_some());
        assert!(db.retired_record_community("r1").expect("retired").is_none());

        let removed = db.remove_if_registered("r1", &|_| Ok(())).expect("remove");
        assert!(matches!(removed, CheckAndSet::Applied(_)));
        assert!(db.get_record("r1").expect("get record").is_none());
        assert_eq!(
            db.retired_record_community("r1").expect("retired").as_deref(),
            Some("c1")
        );
    }

    #[test]
    fn validated_totals_respect_status_and_period() {
        let (_dir, db) = open();
        db.insert_record(&record("r1", "c1", 5, 3, RecordStatus::Validated)).expect("r1");
        db.insert_record(&record("r2", "c1", 7, 4, RecordStatus::Validated)).expect("r2");
        db.insert_record(&record("r3", "c1", 11, 4, RecordStatus::Registered)).expect("r3");
        db.insert_record(&record("r4", "c2", 2, 4, RecordStatus::Validated)).expect("r4");

        let ids = vec!["c1".to_string(), "c2".to_string()];
        let year = db
            .validated_totals(&ids, &Period::year(2025).expect("period"))
            .expect("year totals");
        let c1: u64 = year.iter().filter(|t| t.community_id == "c1").map(|t| t.quantity).sum();
        assert_eq!(c1, 12);

        let april = db
            .validated_totals(&ids, &Period::new(2025, Some(4)).expect("period"))
            .expect("april totals");
        assert_eq!(april.iter().map(|t| t.quantity).sum::<u64>(), 9);

        let pending = db
            .list_records(&RecordFilters {
                status: Some(RecordStatus::Registered),
                ..RecordFilters::default()
            })
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "r3");
    }

    #[test]
    fn settings_updates_merge_partial_documents() {
        let (_dir, db) = open();
        let updated = db
            .update_settings(serde_json::json!({ "displayPrecision": 2 }))
            .expect("update settings");
        assert_eq!(updated.display_precision, 2);
        assert_eq!(updated.max_pending_limit, 500);
        assert_eq!(db.get_settings().expect("settings").display_precision, 2);

        let rejected = db.update_settings(serde_json::json!({ "maxPendingLimit": 0 }));
        assert!(matches!(rejected, Err(AppError::Validation { .. })));
    }

    #[test]
    fn unreadable_settings_row_is_a_config_error() {
        let (_dir, db) = open();
        {
            let conn = db.conn.lock().expect("conn");
            conn.execute(
                "UPDATE settings SET value_json = ?1 WHERE key = 'coverage'",
                [r#"{"displayPrecision": "oops""#],
            )
            .expect("corrupt settings");
        }

        assert!(matches!(db.get_settings(), Err(AppError::Config(_))));
        let update = db.update_settings(serde_json::json!({ "displayPrecision": 2 }));
        assert!(matches!(update, Err(AppError::Config(_))));
    }

    #[test]
    fn validated_totals_saturate_instead_of_overflowing() {
        let (_dir, db) = open();
        let half = (i64::MAX / 2 + 1) as u64;
        db.insert_record(&record("big1", "c1", half, 3, RecordStatus::Validated)).expect("big1");
        db.insert_record(&record("big2", "c1", half, 4, RecordStatus::Validated)).expect("big2");
        db.insert_record(&record("big3", "c1", half, 5, RecordStatus::Validated)).expect("big3");

        let totals = db
            .validated_totals(&["c1".to_string()], &Period::year(2025).expect("period"))
            .expect("totals");
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].quantity, half.saturating_mul(3));
    }

    #[test]
    fn annual_goal_can_be_set_and_replaced() {
        let (_dir, db) = open();
        let scope = Scope::Community("c2".to_string());
        assert_eq!(db.annual_goal(&scope, 2026).expect("goal"), None);

        db.set_annual_goal(&scope, 2026, 40).expect("set goal");
        assert_eq!(db.annual_goal(&scope, 2026).expect("goal"), Some(40));

        db.set_annual_goal(&scope, 2026, 55).expect("replace goal");
        assert_eq!(db.annual_goal(&scope, 2026).expect("goal"), Some(55));
        assert_eq!(db.annual_goal(&scope, 2025).expect("other year"), None);

        assert!(matches!(
            db.set_annual_goal(&scope, 10_000, 1),
            Err(AppError::Validation { .. })
        ));
        assert!(matches!(
            db.set_annual_goal(&Scope::Municipality, 2026, u64::MAX),
            Err(AppError::Validation { .. })
        ));
    }
}
