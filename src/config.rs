use crate::errors::{AppError, AppResult};
use crate::models::{Role, Scope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceData {
    #[serde(default)]
    pub territories: Vec<TerritorySeed>,
    #[serde(default)]
    pub communities: Vec<CommunitySeed>,
    #[serde(default)]
    pub users: Vec<UserSeed>,
    #[serde(default)]
    pub goals: Vec<GoalSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerritorySeed {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunitySeed {
    pub id: String,
    pub code: String,
    pub name: String,
    pub territory: String,
    #[serde(default)]
    pub baseline_population: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSeed {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub communities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSeed {
    pub scope: String,
    #[serde(default)]
    pub id: Option<String>,
    pub year: i32,
    pub goal: u64,
}

impl GoalSeed {
    pub fn scope(&self) -> AppResult<Scope> {
        Scope::parse(&self.scope, self.id.as_deref())
    }
}

impl ReferenceData {
    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let data: Self = serde_yaml::from_str(raw)?;
        data.validate()?;
        Ok(data)
    }

    pub fn from_path(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Io(format!("Failed to read {}: {}", path.display(), err)))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> AppResult<()> {
        let territory_ids = unique_ids("territory", self.territories.iter().map(|item| item.id.as_str()))?;
        let community_ids = unique_ids("community", self.communities.iter().map(|item| item.id.as_str()))?;
        unique_ids("community code", self.communities.iter().map(|item| item.code.as_str()))?;
        unique_ids("user", self.users.iter().map(|item| item.id.as_str()))?;

        for community in &self.communities {
            if !territory_ids.contains(community.territory.as_str()) {
                return Err(AppError::Config(format!(
                    "Community {} references unknown territory {}",
                    community.id, community.territory
                )));
            }
        }

        for user in &self.users {
            if let Some(missing) = user
                .communities
                .iter()
                .find(|id| !community_ids.contains(id.as_str()))
            {
                return Err(AppError::Config(format!(
                    "User {} is assigned to unknown community {}",
                    user.id, missing
                )));
            }
        }

        for goal in &self.goals {
            let known = match goal.scope()? {
                Scope::Municipality => true,
                Scope::Territory(id) => territory_ids.contains(id.as_str()),
                Scope::Community(id) => community_ids.contains(id.as_str()),
            };
            if !known {
                return Err(AppError::Config(format!(
                    "Goal for {} {} references an unknown scope",
                    goal.scope,
                    goal.id.as_deref().unwrap_or_default()
                )));
            }
        }

        Ok(())
    }
}

fn unique_ids<'a>(label: &str, ids: impl Iterator<Item = &'a str>) -> AppResult<BTreeSet<&'a str>> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(AppError::Config(format!("{} id cannot be empty", label)));
        }
        if !seen.insert(id) {
            return Err(AppError::Config(format!("Duplicate {} id '{}'", label, id)));
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::ReferenceData;
    use crate::errors::AppError;
    use crate::models::Role;

    const SAMPLE: &str = r#"
territories:
  - id: t1
    name: Rio Norte
communities:
  - id: c1
    code: C-001
    name: La Esperanza
    territory: t1
    baselinePopulation: 100
users:
  - id: fw1
    name: Field One
    role: field_worker
    communities: [c1]
goals:
  - scope: municipality
    year: 2025
    goal: 1200
  - scope: territory
    id: t1
    year: 2025
    goal: 400
"#;

    #[test]
    fn parses_yaml_reference_data() {
        let data = ReferenceData::from_yaml_str(SAMPLE).expect("parse reference data");
        assert_eq!(data.communities[0].baseline_population, 100);
        assert_eq!(data.users[0].role, Role::FieldWorker);
        assert_eq!(data.goals.len(), 2);
    }

    #[test]
    fn rejects_assignment_to_unknown_community() {
        let raw = SAMPLE.replace("communities: [c1]", "communities: [c9]");
        let result = ReferenceData::from_yaml_str(&raw);
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn rejects_unknown_role_string() {
        let raw = SAMPLE.replace("role: field_worker", "role: auxiliar_enfermeria");
        assert!(ReferenceData::from_yaml_str(&raw).is_err());
    }
}
