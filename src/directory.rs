use crate::errors::{AppError, AppResult};
use crate::models::{Community, Role, Scope, Territory, User};

pub trait Directory: Send + Sync {
    fn user(&self, user_id: &str) -> AppResult<Option<User>>;
    fn community(&self, community_id: &str) -> AppResult<Option<Community>>;
    fn territory(&self, territory_id: &str) -> AppResult<Option<Territory>>;
    fn communities(&self) -> AppResult<Vec<Community>>;
    fn territories(&self) -> AppResult<Vec<Territory>>;
    fn users_with_role(&self, role: Role) -> AppResult<Vec<User>>;
    fn annual_goal(&self, scope: &Scope, year: i32) -> AppResult<Option<u64>>;

    fn require_user(&self, user_id: &str) -> AppResult<User> {
        self.user(user_id)?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    fn require_community(&self, community_id: &str) -> AppResult<Community> {
        self.community(community_id)?
            .ok_or_else(|| AppError::NotFound(format!("Community {} not found", community_id)))
    }

    fn require_territory(&self, territory_id: &str) -> AppResult<Territory> {
        self.territory(territory_id)?
            .ok_or_else(|| AppError::NotFound(format!("Territory {} not found", territory_id)))
    }

    /// Communities under `scope`, ordered by id.
    fn communities_in(&self, scope: &Scope) -> AppResult<Vec<Community>> {
        let mut communities = match scope {
            Scope::Municipality => self.communities()?,
            Scope::Territory(id) => {
                let territory = self.require_territory(id)?;
                self.communities()?
                    .into_iter()
                    .filter(|community| territory.community_ids.contains(&community.id))
                    .collect()
            }
            Scope::Community(id) => vec![self.require_community(id)?],
        };
        communities.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(communities)
    }
}
