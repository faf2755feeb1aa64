use crate::directory::Directory;
use crate::errors::AppResult;
use crate::models::{AggregateSnapshot, Community, Period, Scope};
use crate::store::RecordStore;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const MAX_DISPLAY_PRECISION: u32 = 6;

#[derive(Clone)]
pub struct AggregationEngine {
    records: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    display_precision: u32,
}

impl AggregationEngine {
    pub fn new(records: Arc<dyn RecordStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            records,
            directory,
            display_precision: 1,
        }
    }

    pub fn with_precision(mut self, display_precision: u32) -> Self {
        self.display_precision = display_precision.min(MAX_DISPLAY_PRECISION);
        self
    }

    pub fn aggregate(&self, scope: &Scope, period: &Period) -> AppResult<AggregateSnapshot> {
        period.validate()?;
        let communities = self.directory.communities_in(scope)?;
        self.summarize(scope, period, &communities)
    }

    pub fn aggregate_many(&self, scopes: &[Scope], period: &Period) -> AppResult<Vec<AggregateSnapshot>> {
        scopes.iter().map(|scope| self.aggregate(scope, period)).collect()
    }

    /// One snapshot per direct child of `scope`, including children without
    /// validated records.
    pub fn breakdown(&self, scope: &Scope, period: &Period) -> AppResult<Vec<AggregateSnapshot>> {
        period.validate()?;
        match scope {
            Scope::Municipality => {
                let communities = self.directory.communities()?;
                self.directory
                    .territories()?
                    .into_iter()
                    .map(|territory| {
                        let members: Vec<Community> = communities
                            .iter()
                            .filter(|community| territory.community_ids.contains(&community.id))
                            .cloned()
                            .collect();
                        self.summarize(&Scope::Territory(territory.id), period, &members)
                    })
                    .collect()
            }
            Scope::Territory(_) => self
                .directory
                .communities_in(scope)?
                .into_iter()
                .map(|community| {
                    let child = Scope::Community(community.id.clone());
                    self.summarize(&child, period, std::slice::from_ref(&community))
                })
                .collect(),
            Scope::Community(id) => {
                self.directory.require_community(id)?;
                Ok(Vec::new())
            }
        }
    }

    fn summarize(&self, scope: &Scope, period: &Period, communities: &[Community]) -> AppResult<AggregateSnapshot> {
        let ids: Vec<String> = communities.iter().map(|community| community.id.clone()).collect();
        let totals = self.records.validated_totals(&ids, period)?;

        let mut per_community: BTreeMap<&str, u64> = ids.iter().map(|id| (id.as_str(), 0)).collect();
        let mut by_method: BTreeMap<String, u64> = BTreeMap::new();
        for total in &totals {
            if let Some(sum) = per_community.get_mut(total.community_id.as_str()) {
                *sum = sum.saturating_add(total.quantity);
            }
            let method_sum = by_method.entry(total.method.clone()).or_insert(0);
            *method_sum = method_sum.saturating_add(total.quantity);
        }

        let total_quantity = per_community
            .values()
            .fold(0u64, |acc, value| acc.saturating_add(*value));
        let contributing_communities = per_community.values().filter(|value| **value > 0).count();
        let contributing_territories = communities
            .iter()
            .filter(|community| per_community.get(community.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|community| community.territory_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let target_population = communities
            .iter()
            .fold(0u64, |acc, community| acc.saturating_add(community.baseline_population));

        let annual_goal = self.directory.annual_goal(scope, period.year)?;
        let coverage_pct = percentage(total_quantity, target_population, self.display_precision);
        let goal_progress_pct = annual_goal
            .map(|goal| percentage(total_quantity, goal, self.display_precision))
            .unwrap_or(0.0);

        tracing::debug!(
            scope = %scope,
            year = period.year,
            month = ?period.month,
            total_quantity,
            communities = communities.len(),
            "aggregate computed"
        );

        Ok(AggregateSnapshot {
            scope: scope.clone(),
            period: *period,
            total_quantity,
            by_method,
            community_count: communities.len(),
            contributing_communities,
            contributing_territories,
            target_population,
            coverage_pct,
            annual_goal,
            goal_progress_pct,
            computed_at: Utc::now(),
        })
    }
}

/// `numerator / denominator * 100`, rounded; a zero denominator yields 0.
pub fn percentage(numerator: u64, denominator: u64, precision: u32) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let raw = (numerator as f64 * 100.0) / denominator as f64;
    let factor = 10f64.powi(precision.min(MAX_DISPLAY_PRECISION) as i32);
    (raw * factor).round() / factor
}
