use crate::models::{AggregateSnapshot, Scope};
use serde::{Deserialize, Serialize};

pub const EXCELLENT_THRESHOLD: f64 = 85.0;
pub const GOOD_THRESHOLD: f64 = 70.0;
pub const FAIR_THRESHOLD: f64 = 55.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Excellent,
    Good,
    Fair,
    Critical,
}

impl Tier {
    /// Buckets a percentage. Values above 100 are legal; NaN and negatives
    /// land in `Critical`.
    pub fn classify(pct: f64) -> Self {
        if pct >= EXCELLENT_THRESHOLD {
            Self::Excellent
        } else if pct >= GOOD_THRESHOLD {
            Self::Good
        } else if pct >= FAIR_THRESHOLD {
            Self::Fair
        } else {
            Self::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Critical => "critical",
        }
    }
}

/// Width of a progress bar in percent of its track.
pub fn bar_width(pct: f64) -> f64 {
    if pct.is_nan() {
        return 0.0;
    }
    pct.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiSnapshot {
    pub coverage_pct: f64,
    pub coverage_tier: Tier,
    pub coverage_bar_width: f64,
    pub goal_progress_pct: f64,
    pub goal_tier: Tier,
    pub goal_bar_width: f64,
}

impl KpiSnapshot {
    pub fn from_aggregate(snapshot: &AggregateSnapshot) -> Self {
        Self {
            coverage_pct: snapshot.coverage_pct,
            coverage_tier: Tier::classify(snapshot.coverage_pct),
            coverage_bar_width: bar_width(snapshot.coverage_pct),
            goal_progress_pct: snapshot.goal_progress_pct,
            goal_tier: Tier::classify(snapshot.goal_progress_pct),
            goal_bar_width: bar_width(snapshot.goal_progress_pct),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutiveKpis {
    pub scope: Scope,
    pub year: i32,
    pub total_quantity: u64,
    pub coverage: f64,
    pub goal_progress: f64,
    pub tier: Tier,
    pub goal_tier: Tier,
    pub coverage_bar_width: f64,
    pub goal_bar_width: f64,
    pub territory_count: usize,
    pub active_assistant_count: usize,
}

impl ExecutiveKpis {
    pub fn derive(snapshot: &AggregateSnapshot, territory_count: usize, active_assistant_count: usize) -> Self {
        let kpis = KpiSnapshot::from_aggregate(snapshot);
        Self {
            scope: snapshot.scope.clone(),
            year: snapshot.period.year,
            total_quantity: snapshot.total_quantity,
            coverage: kpis.coverage_pct,
            goal_progress: kpis.goal_progress_pct,
            tier: kpis.coverage_tier,
            goal_tier: kpis.goal_tier,
            coverage_bar_width: kpis.coverage_bar_width,
            goal_bar_width: kpis.goal_bar_width,
            territory_count,
            active_assistant_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bar_width, ExecutiveKpis, KpiSnapshot, Tier};
    use crate::models::{AggregateSnapshot, Period, Scope};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot(coverage_pct: f64, goal_progress_pct: f64) -> AggregateSnapshot {
        AggregateSnapshot {
            scope: Scope::Municipality,
            period: Period::year(2025).expect("period"),
            total_quantity: 42,
            by_method: BTreeMap::new(),
            community_count: 3,
            contributing_communities: 2,
            contributing_territories: 1,
            target_population: 100,
            coverage_pct,
            annual_goal: Some(50),
            goal_progress_pct,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn classifies_on_threshold_boundaries() {
        assert_eq!(Tier::classify(85.0), Tier::Excellent);
        assert_eq!(Tier::classify(84.9), Tier::Good);
        assert_eq!(Tier::classify(70.0), Tier::Good);
        assert_eq!(Tier::classify(69.99), Tier::Fair);
        assert_eq!(Tier::classify(55.0), Tier::Fair);
        assert_eq!(Tier::classify(54.9), Tier::Critical);
        assert_eq!(Tier::classify(0.0), Tier::Critical);
        assert_eq!(Tier::classify(240.0), Tier::Excellent);
        assert_eq!(Tier::classify(f64::NAN), Tier::Critical);
        assert_eq!(Tier::Fair.as_str(), "fair");
        assert_eq!(serde_json::to_value(Tier::Excellent).expect("tier json"), "excellent");
    }

    #[test]
    fn clamps_only_the_bar_width() {
        let kpis = KpiSnapshot::from_aggregate(&snapshot(132.5, 40.0));
        assert_eq!(kpis.coverage_pct, 132.5);
        assert_eq!(kpis.coverage_bar_width, 100.0);
        assert_eq!(kpis.coverage_tier, Tier::Excellent);
        assert_eq!(kpis.goal_tier, Tier::Critical);
        assert_eq!(bar_width(-3.0), 0.0);
        assert_eq!(bar_width(f64::NAN), 0.0);
    }

    #[test]
    fn executive_kpis_carry_counts_and_tiers() {
        let kpis = ExecutiveKpis::derive(&snapshot(72.0, 90.0), 4, 6);
        assert_eq!(kpis.tier, Tier::Good);
        assert_eq!(kpis.goal_tier, Tier::Excellent);
        assert_eq!(kpis.territory_count, 4);
        assert_eq!(kpis.active_assistant_count, 6);
        assert_eq!(kpis.year, 2025);
        assert_eq!(kpis.total_quantity, 42);
    }
}
