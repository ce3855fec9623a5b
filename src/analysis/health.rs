//! Health scoring.
//!
//! A score is `base + bonuses - penalties`, clamped to `0..=cap` (and never
//! above 100). Popularity metrics are weighted logarithmically so that a
//! handful of very popular entries do not flatten everyone else. The weights
//! are heuristics; every number lives in a [`HealthProfile`] that can be
//! overridden from configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized inputs for scoring. Adapters fill what their source exposes
/// and leave the rest at the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSignals {
    pub stars: i64,
    pub forks: i64,

    /// Downloads for registries, pulls for container images
    pub downloads: i64,
    pub open_issues: i64,

    pub has_readme: bool,
    pub has_description: bool,
    pub has_license: bool,
    pub has_linked_repository: bool,
    pub has_tests: bool,

    /// Whole days since the last push, release or image update
    pub days_since_activity: Option<i64>,

    pub capability_count: usize,

    pub uses_https: bool,
    pub handshake_ok: bool,
    pub has_server_info: bool,
}

impl HealthSignals {
    /// Sets [`days_since_activity`](Self::days_since_activity) relative to `now`.
    pub fn with_activity(mut self, at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        self.days_since_activity = at.map(|at| (now - at).num_days().max(0));
        self
    }
}

/// `min(max, multiplier * log10(1 + value))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogWeight {
    pub multiplier: f64,
    pub max: f64,
}

impl LogWeight {
    pub const ZERO: LogWeight = LogWeight {
        multiplier: 0.0,
        max: 0.0,
    };

    pub fn new(multiplier: f64, max: f64) -> Self {
        Self { multiplier, max }
    }

    pub fn apply(&self, value: i64) -> f64 {
        if value <= 0 {
            return 0.0;
        }
        (self.multiplier * (1.0 + value as f64).log10()).min(self.max)
    }
}

/// Points awarded when the last activity is at most `max_days` old.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecencyTier {
    pub max_days: i64,
    pub points: f64,
}

/// Weights for one source type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProfile {
    pub base: f64,
    pub cap: f64,

    pub stars: LogWeight,
    pub forks: LogWeight,
    pub downloads: LogWeight,
    pub open_issue_penalty: LogWeight,

    pub readme: f64,
    pub description: f64,
    pub license: f64,
    pub linked_repository: f64,
    pub tests: f64,

    /// Checked in order; the first tier that matches wins
    pub recency: Vec<RecencyTier>,

    pub per_capability: f64,
    pub capability_max: f64,

    pub https: f64,
    pub handshake: f64,
    pub server_info: f64,
}

fn tiers(table: &[(i64, f64)]) -> Vec<RecencyTier> {
    table
        .iter()
        .map(|&(max_days, points)| RecencyTier { max_days, points })
        .collect()
}

impl Default for HealthProfile {
    fn default() -> Self {
        Self {
            base: 0.0,
            cap: 100.0,
            stars: LogWeight::ZERO,
            forks: LogWeight::ZERO,
            downloads: LogWeight::ZERO,
            open_issue_penalty: LogWeight::ZERO,
            readme: 0.0,
            description: 0.0,
            license: 0.0,
            linked_repository: 0.0,
            tests: 0.0,
            recency: Vec::new(),
            per_capability: 0.0,
            capability_max: 0.0,
            https: 0.0,
            handshake: 0.0,
            server_info: 0.0,
        }
    }
}

impl HealthProfile {
    pub fn source_control() -> Self {
        Self {
            base: 20.0,
            stars: LogWeight::new(10.0, 30.0),
            forks: LogWeight::new(5.0, 10.0),
            open_issue_penalty: LogWeight::new(3.0, 10.0),
            readme: 10.0,
            license: 10.0,
            tests: 5.0,
            recency: tiers(&[(7, 20.0), (30, 15.0), (90, 8.0), (365, 3.0)]),
            per_capability: 2.0,
            capability_max: 10.0,
            ..Self::default()
        }
    }

    pub fn registry() -> Self {
        Self {
            base: 20.0,
            downloads: LogWeight::new(8.0, 30.0),
            readme: 10.0,
            license: 10.0,
            linked_repository: 15.0,
            recency: tiers(&[(7, 20.0), (30, 15.0), (90, 8.0), (365, 3.0)]),
            ..Self::default()
        }
    }

    /// Container metadata is sparse, so the additive scale is smaller.
    pub fn container() -> Self {
        Self {
            base: 30.0,
            downloads: LogWeight::new(5.0, 25.0),
            stars: LogWeight::new(5.0, 15.0),
            description: 10.0,
            recency: tiers(&[(30, 10.0), (180, 5.0)]),
            ..Self::default()
        }
    }

    pub fn endpoint() -> Self {
        Self {
            base: 20.0,
            https: 20.0,
            handshake: 20.0,
            server_info: 10.0,
            per_capability: 3.0,
            capability_max: 30.0,
            ..Self::default()
        }
    }
}

/// Stateless scorer bound to one [`HealthProfile`].
#[derive(Debug, Clone)]
pub struct HealthScorer {
    profile: HealthProfile,
}

impl HealthScorer {
    pub fn new(profile: HealthProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &HealthProfile {
        &self.profile
    }

    /// Computes the score in `0..=min(cap, 100)`.
    pub fn score(&self, signals: &HealthSignals) -> u8 {
        let p = &self.profile;
        let flag = |set: bool, points: f64| if set { points } else { 0.0 };

        let mut total = p.base;
        total += p.stars.apply(signals.stars);
        total += p.forks.apply(signals.forks);
        total += p.downloads.apply(signals.downloads);
        total += flag(signals.has_readme, p.readme);
        total += flag(signals.has_description, p.description);
        total += flag(signals.has_license, p.license);
        total += flag(signals.has_linked_repository, p.linked_repository);
        total += flag(signals.has_tests, p.tests);
        total += flag(signals.uses_https, p.https);
        total += flag(signals.handshake_ok, p.handshake);
        total += flag(signals.has_server_info, p.server_info);

        if let Some(days) = signals.days_since_activity {
            if let Some(tier) = p.recency.iter().find(|t| days <= t.max_days) {
                total += tier.points;
            }
        }

        total += (signals.capability_count as f64 * p.per_capability).min(p.capability_max);
        total -= p.open_issue_penalty.apply(signals.open_issues);

        let cap = p.cap.clamp(0.0, 100.0);
        total.round().clamp(0.0, cap) as u8
    }
}
