use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Duration;

use crate::model::Tier;
use crate::RewardError;

pub const DEFAULT_COOLDOWN_SECONDS: i64 = 3_600;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_TRIAL_DAYS: i64 = 30;
const MAX_PAGE_SIZE: usize = 1_000;
const MAX_COOLDOWN_SECONDS: i64 = 30 * 24 * 3_600;
const MAX_TRIAL_DAYS: i64 = 3_650;

/// Billing plan identifiers that map onto paid tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanCatalog {
    pub elite_plan_id: Option<String>,
    pub pro_plan_id: Option<String>,
    pub core_plan_id: Option<String>,
}

impl PlanCatalog {
    /// Exact plan id match, checked from the most privileged tier down.
    #[must_use]
    pub fn tier_for_plan(&self, plan_id: &str) -> Option<Tier> {
        [
            (Tier::Elite, self.elite_plan_id.as_deref()),
            (Tier::Pro, self.pro_plan_id.as_deref()),
            (Tier::Core, self.core_plan_id.as_deref()),
        ]
        .into_iter()
        .find_map(|(tier, configured)| (configured == Some(plan_id)).then_some(tier))
    }

    fn configured(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("elite_plan_id", self.elite_plan_id.as_deref()),
            ("pro_plan_id", self.pro_plan_id.as_deref()),
            ("core_plan_id", self.core_plan_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|plan| (name, plan)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RewardConfig {
    pub cooldown_seconds: i64,
    pub page_size: usize,
    pub trial_days: i64,
    pub plans: PlanCatalog,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
            page_size: DEFAULT_PAGE_SIZE,
            trial_days: DEFAULT_TRIAL_DAYS,
            plans: PlanCatalog::default(),
        }
    }
}

impl RewardConfig {
    /// Validates numeric bounds and the plan catalog. The upper bounds keep
    /// trial expiry and cooldown arithmetic inside the representable range.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when one or more fields are
    /// outside allowed bounds or plan ids are blank or reused.
    pub fn validate(&self) -> Result<(), RewardError> {
        if !(1..=MAX_COOLDOWN_SECONDS).contains(&self.cooldown_seconds) {
            return Err(RewardError::Configuration(format!(
                "cooldown_seconds MUST be in [1, {MAX_COOLDOWN_SECONDS}]"
            )));
        }

        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(RewardError::Configuration(format!(
                "page_size MUST be in [1, {MAX_PAGE_SIZE}]"
            )));
        }

        if !(1..=MAX_TRIAL_DAYS).contains(&self.trial_days) {
            return Err(RewardError::Configuration(format!(
                "trial_days MUST be in [1, {MAX_TRIAL_DAYS}]"
            )));
        }

        let mut seen: Vec<&str> = Vec::new();
        for (name, plan_id) in self.plans.configured() {
            if plan_id.trim().is_empty() {
                return Err(RewardError::Configuration(format!(
                    "plans.{name} cannot be blank"
                )));
            }
            if seen.contains(&plan_id) {
                return Err(RewardError::Configuration(format!(
                    "plans.{name} reuses plan id `{plan_id}`"
                )));
            }
            seen.push(plan_id);
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when JSON decoding fails
    /// or decoded values violate config constraints.
    pub fn from_json(value: &Value) -> Result<Self, RewardError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RewardError::Configuration(format!("invalid reward config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_seconds)
    }

    #[must_use]
    pub fn trial_length(&self) -> Duration {
        Duration::days(self.trial_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = RewardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cooldown(), Duration::hours(1));
        assert_eq!(config.trial_length(), Duration::days(30));
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = match RewardConfig::from_json(&json!({
            "plans": {"elite_plan_id": "plan_elite"}
        })) {
            Ok(value) => value,
            Err(err) => panic!("expected valid config: {err}"),
        };
        assert_eq!(config.cooldown_seconds, DEFAULT_COOLDOWN_SECONDS);
        assert_eq!(config.plans.tier_for_plan("plan_elite"), Some(Tier::Elite));
        assert_eq!(config.plans.tier_for_plan("plan_other"), None);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for payload in [
            json!({"cooldown_seconds": 0}),
            json!({"page_size": 0}),
            json!({"page_size": 5000}),
            json!({"trial_days": -1}),
            json!({"trial_days": 10_000_000}),
            json!({"cooldown_seconds": 2_592_001}),
            json!({"cooldown_seconds": i64::MAX}),
            json!({"plans": {"pro_plan_id": "  "}}),
            json!({"plans": {"pro_plan_id": "plan_x", "core_plan_id": "plan_x"}}),
            json!({"cooldown_seconds": "soon"}),
        ] {
            assert!(
                matches!(
                    RewardConfig::from_json(&payload),
                    Err(RewardError::Configuration(_))
                ),
                "expected configuration error for {payload}"
            );
        }
    }

    #[test]
    fn accepts_values_at_upper_bounds() {
        let config = match RewardConfig::from_json(&json!({
            "cooldown_seconds": MAX_COOLDOWN_SECONDS,
            "trial_days": MAX_TRIAL_DAYS,
            "page_size": MAX_PAGE_SIZE
        })) {
            Ok(value) => value,
            Err(err) => panic!("upper bounds should be accepted: {err}"),
        };
        assert_eq!(config.cooldown(), Duration::days(30));
        assert_eq!(config.trial_length(), Duration::days(3_650));
    }

    #[test]
    fn plan_lookup_prefers_most_privileged_tier() {
        let plans = PlanCatalog {
            elite_plan_id: Some("plan_e".to_string()),
            pro_plan_id: Some("plan_p".to_string()),
            core_plan_id: Some("plan_c".to_string()),
        };
        assert_eq!(plans.tier_for_plan("plan_e"), Some(Tier::Elite));
        assert_eq!(plans.tier_for_plan("plan_p"), Some(Tier::Pro));
        assert_eq!(plans.tier_for_plan("plan_c"), Some(Tier::Core));
        assert_eq!(plans.tier_for_plan("PLAN_E"), None);
    }
}
