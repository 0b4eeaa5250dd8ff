//! Tier and trial gating for reward-eligible features.
//!
//! Evaluation order, first match wins:
//! 1. an unexpired trial unlocks every feature;
//! 2. `dashboard` is always available;
//! 3. the tier's access table decides;
//! 4. an unrecognized tier gets nothing.

use time::OffsetDateTime;

use crate::model::{Community, FeatureKind, SubscriptionState, Tier};

const ELITE_EXCLUSIVE: [FeatureKind; 4] = [
    FeatureKind::Store,
    FeatureKind::Retention,
    FeatureKind::Inventory,
    FeatureKind::WhiteLabel,
];

const LOW_TIER_FEATURES: [FeatureKind; 5] = [
    FeatureKind::Badges,
    FeatureKind::Leaderboard,
    FeatureKind::ManualActions,
    FeatureKind::Engagement,
    FeatureKind::Dashboard,
];

#[derive(Debug, Clone, Copy)]
enum TierAccess {
    Everything,
    AllExcept(&'static [FeatureKind]),
    Only(&'static [FeatureKind]),
    Nothing,
}

impl TierAccess {
    fn allows(self, feature: FeatureKind) -> bool {
        match self {
            Self::Everything => true,
            Self::AllExcept(denied) => !denied.contains(&feature),
            Self::Only(allowed) => allowed.contains(&feature),
            Self::Nothing => false,
        }
    }
}

fn access_for(tier: Option<Tier>) -> TierAccess {
    match tier {
        Some(Tier::Elite) => TierAccess::Everything,
        Some(Tier::Pro) => TierAccess::AllExcept(&ELITE_EXCLUSIVE),
        // An expired trial falls back to the free feature set.
        Some(Tier::Core | Tier::Starter | Tier::Free | Tier::Trial) => {
            TierAccess::Only(&LOW_TIER_FEATURES)
        }
        None => TierAccess::Nothing,
    }
}

/// Decides whether `feature` may currently earn rewards under `state`.
#[must_use]
pub fn is_feature_eligible(
    state: &SubscriptionState,
    feature: FeatureKind,
    now: OffsetDateTime,
) -> bool {
    if state.trial_active(now) {
        return true;
    }

    if feature == FeatureKind::Dashboard {
        return true;
    }

    access_for(state.tier).allows(feature)
}

#[must_use]
pub fn is_eligible(community: &Community, feature: FeatureKind, now: OffsetDateTime) -> bool {
    is_feature_eligible(&community.subscription(), feature, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommunityId;
    use time::Duration;

    fn fixture_now() -> OffsetDateTime {
        match crate::parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn state(tier: Tier) -> SubscriptionState {
        SubscriptionState::paid(tier)
    }

    #[test]
    fn core_tier_matrix() {
        let now = fixture_now();
        assert!(!is_feature_eligible(&state(Tier::Core), FeatureKind::Quests, now));
        assert!(is_feature_eligible(&state(Tier::Core), FeatureKind::Badges, now));
        for denied in [
            FeatureKind::Analytics,
            FeatureKind::Discord,
            FeatureKind::SeasonalLeaderboard,
            FeatureKind::Store,
            FeatureKind::WhiteLabel,
        ] {
            assert!(!is_feature_eligible(&state(Tier::Core), denied, now));
            assert!(!is_feature_eligible(&state(Tier::Starter), denied, now));
            assert!(!is_feature_eligible(&state(Tier::Free), denied, now));
        }
    }

    #[test]
    fn pro_tier_excludes_elite_only_features() {
        let now = fixture_now();
        assert!(!is_feature_eligible(&state(Tier::Pro), FeatureKind::Store, now));
        assert!(!is_feature_eligible(&state(Tier::Pro), FeatureKind::Retention, now));
        assert!(is_feature_eligible(&state(Tier::Pro), FeatureKind::Quests, now));
        assert!(is_feature_eligible(&state(Tier::Pro), FeatureKind::Analytics, now));
    }

    #[test]
    fn elite_tier_gets_everything() {
        let now = fixture_now();
        for feature in FeatureKind::ALL {
            assert!(is_feature_eligible(&state(Tier::Elite), feature, now));
        }
    }

    #[test]
    fn active_trial_overrides_every_tier() {
        let now = fixture_now();
        for tier in Tier::ALL {
            let trial = SubscriptionState {
                tier: Some(tier),
                trial_expires_at: Some(now + Duration::hours(1)),
            };
            assert!(is_feature_eligible(&trial, FeatureKind::Store, now));
        }

        let unknown_tier_trial = SubscriptionState {
            tier: None,
            trial_expires_at: Some(now + Duration::hours(1)),
        };
        assert!(is_feature_eligible(&unknown_tier_trial, FeatureKind::WhiteLabel, now));
    }

    #[test]
    fn expired_trial_falls_back_to_tier() {
        let now = fixture_now();
        let expired = SubscriptionState {
            tier: Some(Tier::Free),
            trial_expires_at: Some(now),
        };
        assert!(!is_feature_eligible(&expired, FeatureKind::Store, now));
        assert!(is_feature_eligible(&expired, FeatureKind::Engagement, now));
    }

    #[test]
    fn unknown_tier_fails_closed_except_dashboard() {
        let now = fixture_now();
        let community = Community {
            community_id: CommunityId::new(),
            external_id: None,
            tier: "Platinum".to_string(),
            trial_expires_at: None,
            updated_at: now,
        };
        assert!(is_eligible(&community, FeatureKind::Dashboard, now));
        assert!(!is_eligible(&community, FeatureKind::Badges, now));
        assert!(!is_eligible(&community, FeatureKind::Engagement, now));
    }

    #[test]
    fn stored_tier_literal_is_case_insensitive() {
        let now = fixture_now();
        let community = Community {
            community_id: CommunityId::new(),
            external_id: None,
            tier: "ELITE".to_string(),
            trial_expires_at: None,
            updated_at: now,
        };
        assert!(is_eligible(&community, FeatureKind::Store, now));
    }
}
