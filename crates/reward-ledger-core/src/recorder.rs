use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::entitlement::is_eligible;
use crate::model::{ActionKind, Grant, ProfileId, Source};
use crate::store::{GrantRequest, RewardStore};
use crate::RewardError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Granted(Grant),
    NotEligible { reason: String },
}

/// Grants the XP configured for `action` to `profile_id`.
///
/// Returns `Ok(None)` when the rule is missing, inactive, or archived. The
/// call never deduplicates: callers replaying external events must claim a
/// ledger entry first.
///
/// # Errors
/// Returns [`RewardError::Storage`] when the rule lookup or the grant fails.
pub fn record_action<S>(
    store: &S,
    profile_id: ProfileId,
    action: ActionKind,
    source: Source,
    now: OffsetDateTime,
) -> Result<Option<Grant>, RewardError>
where
    S: RewardStore + ?Sized,
{
    let rule = store
        .get_reward_rule(action)
        .map_err(RewardError::storage)?;
    let Some(rule) = rule.filter(|rule| rule.grants_xp()) else {
        debug!(action = action.as_str(), "no active reward rule; skipping grant");
        return Ok(None);
    };

    let grant = store
        .grant_xp(&GrantRequest {
            profile_id,
            action_kind: action,
            xp: rule.xp_value,
            source,
            recorded_at: now,
        })
        .map_err(RewardError::storage)?;

    debug!(
        profile_id = %profile_id,
        action = action.as_str(),
        source = source.as_str(),
        xp_gained = grant.xp_gained,
        xp_total = grant.xp_total,
        "xp granted"
    );
    Ok(Some(grant))
}

/// Entitlement-gated grant used for direct (non-replayable) actions.
///
/// # Errors
/// Returns [`RewardError::IdentityNotFound`] when the profile or its
/// community does not exist, and [`RewardError::Storage`] on store failures.
pub fn record_eligible_action<S>(
    store: &S,
    profile_id: ProfileId,
    action: ActionKind,
    source: Source,
    now: OffsetDateTime,
) -> Result<RecordOutcome, RewardError>
where
    S: RewardStore + ?Sized,
{
    let profile = store
        .get_profile(profile_id)
        .map_err(RewardError::storage)?
        .ok_or_else(|| RewardError::IdentityNotFound(format!("profile {profile_id}")))?;
    let community = store
        .get_community(profile.community_id)
        .map_err(RewardError::storage)?
        .ok_or_else(|| {
            RewardError::IdentityNotFound(format!("community {}", profile.community_id))
        })?;

    let feature = action.feature();
    if !is_eligible(&community, feature, now) {
        return Ok(RecordOutcome::NotEligible {
            reason: format!(
                "feature `{}` is not available on tier `{}`",
                feature.as_str(),
                community.tier
            ),
        });
    }

    Ok(match record_action(store, profile_id, action, source, now)? {
        Some(grant) => RecordOutcome::Granted(grant),
        None => RecordOutcome::NotEligible {
            reason: format!("no active reward rule for `{}`", action.as_str()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tier;
    use crate::testing::{fixture_now, MemoryStore};

    #[test]
    fn inactive_rule_is_a_silent_no_op() {
        let now = fixture_now();
        let store = MemoryStore::default();
        let profile_id = store.seed_profile("user_1", Tier::Elite, now);
        store.deactivate_rule(ActionKind::DailyLogin);

        let grant = record_action(&store, profile_id, ActionKind::DailyLogin, Source::Manual, now);
        assert_eq!(grant, Ok(None));
        assert_eq!(store.log_len(), 0);
        assert_eq!(store.xp_total(profile_id), 0);
    }

    #[test]
    fn recorder_does_not_deduplicate() {
        let now = fixture_now();
        let store = MemoryStore::default();
        let profile_id = store.seed_profile("user_1", Tier::Elite, now);

        for _ in 0..2 {
            let grant = record_action(&store, profile_id, ActionKind::ManualAward, Source::Manual, now);
            assert!(matches!(grant, Ok(Some(ref grant)) if grant.xp_gained == 10));
        }
        assert_eq!(store.xp_total(profile_id), 20);
        assert_eq!(store.log_len(), 2);
    }

    #[test]
    fn gated_entry_point_respects_tier() {
        let now = fixture_now();
        let store = MemoryStore::default();
        let core_profile = store.seed_profile("user_core", Tier::Core, now);
        let pro_profile = store.seed_profile("user_pro", Tier::Pro, now);

        let denied = record_eligible_action(
            &store,
            core_profile,
            ActionKind::QuestCompleted,
            Source::Manual,
            now,
        );
        assert!(matches!(denied, Ok(RecordOutcome::NotEligible { .. })));
        assert_eq!(store.log_len(), 0);

        let granted = record_eligible_action(
            &store,
            pro_profile,
            ActionKind::QuestCompleted,
            Source::ExternalIntegration,
            now,
        );
        assert!(matches!(granted, Ok(RecordOutcome::Granted(ref grant)) if grant.xp_gained == 50));
    }

    #[test]
    fn gated_entry_point_reports_unknown_profile() {
        let store = MemoryStore::default();
        let outcome = record_eligible_action(
            &store,
            ProfileId::new(),
            ActionKind::ChatMessage,
            Source::Manual,
            fixture_now(),
        );
        assert!(matches!(outcome, Err(RewardError::IdentityNotFound(_))));
    }
}
