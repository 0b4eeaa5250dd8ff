//! In-memory [`RewardStore`] for engine unit tests.

use std::cell::RefCell;
use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use time::OffsetDateTime;

use crate::model::{
    ActionKind, ActionLogEntry, ActivityCategory, Community, CommunityId, Grant, LedgerInsert,
    LedgerKey, LogId, Profile, ProfileId, RewardRule, SubscriptionState, Tier,
};
use crate::store::{ExternalActivity, GrantRequest, RewardStore};

pub(crate) fn fixture_now() -> OffsetDateTime {
    match crate::parse_rfc3339_utc("2026-02-07T12:00:00Z") {
        Ok(value) => value,
        Err(err) => panic!("invalid fixture timestamp: {err}"),
    }
}

pub(crate) fn activity(id: &str, user: &str, created_at: OffsetDateTime) -> ExternalActivity {
    ExternalActivity {
        external_id: id.to_string(),
        external_user_id: user.to_string(),
        created_at,
        completed: None,
    }
}

#[derive(Default)]
struct State {
    profiles: BTreeMap<ProfileId, Profile>,
    communities: BTreeMap<CommunityId, Community>,
    rules: BTreeMap<ActionKind, RewardRule>,
    ledger: BTreeMap<(ProfileId, ActivityCategory, String), OffsetDateTime>,
    log: Vec<ActionLogEntry>,
    fail_grants: bool,
}

pub(crate) struct MemoryStore {
    state: RefCell<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let now = fixture_now();
        let mut state = State::default();
        for (action, xp_value) in [
            (ActionKind::ChatMessage, 5),
            (ActionKind::ForumPost, 10),
            (ActionKind::LessonCompleted, 25),
            (ActionKind::QuestCompleted, 50),
            (ActionKind::DailyLogin, 2),
            (ActionKind::RenewSubscription, 100),
            (ActionKind::ManualAward, 10),
        ] {
            state.rules.insert(
                action,
                RewardRule {
                    action_kind: action,
                    xp_value,
                    active: true,
                    archived: false,
                    updated_at: now,
                },
            );
        }
        Self {
            state: RefCell::new(state),
        }
    }
}

impl MemoryStore {
    pub(crate) fn seed_profile(&self, user: &str, tier: Tier, created_at: OffsetDateTime) -> ProfileId {
        self.seed_profile_with_tier_literal(user, tier.as_str(), created_at)
    }

    pub(crate) fn seed_profile_with_tier_literal(
        &self,
        user: &str,
        tier: &str,
        created_at: OffsetDateTime,
    ) -> ProfileId {
        let mut state = self.state.borrow_mut();
        let community_id = CommunityId::new();
        let external_id = format!("biz_{}", state.communities.len() + 1);
        state.communities.insert(
            community_id,
            Community {
                community_id,
                external_id: Some(external_id),
                tier: tier.to_string(),
                trial_expires_at: None,
                updated_at: created_at,
            },
        );
        let profile_id = ProfileId::new();
        state.profiles.insert(
            profile_id,
            Profile {
                profile_id,
                external_user_id: user.to_string(),
                community_id,
                xp_total: 0,
                created_at,
                last_action_at: None,
                last_sync_at: None,
            },
        );
        profile_id
    }

    fn profile(&self, profile_id: ProfileId) -> Profile {
        match self.state.borrow().profiles.get(&profile_id) {
            Some(profile) => profile.clone(),
            None => panic!("unknown fixture profile {profile_id}"),
        }
    }

    pub(crate) fn community_of(&self, profile_id: ProfileId) -> CommunityId {
        self.profile(profile_id).community_id
    }

    pub(crate) fn community(&self, community_id: CommunityId) -> Community {
        match self.state.borrow().communities.get(&community_id) {
            Some(community) => community.clone(),
            None => panic!("unknown fixture community {community_id}"),
        }
    }

    pub(crate) fn xp_total(&self, profile_id: ProfileId) -> u64 {
        self.profile(profile_id).xp_total
    }

    pub(crate) fn last_sync(&self, profile_id: ProfileId) -> Option<OffsetDateTime> {
        self.profile(profile_id).last_sync_at
    }

    pub(crate) fn force_last_sync(&self, profile_id: ProfileId, at: OffsetDateTime) {
        if let Some(profile) = self.state.borrow_mut().profiles.get_mut(&profile_id) {
            profile.last_sync_at = Some(at);
        }
    }

    pub(crate) fn deactivate_rule(&self, action: ActionKind) {
        if let Some(rule) = self.state.borrow_mut().rules.get_mut(&action) {
            rule.active = false;
        }
    }

    pub(crate) fn fail_grants(&self, fail: bool) {
        self.state.borrow_mut().fail_grants = fail;
    }

    pub(crate) fn ledger_len(&self) -> usize {
        self.state.borrow().ledger.len()
    }

    pub(crate) fn log_len(&self) -> usize {
        self.state.borrow().log.len()
    }
}

impl RewardStore for MemoryStore {
    fn get_profile(&self, profile_id: ProfileId) -> Result<Option<Profile>> {
        Ok(self.state.borrow().profiles.get(&profile_id).cloned())
    }

    fn find_profile_by_external_user(&self, external_user_id: &str) -> Result<Option<Profile>> {
        Ok(self
            .state
            .borrow()
            .profiles
            .values()
            .find(|profile| profile.external_user_id == external_user_id)
            .cloned())
    }

    fn get_community(&self, community_id: CommunityId) -> Result<Option<Community>> {
        Ok(self.state.borrow().communities.get(&community_id).cloned())
    }

    fn find_community_by_external_id(&self, external_id: &str) -> Result<Option<Community>> {
        Ok(self
            .state
            .borrow()
            .communities
            .values()
            .find(|community| community.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    fn get_reward_rule(&self, action_kind: ActionKind) -> Result<Option<RewardRule>> {
        Ok(self.state.borrow().rules.get(&action_kind).cloned())
    }

    fn grant_xp(&self, request: &GrantRequest) -> Result<Grant> {
        let mut state = self.state.borrow_mut();
        if state.fail_grants {
            bail!("simulated storage outage");
        }
        let log_seq = i64::try_from(state.log.len())? + 1;
        let profile = state
            .profiles
            .get_mut(&request.profile_id)
            .ok_or_else(|| anyhow!("profile {} not found", request.profile_id))?;
        profile.xp_total += u64::from(request.xp);
        profile.last_action_at = Some(request.recorded_at);
        let xp_total = profile.xp_total;
        let log_id = LogId::new();
        state.log.push(ActionLogEntry {
            log_seq,
            log_id,
            profile_id: request.profile_id,
            action_kind: request.action_kind,
            xp_granted: request.xp,
            source: request.source,
            recorded_at: request.recorded_at,
        });
        Ok(Grant {
            action_kind: request.action_kind,
            xp_gained: request.xp,
            xp_total,
            log_id,
        })
    }

    fn insert_ledger_entry(&self, key: &LedgerKey, rewarded_at: OffsetDateTime) -> Result<LedgerInsert> {
        let mut state = self.state.borrow_mut();
        let slot = (key.profile_id, key.category, key.external_id.clone());
        if state.ledger.contains_key(&slot) {
            return Ok(LedgerInsert::AlreadyRewarded);
        }
        state.ledger.insert(slot, rewarded_at);
        Ok(LedgerInsert::Inserted)
    }

    fn delete_ledger_entry(&self, key: &LedgerKey) -> Result<()> {
        self.state
            .borrow_mut()
            .ledger
            .remove(&(key.profile_id, key.category, key.external_id.clone()));
        Ok(())
    }

    fn mark_synced(&self, profile_id: ProfileId, synced_at: OffsetDateTime) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| anyhow!("profile {profile_id} not found"))?;
        profile.last_sync_at = Some(synced_at);
        Ok(())
    }

    fn set_subscription(
        &self,
        community_id: CommunityId,
        state: &SubscriptionState,
        updated_at: OffsetDateTime,
    ) -> Result<()> {
        let mut inner = self.state.borrow_mut();
        let community = inner
            .communities
            .get_mut(&community_id)
            .ok_or_else(|| anyhow!("community {community_id} not found"))?;
        community.tier = state.tier.map_or("free", Tier::as_str).to_string();
        community.trial_expires_at = state.trial_expires_at;
        community.updated_at = updated_at;
        Ok(())
    }
}
