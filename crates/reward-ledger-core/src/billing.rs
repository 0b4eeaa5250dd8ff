//! Billing webhook handling.
//!
//! Events arrive already verified and possibly more than once. Tier changes
//! are plain assignments and are handed to a [`TierUpdateSink`] rather than
//! applied inline; renewals claim a `renewal` ledger row keyed by the payment
//! id before any XP is granted.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::RewardConfig;
use crate::model::{
    ActionKind, ActivityCategory, CommunityId, Grant, LedgerInsert, LedgerKey, Source,
    SubscriptionState, Tier,
};
use crate::reconcile::grant_or_release;
use crate::store::RewardStore;
use crate::RewardError;

pub const MEMBERSHIP_CREATED: &str = "membership.created";
pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: BillingEventData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BillingEventData {
    /// Membership or payment id, depending on the event type.
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
    pub company_id: Option<String>,
}

/// Tier assignment produced by `membership.created`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierUpdateCommand {
    pub community_id: CommunityId,
    pub state: SubscriptionState,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

/// Hand-off point between the webhook request and whoever applies tier updates.
pub trait TierUpdateSink {
    /// # Errors
    /// Returns an error when the command cannot be accepted.
    fn enqueue(&self, command: TierUpdateCommand) -> Result<(), RewardError>;
}

/// Applies a tier update. Re-applying the same command is a no-op in effect.
///
/// # Errors
/// Returns [`RewardError::Storage`] when the community cannot be updated.
pub fn apply_tier_update<S>(store: &S, command: &TierUpdateCommand) -> Result<(), RewardError>
where
    S: RewardStore + ?Sized,
{
    store
        .set_subscription(command.community_id, &command.state, command.requested_at)
        .map_err(RewardError::storage)?;
    info!(
        community_id = %command.community_id,
        tier = command.state.tier.map_or("unknown", Tier::as_str),
        trial = command.state.trial_expires_at.is_some(),
        "tier update applied"
    );
    Ok(())
}

/// Sink that applies commands synchronously; used where no worker runs.
pub struct ImmediateTierSink<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: RewardStore + ?Sized> ImmediateTierSink<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }
}

impl<S: RewardStore + ?Sized> TierUpdateSink for ImmediateTierSink<'_, S> {
    fn enqueue(&self, command: TierUpdateCommand) -> Result<(), RewardError> {
        apply_tier_update(self.store, &command)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum BillingDisposition {
    TierUpdateQueued {
        community_id: CommunityId,
        tier: Tier,
        #[serde(with = "time::serde::rfc3339::option")]
        trial_expires_at: Option<OffsetDateTime>,
    },
    RenewalGranted {
        grant: Grant,
    },
    RenewalAlreadyRewarded {
        payment_id: String,
    },
    RenewalNotGranted {
        reason: String,
    },
    Dropped {
        reason: String,
    },
}

impl BillingDisposition {
    fn dropped(event_type: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(event_type, reason = reason.as_str(), "billing event dropped");
        Self::Dropped { reason }
    }
}

pub struct SubscriptionEventHandler<'a, S: ?Sized, K: ?Sized> {
    store: &'a S,
    sink: &'a K,
    config: &'a RewardConfig,
}

impl<'a, S, K> SubscriptionEventHandler<'a, S, K>
where
    S: RewardStore + ?Sized,
    K: TierUpdateSink + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, sink: &'a K, config: &'a RewardConfig) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Handles one verified billing event.
    ///
    /// Unknown event types and unresolvable references resolve to
    /// [`BillingDisposition::Dropped`] so the webhook is still acknowledged.
    ///
    /// # Errors
    /// Returns [`RewardError::Storage`] when the store fails, or the sink's
    /// error when a tier update cannot be enqueued.
    pub fn handle(
        &self,
        event: &BillingEvent,
        now: OffsetDateTime,
    ) -> Result<BillingDisposition, RewardError> {
        match event.event_type.as_str() {
            MEMBERSHIP_CREATED => self.membership_created(&event.data, now),
            PAYMENT_SUCCEEDED => self.payment_succeeded(&event.data, now),
            other => Ok(BillingDisposition::dropped(other, "unhandled event type")),
        }
    }

    /// Paid plans clear any trial; unknown or missing plans start a trial on Free.
    #[must_use]
    pub fn subscription_for_plan(
        &self,
        plan_id: Option<&str>,
        now: OffsetDateTime,
    ) -> SubscriptionState {
        match plan_id.and_then(|plan| self.config.plans.tier_for_plan(plan)) {
            Some(tier) => SubscriptionState::paid(tier),
            None => SubscriptionState {
                tier: Some(Tier::Free),
                trial_expires_at: Some(now.saturating_add(self.config.trial_length())),
            },
        }
    }

    fn membership_created(
        &self,
        data: &BillingEventData,
        now: OffsetDateTime,
    ) -> Result<BillingDisposition, RewardError> {
        let Some(company_id) = data.company_id.as_deref() else {
            return Ok(BillingDisposition::dropped(
                MEMBERSHIP_CREATED,
                "event has no company_id",
            ));
        };
        let Some(community) = self
            .store
            .find_community_by_external_id(company_id)
            .map_err(RewardError::storage)?
        else {
            return Ok(BillingDisposition::dropped(
                MEMBERSHIP_CREATED,
                format!("unknown company `{company_id}`"),
            ));
        };

        let state = self.subscription_for_plan(data.plan_id.as_deref(), now);
        self.sink.enqueue(TierUpdateCommand {
            community_id: community.community_id,
            state,
            requested_at: now,
        })?;

        Ok(BillingDisposition::TierUpdateQueued {
            community_id: community.community_id,
            tier: state.tier.unwrap_or(Tier::Free),
            trial_expires_at: state.trial_expires_at,
        })
    }

    fn payment_succeeded(
        &self,
        data: &BillingEventData,
        now: OffsetDateTime,
    ) -> Result<BillingDisposition, RewardError> {
        let Some(user_id) = data.user_id.as_deref() else {
            return Ok(BillingDisposition::dropped(
                PAYMENT_SUCCEEDED,
                "event has no user_id",
            ));
        };
        let Some(payment_id) = data.id.as_deref() else {
            return Ok(BillingDisposition::dropped(
                PAYMENT_SUCCEEDED,
                "event has no payment id",
            ));
        };
        let Some(profile) = self
            .store
            .find_profile_by_external_user(user_id)
            .map_err(RewardError::storage)?
        else {
            return Ok(BillingDisposition::dropped(
                PAYMENT_SUCCEEDED,
                format!("unknown user `{user_id}`"),
            ));
        };

        let key = LedgerKey {
            profile_id: profile.profile_id,
            category: ActivityCategory::Renewal,
            external_id: payment_id.to_string(),
        };
        if self
            .store
            .insert_ledger_entry(&key, now)
            .map_err(RewardError::storage)?
            == LedgerInsert::AlreadyRewarded
        {
            info!(ledger_key = %key, "renewal already rewarded");
            return Ok(BillingDisposition::RenewalAlreadyRewarded {
                payment_id: payment_id.to_string(),
            });
        }

        match grant_or_release(
            self.store,
            &key,
            ActionKind::RenewSubscription,
            Source::Whop,
            now,
        )? {
            Some(grant) => Ok(BillingDisposition::RenewalGranted { grant }),
            None => Ok(BillingDisposition::RenewalNotGranted {
                reason: format!(
                    "no active reward rule for `{}`",
                    ActionKind::RenewSubscription.as_str()
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanCatalog;
    use crate::testing::{fixture_now, MemoryStore};
    use serde_json::json;
    use time::Duration;

    fn config() -> RewardConfig {
        RewardConfig {
            plans: PlanCatalog {
                elite_plan_id: Some("plan_elite".to_string()),
                pro_plan_id: Some("plan_pro".to_string()),
                core_plan_id: None,
            },
            ..RewardConfig::default()
        }
    }

    fn event(value: serde_json::Value) -> BillingEvent {
        match serde_json::from_value(value) {
            Ok(event) => event,
            Err(err) => panic!("fixture event should decode: {err}"),
        }
    }

    fn must_handle(
        store: &MemoryStore,
        config: &RewardConfig,
        event: &BillingEvent,
        now: OffsetDateTime,
    ) -> BillingDisposition {
        let sink = ImmediateTierSink::new(store);
        match SubscriptionEventHandler::new(store, &sink, config).handle(event, now) {
            Ok(disposition) => disposition,
            Err(err) => panic!("billing event should be handled: {err}"),
        }
    }

    #[test]
    fn membership_created_moves_from_trial_to_elite() {
        let now = fixture_now();
        let config = config();
        let store = MemoryStore::default();
        let profile_id = store.seed_profile("user_1", Tier::Core, now);
        let community_id = store.community_of(profile_id);

        let signup = event(json!({
            "type": "membership.created",
            "data": {"id": "mem_1", "user_id": "user_1", "plan_id": "plan_mystery", "company_id": "biz_1"}
        }));
        let first = must_handle(&store, &config, &signup, now);
        assert!(matches!(first, BillingDisposition::TierUpdateQueued { tier: Tier::Free, .. }));
        let community = store.community(community_id);
        assert_eq!(community.tier, "free");
        assert_eq!(community.trial_expires_at, Some(now + Duration::days(30)));

        let upgrade = event(json!({
            "type": "membership.created",
            "data": {"id": "mem_2", "user_id": "user_1", "plan_id": "plan_elite", "company_id": "biz_1"}
        }));
        must_handle(&store, &config, &upgrade, now + Duration::days(1));
        let community = store.community(community_id);
        assert_eq!(community.tier, "elite");
        assert_eq!(community.trial_expires_at, None);

        // Redelivery assigns the same state again.
        must_handle(&store, &config, &upgrade, now + Duration::days(2));
        assert_eq!(store.community(community_id).tier, "elite");
    }

    #[test]
    fn longest_allowed_trial_expires_in_range() {
        let now = fixture_now();
        let config = match RewardConfig::from_json(&json!({"trial_days": 3_650})) {
            Ok(value) => value,
            Err(err) => panic!("trial length should be accepted: {err}"),
        };
        let store = MemoryStore::default();
        let sink = ImmediateTierSink::new(&store);
        let handler = SubscriptionEventHandler::new(&store, &sink, &config);
        let state = handler.subscription_for_plan(Some("plan_unknown"), now);
        assert_eq!(state.tier, Some(Tier::Free));
        assert_eq!(state.trial_expires_at, Some(now + Duration::days(3_650)));
    }

    #[test]
    fn repeated_payment_delivery_grants_once() {
        let now = fixture_now();
        let config = config();
        let store = MemoryStore::default();
        let profile_id = store.seed_profile("user_1", Tier::Pro, now);
        let payment = event(json!({
            "type": "payment.succeeded",
            "data": {"id": "pay_1", "user_id": "user_1"}
        }));

        let first = must_handle(&store, &config, &payment, now);
        assert!(matches!(first, BillingDisposition::RenewalGranted { ref grant } if grant.xp_gained == 100));
        let second = must_handle(&store, &config, &payment, now);
        assert_eq!(
            second,
            BillingDisposition::RenewalAlreadyRewarded {
                payment_id: "pay_1".to_string()
            }
        );
        assert_eq!(store.xp_total(profile_id), 100);
        assert_eq!(store.log_len(), 1);
    }

    #[test]
    fn unresolvable_events_are_dropped_not_failed() {
        let now = fixture_now();
        let config = config();
        let store = MemoryStore::default();

        for payload in [
            json!({"type": "payment.succeeded", "data": {"id": "pay_1", "user_id": "ghost"}}),
            json!({"type": "payment.succeeded", "data": {"user_id": "ghost"}}),
            json!({"type": "membership.created", "data": {"plan_id": "plan_pro"}}),
            json!({"type": "membership.created", "data": {"company_id": "biz_unknown"}}),
            json!({"type": "refund.created", "data": {}}),
        ] {
            let disposition = must_handle(&store, &config, &event(payload.clone()), now);
            assert!(
                matches!(disposition, BillingDisposition::Dropped { .. }),
                "expected drop for {payload}"
            );
        }
        assert_eq!(store.ledger_len(), 0);
    }
}
