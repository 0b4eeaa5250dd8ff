//! Cooldown-gated sweep over external activity.
//!
//! A sweep walks [`ActivityCategory::SYNCED`] in order. For each listed item
//! that belongs to the profile, is at or after the watermark, and (for
//! lessons) is completed, the engine claims a ledger row first and only then
//! grants. A duplicate claim is the "already rewarded" signal. If the grant
//! fails the claim is released again so a later sweep can retry it.
//!
//! Fetch failures stay local to their category. The sync timestamp advances
//! once per sweep, after all categories, even when some of them failed.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::config::RewardConfig;
use crate::entitlement::is_eligible;
use crate::model::{
    ActionKind, ActivityCategory, Community, Grant, LedgerInsert, LedgerKey, Profile, ProfileId,
    Source,
};
use crate::recorder::record_action;
use crate::store::{ActivityFilter, ActivitySource, ExternalActivity, RewardStore};
use crate::RewardError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Synced,
    NotEligible,
    FetchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: ActivityCategory,
    pub status: CategoryStatus,
    pub xp_awarded: u64,
    pub actions_count: u32,
    pub already_rewarded: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_seconds: Option<i64>,
    pub xp_awarded: u64,
    pub actions_count: u32,
    pub details: Vec<String>,
    pub categories: Vec<CategoryReport>,
}

impl ReconcileReport {
    fn cooldown(remaining_seconds: i64) -> Self {
        Self {
            ok: false,
            cooldown_remaining_seconds: Some(remaining_seconds),
            xp_awarded: 0,
            actions_count: 0,
            details: vec![format!(
                "cooldown active: next sync allowed in {remaining_seconds}s"
            )],
            categories: Vec::new(),
        }
    }
}

pub struct Reconciler<'a, S: ?Sized, A: ?Sized> {
    store: &'a S,
    source: &'a A,
    config: &'a RewardConfig,
}

impl<'a, S, A> Reconciler<'a, S, A>
where
    S: RewardStore + ?Sized,
    A: ActivitySource + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, source: &'a A, config: &'a RewardConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Runs one sweep for `profile_id` as of `now`.
    ///
    /// # Errors
    /// Returns [`RewardError::IdentityNotFound`] for unknown profiles or
    /// communities and [`RewardError::Storage`] when the store fails. Fetch
    /// failures are reported per category instead.
    pub fn reconcile(
        &self,
        profile_id: ProfileId,
        now: OffsetDateTime,
    ) -> Result<ReconcileReport, RewardError> {
        let profile = self
            .store
            .get_profile(profile_id)
            .map_err(RewardError::storage)?
            .ok_or_else(|| RewardError::IdentityNotFound(format!("profile {profile_id}")))?;

        if let Some(remaining) = self.cooldown_remaining(&profile, now) {
            info!(
                profile_id = %profile_id,
                remaining_seconds = remaining,
                "reconciliation rejected by cooldown"
            );
            return Ok(ReconcileReport::cooldown(remaining));
        }

        let community = self
            .store
            .get_community(profile.community_id)
            .map_err(RewardError::storage)?
            .ok_or_else(|| {
                RewardError::IdentityNotFound(format!("community {}", profile.community_id))
            })?;

        let filter = ActivityFilter {
            external_user_id: profile.external_user_id.clone(),
            since: profile.sync_watermark(),
        };

        let mut categories = Vec::with_capacity(ActivityCategory::SYNCED.len());
        for category in ActivityCategory::SYNCED {
            categories.push(self.sweep_category(&profile, &community, category, &filter, now)?);
        }

        self.store
            .mark_synced(profile_id, now)
            .map_err(RewardError::storage)?;

        let xp_awarded = categories.iter().map(|report| report.xp_awarded).sum();
        let actions_count = categories.iter().map(|report| report.actions_count).sum();
        info!(
            profile_id = %profile_id,
            xp_awarded,
            actions_count,
            "reconciliation finished"
        );

        Ok(ReconcileReport {
            ok: true,
            cooldown_remaining_seconds: None,
            xp_awarded,
            actions_count,
            details: categories
                .iter()
                .map(|report| report.message.clone())
                .collect(),
            categories,
        })
    }

    fn cooldown_remaining(&self, profile: &Profile, now: OffsetDateTime) -> Option<i64> {
        let last_sync = profile.last_sync_at?;
        let remaining = self.config.cooldown().saturating_sub(now - last_sync);
        if remaining <= time::Duration::ZERO {
            return None;
        }
        // Round up so a caller never sees 0 while still blocked.
        let seconds = remaining.whole_seconds();
        Some(if remaining.subsec_nanoseconds() > 0 {
            seconds + 1
        } else {
            seconds
        })
    }

    fn sweep_category(
        &self,
        profile: &Profile,
        community: &Community,
        category: ActivityCategory,
        filter: &ActivityFilter,
        now: OffsetDateTime,
    ) -> Result<CategoryReport, RewardError> {
        let action = category.action_kind();
        let mut report = CategoryReport {
            category,
            status: CategoryStatus::Synced,
            xp_awarded: 0,
            actions_count: 0,
            already_rewarded: 0,
            message: String::new(),
        };

        if !is_eligible(community, action.feature(), now) {
            report.status = CategoryStatus::NotEligible;
            report.message = format!(
                "{}: not eligible on tier `{}`",
                category.label(),
                community.tier
            );
            return Ok(report);
        }

        let items = match self
            .source
            .list_activity(category, filter, self.config.page_size)
        {
            Ok(items) => items,
            Err(err) => {
                warn!(
                    profile_id = %profile.profile_id,
                    category = category.as_str(),
                    error = %err,
                    "activity fetch failed; continuing with remaining categories"
                );
                report.status = CategoryStatus::FetchFailed;
                report.message = format!("{}: skipped ({err})", category.label());
                return Ok(report);
            }
        };

        for item in items
            .iter()
            .take(self.config.page_size)
            .filter(|item| qualifies(item, category, filter))
        {
            let key = LedgerKey {
                profile_id: profile.profile_id,
                category,
                external_id: item.external_id.clone(),
            };
            match self
                .store
                .insert_ledger_entry(&key, now)
                .map_err(RewardError::storage)?
            {
                LedgerInsert::AlreadyRewarded => report.already_rewarded += 1,
                LedgerInsert::Inserted => {
                    if let Some(grant) =
                        grant_or_release(self.store, &key, action, Source::Sync, now)?
                    {
                        report.xp_awarded += u64::from(grant.xp_gained);
                        report.actions_count += 1;
                    }
                }
            }
        }

        report.message = format!(
            "{}: {} new, {} already rewarded, +{} XP",
            category.label(),
            report.actions_count,
            report.already_rewarded,
            report.xp_awarded
        );
        Ok(report)
    }
}

fn qualifies(item: &ExternalActivity, category: ActivityCategory, filter: &ActivityFilter) -> bool {
    if item.external_user_id != filter.external_user_id || item.created_at < filter.since {
        return false;
    }
    !category.requires_completion() || item.completed == Some(true)
}

/// Grants for a freshly claimed ledger row and releases the claim if the
/// grant fails. Returns `None` when no rule is active.
pub(crate) fn grant_or_release<S>(
    store: &S,
    key: &LedgerKey,
    action: ActionKind,
    source: Source,
    now: OffsetDateTime,
) -> Result<Option<Grant>, RewardError>
where
    S: RewardStore + ?Sized,
{
    match record_action(store, key.profile_id, action, source, now) {
        Ok(grant) => Ok(grant),
        Err(err) => {
            if let Err(release_err) = store.delete_ledger_entry(key) {
                error!(
                    ledger_key = %key,
                    error = %format!("{release_err:#}"),
                    "failed to release ledger claim after grant failure"
                );
            }
            Err(err)
        }
    }
}
