use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{
    ActionKind, ActivityCategory, Community, CommunityId, Grant, LedgerInsert, LedgerKey, Profile,
    ProfileId, RewardRule, Source, SubscriptionState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub profile_id: ProfileId,
    pub action_kind: ActionKind,
    pub xp: u32,
    pub source: Source,
    pub recorded_at: OffsetDateTime,
}

/// Durable state the engine reads and writes.
///
/// Implementations must make `grant_xp` atomic (counter increment and log
/// append commit together) and must reject duplicate ledger keys at the
/// storage layer rather than with an in-process lock.
pub trait RewardStore {
    #[allow(clippy::missing_errors_doc)]
    fn get_profile(&self, profile_id: ProfileId) -> Result<Option<Profile>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_profile_by_external_user(&self, external_user_id: &str) -> Result<Option<Profile>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_community(&self, community_id: CommunityId) -> Result<Option<Community>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_community_by_external_id(&self, external_id: &str) -> Result<Option<Community>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_reward_rule(&self, action_kind: ActionKind) -> Result<Option<RewardRule>>;

    #[allow(clippy::missing_errors_doc)]
    fn grant_xp(&self, request: &GrantRequest) -> Result<Grant>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_ledger_entry(&self, key: &LedgerKey, rewarded_at: OffsetDateTime)
        -> Result<LedgerInsert>;

    /// Compensation for a claim whose grant failed; not used otherwise.
    #[allow(clippy::missing_errors_doc)]
    fn delete_ledger_entry(&self, key: &LedgerKey) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn mark_synced(&self, profile_id: ProfileId, synced_at: OffsetDateTime) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn set_subscription(
        &self,
        community_id: CommunityId,
        state: &SubscriptionState,
        updated_at: OffsetDateTime,
    ) -> Result<()>;
}

/// One item from the external activity listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalActivity {
    pub external_id: String,
    pub external_user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub completed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityFilter {
    pub external_user_id: String,
    pub since: OffsetDateTime,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ActivityFetchError {
    #[error("missing permission scope: {0}")]
    Scope(String),
    #[error("platform returned http status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("platform transport failure: {0}")]
    Transport(String),
    #[error("unreadable platform response: {0}")]
    Decode(String),
}

/// Paginated listing of external activity, one category at a time.
pub trait ActivitySource {
    /// Returns at most `page_size` items in platform order.
    ///
    /// # Errors
    /// Returns [`ActivityFetchError`] when the category cannot be listed.
    fn list_activity(
        &self,
        category: ActivityCategory,
        filter: &ActivityFilter,
        page_size: usize,
    ) -> Result<Vec<ExternalActivity>, ActivityFetchError>;
}

/// Fixed listing loaded from memory or a JSON file.
///
/// Pages are returned as configured (truncated to `page_size`); the filter is
/// not applied, the way a platform that ignores `created_after` would behave.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StaticActivitySource {
    pub items: BTreeMap<ActivityCategory, Vec<ExternalActivity>>,
    pub failures: BTreeMap<ActivityCategory, String>,
}

impl StaticActivitySource {
    #[must_use]
    pub fn with_items(mut self, category: ActivityCategory, items: Vec<ExternalActivity>) -> Self {
        self.items.entry(category).or_default().extend(items);
        self
    }

    #[must_use]
    pub fn failing(mut self, category: ActivityCategory, reason: impl Into<String>) -> Self {
        self.failures.insert(category, reason.into());
        self
    }
}

impl ActivitySource for StaticActivitySource {
    fn list_activity(
        &self,
        category: ActivityCategory,
        _filter: &ActivityFilter,
        page_size: usize,
    ) -> Result<Vec<ExternalActivity>, ActivityFetchError> {
        if let Some(reason) = self.failures.get(&category) {
            return Err(ActivityFetchError::Scope(reason.clone()));
        }

        Ok(self
            .items
            .get(&category)
            .map(|items| items.iter().take(page_size).cloned().collect())
            .unwrap_or_default())
    }
}
