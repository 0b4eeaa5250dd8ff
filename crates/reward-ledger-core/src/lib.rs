//! Activity reconciliation and reward ledger engine.
//!
//! Every XP grant in the system goes through [`recorder::record_action`].
//! Replayable sources (platform sync, billing renewals) claim a ledger row
//! first so that a given `(profile, category, external id)` is rewarded at
//! most once.

pub mod billing;
pub mod config;
pub mod entitlement;
pub mod model;
pub mod reconcile;
pub mod recorder;
pub mod store;

#[cfg(test)]
mod testing;

pub use billing::{
    apply_tier_update, BillingDisposition, BillingEvent, BillingEventData, ImmediateTierSink,
    SubscriptionEventHandler, TierUpdateCommand, TierUpdateSink,
};
pub use config::{PlanCatalog, RewardConfig};
pub use entitlement::{is_eligible, is_feature_eligible};
pub use model::{
    ActionKind, ActionLogEntry, ActivityCategory, Community, CommunityId, FeatureKind, Grant,
    LedgerEntry, LedgerInsert, LedgerKey, LogId, Profile, ProfileId, RewardRule, Source,
    SubscriptionState, Tier,
};
pub use reconcile::{CategoryReport, CategoryStatus, ReconcileReport, Reconciler};
pub use recorder::{record_action, record_eligible_action, RecordOutcome};
pub use store::{
    ActivityFetchError, ActivityFilter, ActivitySource, ExternalActivity, GrantRequest,
    RewardStore, StaticActivitySource,
};

use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RewardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl RewardError {
    /// Wraps a store failure, keeping the whole context chain in the message.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RewardError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RewardError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RewardError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RewardError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RewardError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RewardError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_rejects_non_utc_offsets() {
        let parsed = parse_rfc3339_utc("2026-02-07T12:00:00+02:00");
        assert!(matches!(parsed, Err(RewardError::Validation(_))));
    }

    #[test]
    fn rfc3339_round_trips_utc() {
        let parsed = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("expected valid timestamp: {err}"),
        };
        assert_eq!(
            format_rfc3339(parsed).ok().as_deref(),
            Some("2026-02-07T12:00:00Z")
        );
    }

    #[test]
    fn storage_error_keeps_context_chain() {
        let err = anyhow::anyhow!("disk I/O error").context("failed to append action log");
        let mapped = RewardError::storage(err);
        assert_eq!(
            mapped,
            RewardError::Storage("failed to append action log: disk I/O error".to_string())
        );
    }
}
