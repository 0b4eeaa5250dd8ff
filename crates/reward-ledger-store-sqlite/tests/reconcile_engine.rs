#![allow(clippy::manual_let_else)]

use std::path::{Path, PathBuf};

use anyhow::Result;
use reward_ledger_core::{
    parse_rfc3339_utc, ActivityCategory, BillingDisposition, BillingEvent, BillingEventData,
    Community, CommunityId, ExternalActivity, ImmediateTierSink, PlanCatalog, Profile,
    ReconcileReport, Reconciler, RewardConfig, RewardError, RewardStore, StaticActivitySource,
    SubscriptionEventHandler, Tier,
};
use reward_ledger_store_sqlite::{NewProfile, SqliteRewardStore};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn must_reward<T>(result: Result<T, RewardError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("engine failure: {err}"),
    }
}

fn t0() -> OffsetDateTime {
    match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
        Ok(value) => value,
        Err(err) => panic!("invalid fixture timestamp: {err}"),
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("reward-ledger-{label}-{}.sqlite3", Ulid::new()))
}

fn open_store(path: &Path) -> SqliteRewardStore {
    let store = must(SqliteRewardStore::open(path));
    must(store.migrate());
    store
}

fn seed(store: &SqliteRewardStore, user: &str, company: &str, tier: Tier) -> Profile {
    let community = Community {
        community_id: CommunityId::new(),
        external_id: Some(company.to_string()),
        tier: tier.as_str().to_string(),
        trial_expires_at: None,
        updated_at: t0(),
    };
    must(store.upsert_community(&community));
    must(store.register_profile(&NewProfile {
        external_user_id: user.to_string(),
        community_id: community.community_id,
        created_at: t0(),
    }))
}

fn chat(id: &str, user: &str, created_at: OffsetDateTime) -> ExternalActivity {
    ExternalActivity {
        external_id: id.to_string(),
        external_user_id: user.to_string(),
        created_at,
        completed: None,
    }
}

fn reconcile(
    store: &SqliteRewardStore,
    source: &StaticActivitySource,
    profile: &Profile,
    now: OffsetDateTime,
) -> ReconcileReport {
    let config = RewardConfig::default();
    must_reward(Reconciler::new(store, source, &config).reconcile(profile.profile_id, now))
}

#[test]
fn end_to_end_scenario_against_sqlite() {
    let path = temp_db("e2e");
    let store = open_store(&path);
    let profile = seed(&store, "user_1", "biz_1", Tier::Core);
    let source = StaticActivitySource::default().with_items(
        ActivityCategory::ChatMessage,
        vec![chat("msg_1", "user_1", t0() + Duration::hours(1))],
    );

    let first = reconcile(&store, &source, &profile, t0() + Duration::hours(2));
    assert!(first.ok);
    assert_eq!(first.xp_awarded, 5);
    assert_eq!(first.actions_count, 1);

    let second = reconcile(&store, &source, &profile, t0() + Duration::hours(2));
    assert!(!second.ok);
    assert_eq!(second.xp_awarded, 0);
    assert!(second
        .cooldown_remaining_seconds
        .is_some_and(|remaining| remaining > 0));

    assert_eq!(must(store.list_ledger_entries(Some(profile.profile_id))).len(), 1);
    assert_eq!(must(store.list_action_log(Some(profile.profile_id), None)).len(), 1);
    assert!(must(store.audit_check()).healthy);

    drop(store);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn cooldown_survives_reopening_the_database() {
    let path = temp_db("cooldown");
    let store = open_store(&path);
    let profile = seed(&store, "user_1", "biz_1", Tier::Core);
    let source = StaticActivitySource::default();

    let first = reconcile(&store, &source, &profile, t0() + Duration::hours(1));
    assert!(first.ok);
    drop(store);

    let reopened = open_store(&path);
    let second = reconcile(
        &reopened,
        &source,
        &profile,
        t0() + Duration::hours(1) + Duration::minutes(59),
    );
    assert_eq!(second.cooldown_remaining_seconds, Some(60));

    let third = reconcile(&reopened, &source, &profile, t0() + Duration::hours(2));
    assert!(third.ok);

    drop(reopened);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn watermark_advances_and_hides_older_events() {
    let path = temp_db("watermark");
    let store = open_store(&path);
    let profile = seed(&store, "user_1", "biz_1", Tier::Core);

    let first_sync = t0() + Duration::hours(1);
    let _ = reconcile(&store, &StaticActivitySource::default(), &profile, first_sync);
    let after_first = must(store.get_profile(profile.profile_id));
    assert_eq!(after_first.and_then(|value| value.last_sync_at), Some(first_sync));

    // Dated before the first sweep; a platform that ignores created_after still lists it.
    let late_listing = StaticActivitySource::default().with_items(
        ActivityCategory::ChatMessage,
        vec![
            chat("old_msg", "user_1", first_sync - Duration::minutes(10)),
            chat("new_msg", "user_1", first_sync + Duration::minutes(10)),
        ],
    );
    let second_sync = t0() + Duration::hours(3);
    let report = reconcile(&store, &late_listing, &profile, second_sync);
    assert_eq!(report.actions_count, 1);

    let ledger = must(store.list_ledger_entries(Some(profile.profile_id)));
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].key.external_id, "new_msg");

    let after_second = must(store.get_profile(profile.profile_id));
    assert!(after_second
        .and_then(|value| value.last_sync_at)
        .is_some_and(|last_sync| last_sync > first_sync));

    drop(store);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn forum_scope_failure_does_not_block_chat_rewards() {
    let path = temp_db("soft-failure");
    let store = open_store(&path);
    let profile = seed(&store, "user_1", "biz_1", Tier::Core);
    let source = StaticActivitySource::default()
        .with_items(
            ActivityCategory::ChatMessage,
            vec![chat("msg_1", "user_1", t0() + Duration::minutes(5))],
        )
        .failing(ActivityCategory::ForumPost, "forums:read");

    let report = reconcile(&store, &source, &profile, t0() + Duration::hours(1));
    assert!(report.ok);
    assert_eq!(report.xp_awarded, 5);
    assert!(report
        .details
        .iter()
        .any(|detail| detail.contains("forum posts") && detail.contains("forums:read")));

    drop(store);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn concurrent_sweeps_grant_each_event_once() {
    let path = temp_db("race");
    let setup = open_store(&path);
    let profile = seed(&setup, "user_1", "biz_1", Tier::Core);
    drop(setup);

    let items: Vec<ExternalActivity> = (0..20)
        .map(|index| chat(&format!("msg_{index}"), "user_1", t0() + Duration::minutes(index)))
        .collect();
    let source = StaticActivitySource::default().with_items(ActivityCategory::ChatMessage, items);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let source = source.clone();
            let profile = profile.clone();
            std::thread::spawn(move || {
                let store = match SqliteRewardStore::open(&path) {
                    Ok(value) => value,
                    Err(err) => panic!("failed to open racing store: {err}"),
                };
                let config = RewardConfig::default();
                Reconciler::new(&store, &source, &config)
                    .reconcile(profile.profile_id, t0() + Duration::hours(2))
            })
        })
        .collect();

    let mut awarded = 0;
    for handle in handles {
        let report = match handle.join() {
            Ok(result) => must_reward(result),
            Err(err) => panic!("reconcile thread join failed: {err:?}"),
        };
        awarded += report.xp_awarded;
    }

    let store = open_store(&path);
    assert_eq!(awarded, 20 * 5);
    assert_eq!(must(store.list_ledger_entries(Some(profile.profile_id))).len(), 20);
    let reloaded = must(store.get_profile(profile.profile_id));
    assert_eq!(reloaded.map(|value| value.xp_total), Some(100));
    assert!(must(store.audit_check()).healthy);

    drop(store);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn billing_transitions_and_renewal_dedup() {
    let path = temp_db("billing");
    let store = open_store(&path);
    let profile = seed(&store, "user_1", "biz_1", Tier::Free);
    let config = RewardConfig {
        plans: PlanCatalog {
            elite_plan_id: Some("plan_elite".to_string()),
            pro_plan_id: Some("plan_pro".to_string()),
            core_plan_id: Some("plan_core".to_string()),
        },
        ..RewardConfig::default()
    };
    let sink = ImmediateTierSink::new(&store);
    let handler = SubscriptionEventHandler::new(&store, &sink, &config);

    let signup = BillingEvent {
        event_type: "membership.created".to_string(),
        data: BillingEventData {
            id: Some("mem_1".to_string()),
            user_id: Some("user_1".to_string()),
            plan_id: None,
            company_id: Some("biz_1".to_string()),
        },
    };
    let _ = must_reward(handler.handle(&signup, t0()));
    let community = must(store.get_community(profile.community_id));
    assert_eq!(
        community.as_ref().map(|value| value.tier.as_str()),
        Some("free")
    );
    assert_eq!(
        community.and_then(|value| value.trial_expires_at),
        Some(t0() + Duration::days(30))
    );

    let upgrade = BillingEvent {
        event_type: "membership.created".to_string(),
        data: BillingEventData {
            plan_id: Some("plan_elite".to_string()),
            ..signup.data.clone()
        },
    };
    let _ = must_reward(handler.handle(&upgrade, t0() + Duration::days(3)));
    let community = must(store.get_community(profile.community_id));
    assert_eq!(
        community.as_ref().map(|value| value.tier.as_str()),
        Some("elite")
    );
    assert_eq!(community.and_then(|value| value.trial_expires_at), None);

    let payment = BillingEvent {
        event_type: "payment.succeeded".to_string(),
        data: BillingEventData {
            id: Some("pay_1".to_string()),
            user_id: Some("user_1".to_string()),
            plan_id: Some("plan_elite".to_string()),
            company_id: Some("biz_1".to_string()),
        },
    };
    let first = must_reward(handler.handle(&payment, t0() + Duration::days(30)));
    assert!(matches!(first, BillingDisposition::RenewalGranted { .. }));
    let replay = must_reward(handler.handle(&payment, t0() + Duration::days(30)));
    assert!(matches!(replay, BillingDisposition::RenewalAlreadyRewarded { .. }));

    let log = must(store.list_action_log(Some(profile.profile_id), None));
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].source.as_str(), "whop");
    assert_eq!(log[0].xp_granted, 100);

    drop(store);
    let _ = std::fs::remove_file(&path);
}
