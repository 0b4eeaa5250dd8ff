#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use reward_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ActionKind, ActionLogEntry, ActivityCategory,
    Community, CommunityId, Grant, GrantRequest, LedgerEntry, LedgerInsert, LedgerKey, LogId,
    Profile, ProfileId, RewardStore, RewardRule, Source, SubscriptionState, Tier,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const REWARD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_REWARD_V1: &str = r"
CREATE TABLE IF NOT EXISTS communities (
  community_id TEXT PRIMARY KEY,
  external_id TEXT UNIQUE,
  tier TEXT NOT NULL,
  trial_expires_at TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
  profile_id TEXT PRIMARY KEY,
  external_user_id TEXT NOT NULL UNIQUE,
  community_id TEXT NOT NULL,
  xp_total INTEGER NOT NULL DEFAULT 0 CHECK (xp_total >= 0),
  created_at TEXT NOT NULL,
  last_action_at TEXT,
  last_sync_at TEXT,
  FOREIGN KEY (community_id) REFERENCES communities(community_id)
);

CREATE TABLE IF NOT EXISTS reward_rules (
  action_kind TEXT PRIMARY KEY CHECK (
    action_kind IN (
      'chat_message',
      'forum_post',
      'lesson_completed',
      'quest_completed',
      'daily_login',
      'renew_subscription',
      'manual_award'
    )
  ),
  xp_value INTEGER NOT NULL CHECK (xp_value >= 0),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  archived INTEGER NOT NULL DEFAULT 0 CHECK (archived IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rewarded_activity (
  profile_id TEXT NOT NULL,
  activity_kind TEXT NOT NULL CHECK (
    activity_kind IN ('chat_message', 'forum_post', 'lesson_completion', 'renewal')
  ),
  external_id TEXT NOT NULL,
  rewarded_at TEXT NOT NULL,
  PRIMARY KEY (profile_id, activity_kind, external_id),
  FOREIGN KEY (profile_id) REFERENCES profiles(profile_id)
);

CREATE TRIGGER IF NOT EXISTS trg_rewarded_activity_no_update
BEFORE UPDATE ON rewarded_activity
BEGIN
  SELECT RAISE(FAIL, 'rewarded_activity rows are immutable');
END;

CREATE TABLE IF NOT EXISTS action_log (
  log_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  log_id TEXT NOT NULL UNIQUE,
  profile_id TEXT NOT NULL,
  action_kind TEXT NOT NULL,
  xp_granted INTEGER NOT NULL CHECK (xp_granted >= 0),
  source TEXT NOT NULL CHECK (source IN ('manual', 'sync', 'whop', 'external_integration')),
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (profile_id) REFERENCES profiles(profile_id)
);

CREATE TRIGGER IF NOT EXISTS trg_action_log_no_update
BEFORE UPDATE ON action_log
BEGIN
  SELECT RAISE(FAIL, 'action_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_action_log_no_delete
BEFORE DELETE ON action_log
BEGIN
  SELECT RAISE(FAIL, 'action_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_action_log_profile_seq
  ON action_log(profile_id, log_seq);
CREATE INDEX IF NOT EXISTS idx_profiles_community
  ON profiles(community_id);
";

/// Rule values seeded on first migration; existing rows are never overwritten.
pub const DEFAULT_RULES: [(ActionKind, u32); 7] = [
    (ActionKind::ChatMessage, 5),
    (ActionKind::ForumPost, 10),
    (ActionKind::LessonCompleted, 25),
    (ActionKind::QuestCompleted, 50),
    (ActionKind::DailyLogin, 2),
    (ActionKind::RenewSubscription, 100),
    (ActionKind::ManualAward, 10),
];

const PROFILE_COLUMNS: &str = "profile_id, external_user_id, community_id, xp_total, created_at, last_action_at, last_sync_at";
const COMMUNITY_COLUMNS: &str = "community_id, external_id, tier, trial_expires_at, updated_at";
const RULE_COLUMNS: &str = "action_kind, xp_value, active, archived, updated_at";
const LOG_COLUMNS: &str =
    "log_seq, log_id, profile_id, action_kind, xp_granted, source, recorded_at";

pub struct SqliteRewardStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct NewProfile {
    pub external_user_id: String,
    pub community_id: CommunityId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AuditIssue {
    pub code: String,
    pub severity: AuditIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct XpMismatch {
    pub profile_id: ProfileId,
    pub xp_total: u64,
    pub action_log_sum: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AuditCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub profiles_checked: usize,
    pub action_log_entries: usize,
    pub ledger_entries: usize,
    pub issues: Vec<AuditIssue>,
    pub mismatches: Vec<XpMismatch>,
}

impl SqliteRewardStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_REWARD_V1)
            .context("failed to apply reward ledger schema")?;

        let now = sql_time(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REWARD_MIGRATION_VERSION, now],
            )
            .context("failed to register reward ledger schema migration")?;

        for (action, xp_value) in DEFAULT_RULES {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO reward_rules(action_kind, xp_value, active, archived, updated_at)
                     VALUES (?1, ?2, 1, 0, ?3)",
                    params![action.as_str(), i64::from(xp_value), now],
                )
                .with_context(|| format!("failed to seed reward rule {}", action.as_str()))?;
        }

        Ok(())
    }

    /// Inserts or replaces a community's subscription fields.
    pub fn upsert_community(&self, community: &Community) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO communities(community_id, external_id, tier, trial_expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(community_id) DO UPDATE SET
                   external_id = excluded.external_id,
                   tier = excluded.tier,
                   trial_expires_at = excluded.trial_expires_at,
                   updated_at = excluded.updated_at",
                params![
                    community.community_id.to_string(),
                    community.external_id,
                    community.tier,
                    community.trial_expires_at.map(sql_time).transpose()?,
                    sql_time(community.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to upsert community {}", community.community_id))?;
        Ok(())
    }

    pub fn register_profile(&self, input: &NewProfile) -> Result<Profile> {
        if input.external_user_id.trim().is_empty() {
            bail!("external_user_id cannot be empty");
        }
        if self.get_community(input.community_id)?.is_none() {
            bail!("community {} not found", input.community_id);
        }

        let profile = Profile {
            profile_id: ProfileId::new(),
            external_user_id: input.external_user_id.trim().to_string(),
            community_id: input.community_id,
            xp_total: 0,
            created_at: input.created_at,
            last_action_at: None,
            last_sync_at: None,
        };
        self.conn
            .execute(
                "INSERT INTO profiles(profile_id, external_user_id, community_id, xp_total, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![
                    profile.profile_id.to_string(),
                    profile.external_user_id,
                    profile.community_id.to_string(),
                    sql_time(profile.created_at)?,
                ],
            )
            .with_context(|| {
                format!("failed to register profile for {}", profile.external_user_id)
            })?;
        Ok(profile)
    }

    /// Creates or replaces a rule and clears its archived flag.
    pub fn set_rule(
        &self,
        action: ActionKind,
        xp_value: u32,
        active: bool,
        updated_at: OffsetDateTime,
    ) -> Result<RewardRule> {
        self.conn
            .execute(
                "INSERT INTO reward_rules(action_kind, xp_value, active, archived, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(action_kind) DO UPDATE SET
                   xp_value = excluded.xp_value,
                   active = excluded.active,
                   archived = 0,
                   updated_at = excluded.updated_at",
                params![
                    action.as_str(),
                    i64::from(xp_value),
                    bool_to_sql(active),
                    sql_time(updated_at)?
                ],
            )
            .with_context(|| format!("failed to set reward rule {}", action.as_str()))?;

        self.get_reward_rule(action)?
            .ok_or_else(|| anyhow!("reward rule {} vanished after write", action.as_str()))
    }

    /// Soft delete: the row stays for history but no longer grants XP.
    pub fn archive_rule(&self, action: ActionKind, updated_at: OffsetDateTime) -> Result<RewardRule> {
        let changed = self
            .conn
            .execute(
                "UPDATE reward_rules SET archived = 1, updated_at = ?2 WHERE action_kind = ?1",
                params![action.as_str(), sql_time(updated_at)?],
            )
            .with_context(|| format!("failed to archive reward rule {}", action.as_str()))?;
        if changed == 0 {
            bail!("reward rule {} not found", action.as_str());
        }

        self.get_reward_rule(action)?
            .ok_or_else(|| anyhow!("reward rule {} vanished after archive", action.as_str()))
    }

    pub fn list_rules(&self) -> Result<Vec<RewardRule>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM reward_rules ORDER BY action_kind ASC"
            ))
            .context("failed to prepare reward rule listing")?;
        let rows = stmt.query_map([], parse_rule_row)?;
        collect_rows(rows)
    }

    pub fn list_action_log(
        &self,
        profile_id: Option<ProfileId>,
        limit: Option<usize>,
    ) -> Result<Vec<ActionLogEntry>> {
        let mut query = format!("SELECT {LOG_COLUMNS} FROM action_log");
        if profile_id.is_some() {
            query.push_str(" WHERE profile_id = ?1");
        }
        query.push_str(" ORDER BY log_seq ASC");
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .context("failed to prepare action log listing")?;
        let rows = match profile_id {
            Some(id) => stmt.query_map(params![id.to_string()], parse_log_row)?,
            None => stmt.query_map([], parse_log_row)?,
        };
        collect_rows(rows)
    }

    pub fn list_ledger_entries(&self, profile_id: Option<ProfileId>) -> Result<Vec<LedgerEntry>> {
        let mut query = "SELECT profile_id, activity_kind, external_id, rewarded_at
             FROM rewarded_activity"
            .to_string();
        if profile_id.is_some() {
            query.push_str(" WHERE profile_id = ?1");
        }
        query.push_str(" ORDER BY rowid ASC");

        let mut stmt = self
            .conn
            .prepare(&query)
            .context("failed to prepare ledger listing")?;
        let rows = match profile_id {
            Some(id) => stmt.query_map(params![id.to_string()], parse_ledger_row)?,
            None => stmt.query_map([], parse_ledger_row)?,
        };
        collect_rows(rows)
    }

    /// Cross-checks every profile counter against its action log.
    pub fn audit_check(&self) -> Result<AuditCheck> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.profile_id, p.xp_total, COALESCE(SUM(l.xp_granted), 0)
                 FROM profiles p
                 LEFT JOIN action_log l ON l.profile_id = p.profile_id
                 GROUP BY p.profile_id
                 ORDER BY p.profile_id ASC",
            )
            .context("failed to prepare audit query")?;
        let rows = stmt.query_map([], |row| {
            let profile_id_raw: String = row.get(0)?;
            let xp_total: i64 = row.get(1)?;
            let log_sum: i64 = row.get(2)?;
            Ok((
                parse_profile_id(&profile_id_raw, 0)?,
                to_u64(xp_total, 1)?,
                to_u64(log_sum, 2)?,
            ))
        })?;
        let totals = collect_rows(rows)?;

        let mismatches: Vec<XpMismatch> = totals
            .iter()
            .filter(|(_, xp_total, log_sum)| xp_total != log_sum)
            .map(|(profile_id, xp_total, log_sum)| XpMismatch {
                profile_id: *profile_id,
                xp_total: *xp_total,
                action_log_sum: *log_sum,
            })
            .collect();

        let mut issues = Vec::new();
        if !mismatches.is_empty() {
            issues.push(AuditIssue {
                code: "xp_total_mismatch".to_string(),
                severity: AuditIssueSeverity::Error,
                message: format!(
                    "xp_total differs from action log sum for {} profiles",
                    mismatches.len()
                ),
            });
        }

        let orphan_claims = self.count("SELECT COUNT(*) FROM rewarded_activity r
             WHERE NOT EXISTS (SELECT 1 FROM profiles p WHERE p.profile_id = r.profile_id)")?;
        if orphan_claims > 0 {
            issues.push(AuditIssue {
                code: "orphan_ledger_rows".to_string(),
                severity: AuditIssueSeverity::Warning,
                message: format!("ledger rows without a profile: {orphan_claims}"),
            });
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == AuditIssueSeverity::Error);

        Ok(AuditCheck {
            contract_version: "audit_check.v1".to_string(),
            healthy,
            profiles_checked: totals.len(),
            action_log_entries: self.count("SELECT COUNT(*) FROM action_log")?,
            ledger_entries: self.count("SELECT COUNT(*) FROM rewarded_activity")?,
            issues,
            mismatches,
        })
    }

    fn count(&self, query: &str) -> Result<usize> {
        let value: i64 = self
            .conn
            .query_row(query, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {query}"))?;
        usize::try_from(value).with_context(|| format!("invalid row count: {value}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RewardStore for SqliteRewardStore {
    fn get_profile(&self, profile_id: ProfileId) -> Result<Option<Profile>> {
        self.conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE profile_id = ?1"),
                params![profile_id.to_string()],
                parse_profile_row,
            )
            .optional()
            .with_context(|| format!("failed to load profile {profile_id}"))
    }

    fn find_profile_by_external_user(&self, external_user_id: &str) -> Result<Option<Profile>> {
        self.conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE external_user_id = ?1"),
                params![external_user_id],
                parse_profile_row,
            )
            .optional()
            .with_context(|| format!("failed to resolve external user {external_user_id}"))
    }

    fn get_community(&self, community_id: CommunityId) -> Result<Option<Community>> {
        self.conn
            .query_row(
                &format!("SELECT {COMMUNITY_COLUMNS} FROM communities WHERE community_id = ?1"),
                params![community_id.to_string()],
                parse_community_row,
            )
            .optional()
            .with_context(|| format!("failed to load community {community_id}"))
    }

    fn find_community_by_external_id(&self, external_id: &str) -> Result<Option<Community>> {
        self.conn
            .query_row(
                &format!("SELECT {COMMUNITY_COLUMNS} FROM communities WHERE external_id = ?1"),
                params![external_id],
                parse_community_row,
            )
            .optional()
            .with_context(|| format!("failed to resolve external community {external_id}"))
    }

    fn get_reward_rule(&self, action_kind: ActionKind) -> Result<Option<RewardRule>> {
        self.conn
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM reward_rules WHERE action_kind = ?1"),
                params![action_kind.as_str()],
                parse_rule_row,
            )
            .optional()
            .with_context(|| format!("failed to load reward rule {}", action_kind.as_str()))
    }

    fn grant_xp(&self, request: &GrantRequest) -> Result<Grant> {
        let recorded_at = sql_time(request.recorded_at)?;
        let log_id = LogId(Ulid::new());

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start grant transaction")?;

        let changed = tx
            .execute(
                "UPDATE profiles
                 SET xp_total = xp_total + ?2, last_action_at = ?3
                 WHERE profile_id = ?1",
                params![
                    request.profile_id.to_string(),
                    i64::from(request.xp),
                    recorded_at
                ],
            )
            .context("failed to increment profile xp")?;
        if changed == 0 {
            bail!("profile {} not found", request.profile_id);
        }

        tx.execute(
            "INSERT INTO action_log(log_id, profile_id, action_kind, xp_granted, source, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log_id.to_string(),
                request.profile_id.to_string(),
                request.action_kind.as_str(),
                i64::from(request.xp),
                request.source.as_str(),
                recorded_at,
            ],
        )
        .context("failed to append action log entry")?;

        let xp_total: i64 = tx
            .query_row(
                "SELECT xp_total FROM profiles WHERE profile_id = ?1",
                params![request.profile_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to read updated xp total")?;

        tx.commit().context("failed to commit grant transaction")?;

        Ok(Grant {
            action_kind: request.action_kind,
            xp_gained: request.xp,
            xp_total: u64::try_from(xp_total)
                .with_context(|| format!("invalid xp_total: {xp_total}"))?,
            log_id,
        })
    }

    fn insert_ledger_entry(
        &self,
        key: &LedgerKey,
        rewarded_at: OffsetDateTime,
    ) -> Result<LedgerInsert> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO rewarded_activity(profile_id, activity_kind, external_id, rewarded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    key.profile_id.to_string(),
                    key.category.as_str(),
                    key.external_id,
                    sql_time(rewarded_at)?,
                ],
            )
            .with_context(|| format!("failed to claim ledger entry {key}"))?;

        if inserted == 0 {
            debug!(ledger_key = %key, "ledger entry already present");
            return Ok(LedgerInsert::AlreadyRewarded);
        }
        Ok(LedgerInsert::Inserted)
    }

    fn delete_ledger_entry(&self, key: &LedgerKey) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM rewarded_activity
                 WHERE profile_id = ?1 AND activity_kind = ?2 AND external_id = ?3",
                params![
                    key.profile_id.to_string(),
                    key.category.as_str(),
                    key.external_id
                ],
            )
            .with_context(|| format!("failed to release ledger entry {key}"))?;
        Ok(())
    }

    fn mark_synced(&self, profile_id: ProfileId, synced_at: OffsetDateTime) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE profiles SET last_sync_at = ?2 WHERE profile_id = ?1",
                params![profile_id.to_string(), sql_time(synced_at)?],
            )
            .with_context(|| format!("failed to record sync time for {profile_id}"))?;
        if changed == 0 {
            bail!("profile {profile_id} not found");
        }
        Ok(())
    }

    fn set_subscription(
        &self,
        community_id: CommunityId,
        state: &SubscriptionState,
        updated_at: OffsetDateTime,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE communities SET tier = ?2, trial_expires_at = ?3, updated_at = ?4
                 WHERE community_id = ?1",
                params![
                    community_id.to_string(),
                    state.tier.map_or(Tier::Free.as_str(), Tier::as_str),
                    state.trial_expires_at.map(sql_time).transpose()?,
                    sql_time(updated_at)?,
                ],
            )
            .with_context(|| format!("failed to update subscription for {community_id}"))?;
        if changed == 0 {
            bail!("community {community_id} not found");
        }
        Ok(())
    }
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let profile_id_raw: String = row.get(0)?;
    let community_id_raw: String = row.get(2)?;
    let xp_total: i64 = row.get(3)?;
    let created_at_raw: String = row.get(4)?;
    let last_action_raw: Option<String> = row.get(5)?;
    let last_sync_raw: Option<String> = row.get(6)?;

    Ok(Profile {
        profile_id: parse_profile_id(&profile_id_raw, 0)?,
        external_user_id: row.get(1)?,
        community_id: parse_community_id(&community_id_raw, 2)?,
        xp_total: to_u64(xp_total, 3)?,
        created_at: parse_time(&created_at_raw, 4)?,
        last_action_at: last_action_raw
            .as_deref()
            .map(|raw| parse_time(raw, 5))
            .transpose()?,
        last_sync_at: last_sync_raw
            .as_deref()
            .map(|raw| parse_time(raw, 6))
            .transpose()?,
    })
}

fn parse_community_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Community> {
    let community_id_raw: String = row.get(0)?;
    let trial_raw: Option<String> = row.get(3)?;
    let updated_at_raw: String = row.get(4)?;

    Ok(Community {
        community_id: parse_community_id(&community_id_raw, 0)?,
        external_id: row.get(1)?,
        tier: row.get(2)?,
        trial_expires_at: trial_raw
            .as_deref()
            .map(|raw| parse_time(raw, 3))
            .transpose()?,
        updated_at: parse_time(&updated_at_raw, 4)?,
    })
}

fn parse_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RewardRule> {
    let action_raw: String = row.get(0)?;
    let xp_value: i64 = row.get(1)?;
    let active: i64 = row.get(2)?;
    let archived: i64 = row.get(3)?;
    let updated_at_raw: String = row.get(4)?;

    Ok(RewardRule {
        action_kind: parse_action_kind(&action_raw, 0)?,
        xp_value: to_u32(xp_value, 1)?,
        active: active == 1,
        archived: archived == 1,
        updated_at: parse_time(&updated_at_raw, 4)?,
    })
}

fn parse_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionLogEntry> {
    let log_id_raw: String = row.get(1)?;
    let profile_id_raw: String = row.get(2)?;
    let action_raw: String = row.get(3)?;
    let xp_granted: i64 = row.get(4)?;
    let source_raw: String = row.get(5)?;
    let recorded_at_raw: String = row.get(6)?;

    let log_id = Ulid::from_string(&log_id_raw)
        .map(LogId)
        .map_err(|err| invalid_column(1, rusqlite::types::Type::Text, format!("invalid log_id: {err}")))?;
    let source = Source::parse(&source_raw).ok_or_else(|| {
        invalid_column(
            5,
            rusqlite::types::Type::Text,
            format!("invalid source: {source_raw}"),
        )
    })?;

    Ok(ActionLogEntry {
        log_seq: row.get(0)?,
        log_id,
        profile_id: parse_profile_id(&profile_id_raw, 2)?,
        action_kind: parse_action_kind(&action_raw, 3)?,
        xp_granted: to_u32(xp_granted, 4)?,
        source,
        recorded_at: parse_time(&recorded_at_raw, 6)?,
    })
}

fn parse_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let profile_id_raw: String = row.get(0)?;
    let category_raw: String = row.get(1)?;
    let rewarded_at_raw: String = row.get(3)?;

    let category = ActivityCategory::parse(&category_raw).ok_or_else(|| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid activity_kind: {category_raw}"),
        )
    })?;

    Ok(LedgerEntry {
        key: LedgerKey {
            profile_id: parse_profile_id(&profile_id_raw, 0)?,
            category,
            external_id: row.get(2)?,
        },
        rewarded_at: parse_time(&rewarded_at_raw, 3)?,
    })
}

fn parse_profile_id(raw: &str, column: usize) -> rusqlite::Result<ProfileId> {
    Ulid::from_string(raw).map(ProfileId).map_err(|err| {
        invalid_column(
            column,
            rusqlite::types::Type::Text,
            format!("invalid profile_id ULID: {err}"),
        )
    })
}

fn parse_community_id(raw: &str, column: usize) -> rusqlite::Result<CommunityId> {
    Ulid::from_string(raw).map(CommunityId).map_err(|err| {
        invalid_column(
            column,
            rusqlite::types::Type::Text,
            format!("invalid community_id ULID: {err}"),
        )
    })
}

fn parse_action_kind(raw: &str, column: usize) -> rusqlite::Result<ActionKind> {
    ActionKind::parse(raw).ok_or_else(|| {
        invalid_column(
            column,
            rusqlite::types::Type::Text,
            format!("invalid action_kind: {raw}"),
        )
    })
}

fn parse_time(raw: &str, column: usize) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| invalid_column(column, rusqlite::types::Type::Text, err.to_string()))
}

fn to_u64(value: i64, column: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        invalid_column(
            column,
            rusqlite::types::Type::Integer,
            format!("negative value not allowed: {value}"),
        )
    })
}

fn to_u32(value: i64, column: usize) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        invalid_column(
            column,
            rusqlite::types::Type::Integer,
            format!("value out of range: {value}"),
        )
    })
}

fn invalid_column(
    column: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_time(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
