use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::RewardError;

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = RewardError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    RewardError::Validation(format!("invalid {} ULID `{raw}`: {err}", $label))
                })
            }
        }
    };
}

ulid_id!(ProfileId, "profile_id");
ulid_id!(CommunityId, "community_id");
ulid_id!(LogId, "log_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Core,
    Starter,
    Pro,
    Elite,
    Trial,
}

impl Tier {
    pub const ALL: [Self; 6] = [
        Self::Free,
        Self::Core,
        Self::Starter,
        Self::Pro,
        Self::Elite,
        Self::Trial,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Core => "core",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Elite => "elite",
            Self::Trial => "trial",
        }
    }

    /// Case-insensitive; surrounding whitespace is ignored.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "core" => Some(Self::Core),
            "starter" => Some(Self::Starter),
            "pro" => Some(Self::Pro),
            "elite" => Some(Self::Elite),
            "trial" => Some(Self::Trial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Dashboard,
    Badges,
    Leaderboard,
    ManualActions,
    Engagement,
    Quests,
    Analytics,
    Discord,
    SeasonalLeaderboard,
    Store,
    Retention,
    Inventory,
    WhiteLabel,
}

impl FeatureKind {
    pub const ALL: [Self; 13] = [
        Self::Dashboard,
        Self::Badges,
        Self::Leaderboard,
        Self::ManualActions,
        Self::Engagement,
        Self::Quests,
        Self::Analytics,
        Self::Discord,
        Self::SeasonalLeaderboard,
        Self::Store,
        Self::Retention,
        Self::Inventory,
        Self::WhiteLabel,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Badges => "badges",
            Self::Leaderboard => "leaderboard",
            Self::ManualActions => "manual_actions",
            Self::Engagement => "engagement",
            Self::Quests => "quests",
            Self::Analytics => "analytics",
            Self::Discord => "discord",
            Self::SeasonalLeaderboard => "seasonal_leaderboard",
            Self::Store => "store",
            Self::Retention => "retention",
            Self::Inventory => "inventory",
            Self::WhiteLabel => "white_label",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|feature| feature.as_str() == normalized)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ChatMessage,
    ForumPost,
    LessonCompleted,
    QuestCompleted,
    DailyLogin,
    RenewSubscription,
    ManualAward,
}

impl ActionKind {
    pub const ALL: [Self; 7] = [
        Self::ChatMessage,
        Self::ForumPost,
        Self::LessonCompleted,
        Self::QuestCompleted,
        Self::DailyLogin,
        Self::RenewSubscription,
        Self::ManualAward,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::ForumPost => "forum_post",
            Self::LessonCompleted => "lesson_completed",
            Self::QuestCompleted => "quest_completed",
            Self::DailyLogin => "daily_login",
            Self::RenewSubscription => "renew_subscription",
            Self::ManualAward => "manual_award",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == value.trim())
    }

    /// The entitlement that has to be active before this action earns XP.
    #[must_use]
    pub fn feature(self) -> FeatureKind {
        match self {
            Self::ChatMessage
            | Self::ForumPost
            | Self::LessonCompleted
            | Self::DailyLogin
            | Self::RenewSubscription => FeatureKind::Engagement,
            Self::QuestCompleted => FeatureKind::Quests,
            Self::ManualAward => FeatureKind::ManualActions,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    ChatMessage,
    ForumPost,
    LessonCompletion,
    Renewal,
}

impl ActivityCategory {
    pub const ALL: [Self; 4] = [
        Self::ChatMessage,
        Self::ForumPost,
        Self::LessonCompletion,
        Self::Renewal,
    ];

    /// Categories swept by reconciliation, in processing order.
    pub const SYNCED: [Self; 3] = [Self::ChatMessage, Self::ForumPost, Self::LessonCompletion];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::ForumPost => "forum_post",
            Self::LessonCompletion => "lesson_completion",
            Self::Renewal => "renewal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == value.trim())
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat messages",
            Self::ForumPost => "forum posts",
            Self::LessonCompletion => "lesson completions",
            Self::Renewal => "renewals",
        }
    }

    /// Action kind (and therefore reward rule) credited for one item of this category.
    #[must_use]
    pub fn action_kind(self) -> ActionKind {
        match self {
            Self::ChatMessage => ActionKind::ChatMessage,
            Self::ForumPost => ActionKind::ForumPost,
            Self::LessonCompletion => ActionKind::LessonCompleted,
            Self::Renewal => ActionKind::RenewSubscription,
        }
    }

    /// Only finished lessons are rewarded; other categories count on sight.
    #[must_use]
    pub fn requires_completion(self) -> bool {
        matches!(self, Self::LessonCompletion)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Manual,
    Sync,
    Whop,
    ExternalIntegration,
}

impl Source {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Sync => "sync",
            Self::Whop => "whop",
            Self::ExternalIntegration => "external_integration",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "manual" => Some(Self::Manual),
            "sync" => Some(Self::Sync),
            "whop" | "webhook" => Some(Self::Whop),
            "external_integration" => Some(Self::ExternalIntegration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub profile_id: ProfileId,
    pub external_user_id: String,
    pub community_id: CommunityId,
    pub xp_total: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_action_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
}

impl Profile {
    /// Lower bound for external activity considered by the next sweep.
    #[must_use]
    pub fn sync_watermark(&self) -> OffsetDateTime {
        match self.last_sync_at {
            Some(last_sync) if last_sync > self.created_at => last_sync,
            _ => self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Community {
    pub community_id: CommunityId,
    pub external_id: Option<String>,
    /// Stored literal; values outside [`Tier`] are kept so they fail closed.
    pub tier: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Community {
    #[must_use]
    pub fn subscription(&self) -> SubscriptionState {
        SubscriptionState {
            tier: Tier::parse(&self.tier),
            trial_expires_at: self.trial_expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionState {
    /// `None` when the stored tier literal is not recognized.
    pub tier: Option<Tier>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_expires_at: Option<OffsetDateTime>,
}

impl SubscriptionState {
    #[must_use]
    pub fn paid(tier: Tier) -> Self {
        Self {
            tier: Some(tier),
            trial_expires_at: None,
        }
    }

    #[must_use]
    pub fn trial_active(&self, now: OffsetDateTime) -> bool {
        self.trial_expires_at.is_some_and(|expires| expires > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardRule {
    pub action_kind: ActionKind,
    pub xp_value: u32,
    pub active: bool,
    pub archived: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl RewardRule {
    #[must_use]
    pub fn grants_xp(&self) -> bool {
        self.active && !self.archived
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub profile_id: ProfileId,
    pub category: ActivityCategory,
    pub external_id: String,
}

impl Display for LedgerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.profile_id,
            self.category.as_str(),
            self.external_id
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerInsert {
    Inserted,
    AlreadyRewarded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: LedgerKey,
    #[serde(with = "time::serde::rfc3339")]
    pub rewarded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionLogEntry {
    pub log_seq: i64,
    pub log_id: LogId,
    pub profile_id: ProfileId,
    pub action_kind: ActionKind,
    pub xp_granted: u32,
    pub source: Source,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub action_kind: ActionKind,
    pub xp_gained: u32,
    pub xp_total: u64,
    pub log_id: LogId,
}
