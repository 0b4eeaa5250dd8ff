//! `xpl`: operator command surface for the reward ledger.
//!
//! Every command opens (and migrates) the SQLite database named by `--db`,
//! runs against it synchronously and prints JSON. Listings and the audit
//! check print a table unless `--json` is passed.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reward_ledger_core::{
    is_eligible, now_utc, parse_rfc3339_utc, record_action, record_eligible_action, ActionKind,
    ActionLogEntry, ActivitySource, BillingEvent, Community, CommunityId, FeatureKind,
    ImmediateTierSink, LedgerEntry, ProfileId, RecordOutcome, Reconciler, RewardConfig,
    RewardRule, RewardStore, Source, StaticActivitySource, SubscriptionEventHandler, Tier,
};
use reward_ledger_platform_http::{HttpActivitySource, HttpPlatformConfig};
use reward_ledger_store_sqlite::{AuditCheck, AuditIssueSeverity, NewProfile, SqliteRewardStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "xpl")]
#[command(about = "XP reward ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./reward_ledger.sqlite3")]
    db: PathBuf,

    /// JSON settings file (reward config plus optional `platform` section).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Community {
        #[command(subcommand)]
        command: CommunityCommand,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Rule {
        #[command(subcommand)]
        command: RuleCommand,
    },
    Action {
        #[command(subcommand)]
        command: ActionCommand,
    },
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    Billing {
        #[command(subcommand)]
        command: BillingCommand,
    },
    Eligibility {
        #[command(subcommand)]
        command: EligibilityCommand,
    },
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CommunityCommand {
    Upsert(CommunityUpsertArgs),
    Show(CommunityShowArgs),
}

#[derive(Debug, Args)]
pub struct CommunityUpsertArgs {
    #[arg(long)]
    community_id: Option<String>,
    #[arg(long)]
    external_id: Option<String>,
    #[arg(long)]
    tier: TierArg,
    #[arg(long)]
    trial_expires_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct CommunityShowArgs {
    #[arg(long, conflicts_with = "external_id", required_unless_present = "external_id")]
    community_id: Option<String>,
    #[arg(long)]
    external_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    Register(ProfileRegisterArgs),
    Show(ProfileShowArgs),
}

#[derive(Debug, Args)]
pub struct ProfileRegisterArgs {
    #[arg(long)]
    external_user_id: String,
    #[arg(long)]
    community_id: String,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProfileShowArgs {
    #[arg(
        long,
        conflicts_with = "external_user_id",
        required_unless_present = "external_user_id"
    )]
    profile_id: Option<String>,
    #[arg(long)]
    external_user_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RuleCommand {
    Set(RuleSetArgs),
    Archive(RuleArchiveArgs),
    List(JsonFlag),
}

#[derive(Debug, Args)]
pub struct RuleSetArgs {
    #[arg(long, value_parser = parse_action_kind)]
    action: ActionKind,
    #[arg(long)]
    xp: u32,
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Args)]
pub struct RuleArchiveArgs {
    #[arg(long, value_parser = parse_action_kind)]
    action: ActionKind,
}

#[derive(Debug, Args)]
pub struct JsonFlag {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ActionCommand {
    Record(ActionRecordArgs),
}

#[derive(Debug, Args)]
pub struct ActionRecordArgs {
    #[arg(long)]
    profile_id: String,
    #[arg(long, value_parser = parse_action_kind)]
    action: ActionKind,
    #[arg(long, value_enum, default_value_t = SourceArg::Manual)]
    source: SourceArg,
    /// Skip the tier check (admin override; still needs an active rule).
    #[arg(long)]
    ungated: bool,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    Run(SyncRunArgs),
}

#[derive(Debug, Args)]
pub struct SyncRunArgs {
    #[arg(long)]
    profile_id: String,
    /// Static activity listing (JSON) used instead of the platform API.
    #[arg(long, conflicts_with = "platform_url")]
    activity_file: Option<PathBuf>,
    #[arg(long)]
    platform_url: Option<String>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum BillingCommand {
    Handle(BillingHandleArgs),
}

#[derive(Debug, Args)]
pub struct BillingHandleArgs {
    #[arg(long)]
    event_file: PathBuf,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EligibilityCommand {
    Check(EligibilityCheckArgs),
}

#[derive(Debug, Args)]
pub struct EligibilityCheckArgs {
    #[arg(long)]
    community_id: String,
    #[arg(long, value_parser = parse_feature_kind)]
    feature: FeatureKind,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    List(LogListArgs),
}

#[derive(Debug, Args)]
pub struct LogListArgs {
    #[arg(long)]
    profile_id: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    List(LedgerListArgs),
}

#[derive(Debug, Args)]
pub struct LedgerListArgs {
    #[arg(long)]
    profile_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Check(JsonFlag),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Free,
    Core,
    Starter,
    Pro,
    Elite,
    Trial,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceArg {
    Manual,
    Sync,
    Whop,
    ExternalIntegration,
}

/// Settings file layout shared by the CLI and the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSettings {
    #[serde(flatten)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub platform: Option<HttpPlatformConfig>,
}

impl LedgerSettings {
    /// Loads settings from `path`, or defaults when no path is given.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable or any section is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("config file {} must be valid JSON", path.display()))?;
        let settings: Self = serde_json::from_value(value)
            .map_err(|err| anyhow!("invalid config file {}: {err}", path.display()))?;
        settings.reward.validate()?;
        if let Some(platform) = &settings.platform {
            platform.validate()?;
        }
        Ok(settings)
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when settings loading, migration, or command execution
/// fails, and when `audit check` finds an unhealthy ledger.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = LedgerSettings::load(cli.config.as_deref())?;
    let store = SqliteRewardStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &store, &settings)
}

/// Runs one command against an already-migrated store.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_command(
    command: Command,
    store: &SqliteRewardStore,
    settings: &LedgerSettings,
) -> Result<()> {
    match command {
        Command::Community { command } => run_community(command, store),
        Command::Profile { command } => run_profile(command, store),
        Command::Rule { command } => run_rule(command, store),
        Command::Action { command } => run_action(command, store),
        Command::Sync { command } => run_sync(command, store, settings),
        Command::Billing { command } => run_billing(command, store, settings),
        Command::Eligibility { command } => run_eligibility(command, store),
        Command::Log { command } => run_log(command, store),
        Command::Ledger { command } => run_ledger(command, store),
        Command::Audit { command } => run_audit(command, store),
    }
}

fn run_community(command: CommunityCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        CommunityCommand::Upsert(args) => {
            let existing = match (&args.community_id, &args.external_id) {
                (Some(raw), _) => store.get_community(parse_community_id(raw)?)?,
                (None, Some(external_id)) => store.find_community_by_external_id(external_id)?,
                (None, None) => None,
            };
            let community_id = match (&existing, &args.community_id) {
                (Some(found), _) => found.community_id,
                (None, Some(raw)) => parse_community_id(raw)?,
                (None, None) => CommunityId::new(),
            };

            let community = Community {
                community_id,
                external_id: args
                    .external_id
                    .or_else(|| existing.and_then(|found| found.external_id)),
                tier: map_tier(args.tier).as_str().to_string(),
                trial_expires_at: args
                    .trial_expires_at
                    .as_deref()
                    .map(parse_utc)
                    .transpose()?,
                updated_at: now_utc(),
            };
            store.upsert_community(&community)?;
            println!("{}", serde_json::to_string_pretty(&community)?);
            Ok(())
        }
        CommunityCommand::Show(args) => {
            let community = match (&args.community_id, &args.external_id) {
                (Some(raw), _) => store.get_community(parse_community_id(raw)?)?,
                (None, Some(external_id)) => store.find_community_by_external_id(external_id)?,
                (None, None) => None,
            }
            .ok_or_else(|| anyhow!("community not found"))?;
            println!("{}", serde_json::to_string_pretty(&community)?);
            Ok(())
        }
    }
}

fn run_profile(command: ProfileCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        ProfileCommand::Register(args) => {
            let profile = store.register_profile(&NewProfile {
                external_user_id: args.external_user_id,
                community_id: parse_community_id(&args.community_id)?,
                created_at: parse_optional_utc(args.created_at.as_deref())?,
            })?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        ProfileCommand::Show(args) => {
            let profile = match (&args.profile_id, &args.external_user_id) {
                (Some(raw), _) => store.get_profile(parse_profile_id(raw)?)?,
                (None, Some(external_user_id)) => {
                    store.find_profile_by_external_user(external_user_id)?
                }
                (None, None) => None,
            }
            .ok_or_else(|| anyhow!("profile not found"))?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
    }
}

fn run_rule(command: RuleCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        RuleCommand::Set(args) => {
            let rule = store.set_rule(args.action, args.xp, !args.inactive, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
            Ok(())
        }
        RuleCommand::Archive(args) => {
            let rule = store.archive_rule(args.action, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
            Ok(())
        }
        RuleCommand::List(args) => {
            let rules = store.list_rules()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                print_rule_table(&rules);
            }
            Ok(())
        }
    }
}

fn run_action(command: ActionCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        ActionCommand::Record(args) => {
            let profile_id = parse_profile_id(&args.profile_id)?;
            let now = parse_optional_utc(args.at.as_deref())?;
            let source = map_source(args.source);

            let outcome = if args.ungated {
                match record_action(store, profile_id, args.action, source, now)? {
                    Some(grant) => RecordOutcome::Granted(grant),
                    None => RecordOutcome::NotEligible {
                        reason: format!("no active reward rule for `{}`", args.action.as_str()),
                    },
                }
            } else {
                record_eligible_action(store, profile_id, args.action, source, now)?
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

fn run_sync(
    command: SyncCommand,
    store: &SqliteRewardStore,
    settings: &LedgerSettings,
) -> Result<()> {
    match command {
        SyncCommand::Run(args) => {
            let profile_id = parse_profile_id(&args.profile_id)?;
            let now = parse_optional_utc(args.at.as_deref())?;
            let source = activity_source(&args, settings)?;

            let report = Reconciler::new(store, source.as_ref(), &settings.reward)
                .reconcile(profile_id, now)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn activity_source(
    args: &SyncRunArgs,
    settings: &LedgerSettings,
) -> Result<Box<dyn ActivitySource>> {
    if let Some(path) = &args.activity_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read activity file {}", path.display()))?;
        let listing: StaticActivitySource = serde_json::from_str(&raw)
            .with_context(|| format!("invalid activity file {}", path.display()))?;
        return Ok(Box::new(listing));
    }

    let platform = match (&args.platform_url, &settings.platform) {
        (Some(url), Some(configured)) => Some(HttpPlatformConfig {
            base_url: url.clone(),
            ..configured.clone()
        }),
        (Some(url), None) => Some(HttpPlatformConfig::new(url.clone())),
        (None, configured) => configured.clone(),
    };

    match platform {
        Some(config) => Ok(Box::new(HttpActivitySource::new(&config)?)),
        None => {
            warn!("no activity file or platform configured; sweeping an empty listing");
            Ok(Box::new(StaticActivitySource::default()))
        }
    }
}

fn run_billing(
    command: BillingCommand,
    store: &SqliteRewardStore,
    settings: &LedgerSettings,
) -> Result<()> {
    match command {
        BillingCommand::Handle(args) => {
            let raw = std::fs::read_to_string(&args.event_file).with_context(|| {
                format!("failed to read event file {}", args.event_file.display())
            })?;
            let event: BillingEvent = serde_json::from_str(&raw).with_context(|| {
                format!("invalid billing event {}", args.event_file.display())
            })?;
            let now = parse_optional_utc(args.at.as_deref())?;

            let sink = ImmediateTierSink::new(store);
            let disposition =
                SubscriptionEventHandler::new(store, &sink, &settings.reward).handle(&event, now)?;
            println!("{}", serde_json::to_string_pretty(&disposition)?);
            Ok(())
        }
    }
}

fn run_eligibility(command: EligibilityCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        EligibilityCommand::Check(args) => {
            let community_id = parse_community_id(&args.community_id)?;
            let now = parse_optional_utc(args.at.as_deref())?;
            let community = store
                .get_community(community_id)?
                .ok_or_else(|| anyhow!("community {community_id} not found"))?;

            let payload = json!({
                "community_id": community_id,
                "feature": args.feature,
                "tier": community.tier,
                "trial_active": community.subscription().trial_active(now),
                "eligible": is_eligible(&community, args.feature, now),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_log(command: LogCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        LogCommand::List(args) => {
            let profile_id = args.profile_id.as_deref().map(parse_profile_id).transpose()?;
            let entries = store.list_action_log(profile_id, args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_log_table(&entries);
            }
            Ok(())
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        LedgerCommand::List(args) => {
            let profile_id = args.profile_id.as_deref().map(parse_profile_id).transpose()?;
            let entries = store.list_ledger_entries(profile_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_ledger_table(&entries);
            }
            Ok(())
        }
    }
}

fn run_audit(command: AuditCommand, store: &SqliteRewardStore) -> Result<()> {
    match command {
        AuditCommand::Check(args) => {
            let check = store.audit_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_audit_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "ledger audit failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
    }
}

fn parse_action_kind(raw: &str) -> Result<ActionKind, String> {
    ActionKind::parse(raw).ok_or_else(|| {
        format!(
            "unknown action kind '{raw}' (expected one of: {})",
            ActionKind::ALL.map(ActionKind::as_str).join(", ")
        )
    })
}

fn parse_feature_kind(raw: &str) -> Result<FeatureKind, String> {
    FeatureKind::parse(raw).ok_or_else(|| {
        format!(
            "unknown feature '{raw}' (expected one of: {})",
            FeatureKind::ALL.map(FeatureKind::as_str).join(", ")
        )
    })
}

fn parse_utc(raw: &str) -> Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_utc(value),
        None => Ok(now_utc()),
    }
}

fn parse_profile_id(raw: &str) -> Result<ProfileId> {
    raw.parse::<ProfileId>().map_err(|err| anyhow!("{err}"))
}

fn parse_community_id(raw: &str) -> Result<CommunityId> {
    raw.parse::<CommunityId>().map_err(|err| anyhow!("{err}"))
}

fn map_tier(value: TierArg) -> Tier {
    match value {
        TierArg::Free => Tier::Free,
        TierArg::Core => Tier::Core,
        TierArg::Starter => Tier::Starter,
        TierArg::Pro => Tier::Pro,
        TierArg::Elite => Tier::Elite,
        TierArg::Trial => Tier::Trial,
    }
}

fn map_source(value: SourceArg) -> Source {
    match value {
        SourceArg::Manual => Source::Manual,
        SourceArg::Sync => Source::Sync,
        SourceArg::Whop => Source::Whop,
        SourceArg::ExternalIntegration => Source::ExternalIntegration,
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_rule_table(rules: &[RewardRule]) {
    println!(
        "{:<20} {:<8} {:<7} {:<9} updated_at",
        "action_kind", "xp", "active", "archived"
    );
    println!("{}", "-".repeat(70));
    for rule in rules {
        println!(
            "{:<20} {:<8} {:<7} {:<9} {}",
            rule.action_kind.as_str(),
            rule.xp_value,
            yes_no(rule.active),
            yes_no(rule.archived),
            rule.updated_at
        );
    }
}

fn print_log_table(entries: &[ActionLogEntry]) {
    println!(
        "{:<8} {:<28} {:<20} {:<6} {:<22} recorded_at",
        "seq", "profile_id", "action_kind", "xp", "source"
    );
    println!("{}", "-".repeat(110));
    for entry in entries {
        println!(
            "{:<8} {:<28} {:<20} {:<6} {:<22} {}",
            entry.log_seq,
            entry.profile_id,
            entry.action_kind.as_str(),
            entry.xp_granted,
            entry.source.as_str(),
            entry.recorded_at
        );
    }
}

fn print_ledger_table(entries: &[LedgerEntry]) {
    println!(
        "{:<28} {:<18} {:<32} rewarded_at",
        "profile_id", "category", "external_id"
    );
    println!("{}", "-".repeat(100));
    for entry in entries {
        println!(
            "{:<28} {:<18} {:<32} {}",
            entry.key.profile_id,
            entry.key.category.as_str(),
            entry.key.external_id,
            entry.rewarded_at
        );
    }
}

fn print_audit_check(check: &AuditCheck) {
    println!("contract={}", check.contract_version);
    println!(
        "profiles_checked={} action_log_entries={} ledger_entries={}",
        check.profiles_checked, check.action_log_entries, check.ledger_entries
    );
    println!("healthy={}", yes_no(check.healthy));
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    AuditIssueSeverity::Warning => "warning",
                    AuditIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `xpl log list --profile-id <id>` for affected profiles");
    }
}
