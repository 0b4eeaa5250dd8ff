use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use reward_ledger_cli::LedgerSettings;
use reward_ledger_core::{
    apply_tier_update, is_eligible, now_utc, ActionKind, ActivityCategory, ActivitySource,
    BillingDisposition,
    BillingEvent, CommunityId, FeatureKind, ProfileId, ReconcileReport, Reconciler,
    RecordOutcome, RewardError, RewardStore, Source, StaticActivitySource,
    SubscriptionEventHandler, TierUpdateCommand, TierUpdateSink,
};
use reward_ledger_platform_http::HttpActivitySource;
use reward_ledger_store_sqlite::SqliteRewardStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const TIER_UPDATE_ATTEMPTS: u32 = 3;
const TIER_UPDATE_BACKOFF: Duration = Duration::from_millis(50);

/// Blocking handle on the ledger; every call opens its own connection.
#[derive(Clone)]
struct RewardApi {
    db_path: PathBuf,
    settings: Arc<LedgerSettings>,
    source: Arc<dyn ActivitySource + Send + Sync>,
}

impl RewardApi {
    fn open(&self) -> Result<SqliteRewardStore> {
        SqliteRewardStore::open(&self.db_path)
    }

    fn migrate(&self) -> Result<()> {
        self.open()?.migrate()
    }

    fn reconcile(&self, profile_id: ProfileId, now: OffsetDateTime) -> Result<ReconcileReport> {
        let store = self.open()?;
        let report = Reconciler::new(&store, self.source.as_ref(), &self.settings.reward)
            .reconcile(profile_id, now)?;
        Ok(report)
    }

    fn record_action(
        &self,
        request: &RecordActionRequest,
        now: OffsetDateTime,
    ) -> Result<RecordOutcome> {
        let store = self.open()?;
        let outcome = reward_ledger_core::record_eligible_action(
            &store,
            request.profile_id,
            request.action_kind,
            request.source,
            now,
        )?;
        Ok(outcome)
    }

    fn handle_billing_event(
        &self,
        event: &BillingEvent,
        sink: &TierQueue,
        now: OffsetDateTime,
    ) -> Result<BillingDisposition> {
        let store = self.open()?;
        let disposition =
            SubscriptionEventHandler::new(&store, sink, &self.settings.reward).handle(event, now)?;
        Ok(disposition)
    }

    fn eligibility(
        &self,
        community_id: CommunityId,
        feature: FeatureKind,
        now: OffsetDateTime,
    ) -> Result<EligibilityResponse> {
        let store = self.open()?;
        let community = store
            .get_community(community_id)?
            .ok_or_else(|| RewardError::IdentityNotFound(format!("community {community_id}")))?;
        Ok(EligibilityResponse {
            community_id,
            feature,
            tier: community.tier.clone(),
            eligible: is_eligible(&community, feature, now),
        })
    }

    fn apply_tier_update(&self, command: &TierUpdateCommand) -> Result<()> {
        let store = self.open()?;
        apply_tier_update(&store, command)?;
        Ok(())
    }
}

/// Hands tier updates to the background worker.
#[derive(Clone)]
struct TierQueue {
    tx: mpsc::UnboundedSender<TierUpdateCommand>,
}

impl TierUpdateSink for TierQueue {
    fn enqueue(&self, command: TierUpdateCommand) -> Result<(), RewardError> {
        self.tx.send(command).map_err(|_| {
            RewardError::Configuration("tier update worker is not running".to_string())
        })
    }
}

#[derive(Clone)]
struct ServiceState {
    api: RewardApi,
    tier_queue: TierQueue,
    operation_timeout: Duration,
    /// Covers every sequential platform call of one sweep.
    reconcile_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

/// Timestamps are always taken from the server clock.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReconcileRequest {
    profile_id: ProfileId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordActionRequest {
    profile_id: ProfileId,
    action_kind: ActionKind,
    #[serde(default = "default_source")]
    source: Source,
}

fn default_source() -> Source {
    Source::Manual
}

#[derive(Debug, Clone, Serialize)]
struct EligibilityResponse {
    community_id: CommunityId,
    feature: FeatureKind,
    tier: String,
    eligible: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    reconcile_timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    tier_updates_applied_total: AtomicU64,
    tier_updates_failed_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    tier_updates_applied_total: u64,
    tier_updates_failed_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "reward-ledger-service")]
#[command(about = "HTTP service for the XP reward ledger")]
struct Args {
    #[arg(long, default_value = "./reward_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Defaults to the platform budget plus `operation_timeout_ms`.
    #[arg(long)]
    reconcile_timeout_ms: Option<u64>,
    /// JSON settings file shared with `xpl --config`.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn validation_error_with_telemetry(&self, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = format!("{err:#}");

        if let Some(reward_error) = err.downcast_ref::<RewardError>() {
            return match reward_error {
                RewardError::Validation(_) => {
                    Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
                }
                RewardError::IdentityNotFound(_) => {
                    Self::failure(StatusCode::NOT_FOUND, "not_found", message, None)
                }
                RewardError::Storage(_) => Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage_unavailable",
                    message,
                    None,
                ),
                RewardError::Configuration(_) => Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    message,
                    None,
                ),
            };
        }

        let normalized = message.to_ascii_lowercase();
        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(RewardApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_blocking_within(
            self.operation_timeout,
            default_status,
            default_code,
            operation_label,
            op,
        )
        .await
    }

    async fn run_blocking_within<T, F>(
        &self,
        timeout: Duration,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(RewardApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!("{operation_label} timed out after {} ms", timeout.as_millis()),
                    Some(json!({ "timeout_ms": timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "storage_unavailable" => &self.storage_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            tier_updates_applied_total: self.tier_updates_applied_total.load(Ordering::Relaxed),
            tier_updates_failed_total: self.tier_updates_failed_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

/// Applies queued tier updates, retrying each one a bounded number of times.
fn spawn_tier_worker(
    api: RewardApi,
    telemetry: Arc<ServiceTelemetry>,
    mut rx: mpsc::UnboundedReceiver<TierUpdateCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            apply_with_retry(&api, &telemetry, command).await;
        }
        info!("tier update worker stopped");
    })
}

async fn apply_with_retry(api: &RewardApi, telemetry: &ServiceTelemetry, command: TierUpdateCommand) {
    for attempt in 1..=TIER_UPDATE_ATTEMPTS {
        let worker_api = api.clone();
        let outcome =
            tokio::task::spawn_blocking(move || worker_api.apply_tier_update(&command)).await;
        match outcome {
            Ok(Ok(())) => {
                telemetry
                    .tier_updates_applied_total
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(err)) => warn!(
                community_id = %command.community_id,
                attempt,
                error = %format!("{err:#}"),
                "tier update attempt failed"
            ),
            Err(err) => warn!(
                community_id = %command.community_id,
                attempt,
                error = %err,
                "tier update attempt panicked"
            ),
        }
        if attempt < TIER_UPDATE_ATTEMPTS {
            tokio::time::sleep(TIER_UPDATE_BACKOFF * attempt).await;
        }
    }

    telemetry
        .tier_updates_failed_total
        .fetch_add(1, Ordering::Relaxed);
    error!(
        community_id = %command.community_id,
        attempts = TIER_UPDATE_ATTEMPTS,
        "tier update abandoned"
    );
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/actions/record", post(record_action))
        .route("/v1/billing/events", post(billing_event))
        .route("/v1/eligibility/:community_id/:feature", get(eligibility))
        .with_state(state)
}

/// Worst-case time spent in platform calls by one sweep; categories are
/// listed one after another, each bounded by the platform timeout.
fn platform_budget(settings: &LedgerSettings) -> Duration {
    settings.platform.as_ref().map_or(Duration::ZERO, |platform| {
        let calls = u32::try_from(ActivityCategory::SYNCED.len()).unwrap_or(u32::MAX);
        Duration::from_millis(platform.timeout_ms).saturating_mul(calls)
    })
}

/// Picks the reconcile deadline. An explicit value must leave room for every
/// platform call, otherwise a slow category would surface as a failed request
/// while the sweep keeps running in the background.
fn reconcile_timeout(
    settings: &LedgerSettings,
    operation_timeout: Duration,
    requested_ms: Option<u64>,
) -> Result<Duration> {
    let budget = platform_budget(settings);
    match requested_ms {
        Some(ms) => {
            let timeout = Duration::from_millis(ms);
            if timeout <= budget {
                return Err(anyhow!(
                    "reconcile_timeout_ms ({ms}) must exceed the platform budget of {} ms",
                    budget.as_millis()
                ));
            }
            Ok(timeout)
        }
        None => Ok(budget.saturating_add(operation_timeout)),
    }
}

fn activity_source(settings: &LedgerSettings) -> Result<Arc<dyn ActivitySource + Send + Sync>> {
    match &settings.platform {
        Some(platform) => Ok(Arc::new(HttpActivitySource::new(platform)?)),
        None => {
            warn!("no platform configured; reconciliation will see no external activity");
            Ok(Arc::new(StaticActivitySource::default()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = LedgerSettings::load(args.config.as_deref())?;
    let operation_timeout = Duration::from_millis(args.operation_timeout_ms);
    let reconcile_timeout =
        reconcile_timeout(&settings, operation_timeout, args.reconcile_timeout_ms)?;
    let api = RewardApi {
        db_path: args.db,
        source: activity_source(&settings)?,
        settings: Arc::new(settings),
    };
    api.migrate()
        .map_err(|err| anyhow!("failed to migrate reward ledger database: {err:#}"))?;

    let telemetry = Arc::new(ServiceTelemetry::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let _worker = spawn_tier_worker(api.clone(), Arc::clone(&telemetry), rx);

    let state = ServiceState {
        api,
        tier_queue: TierQueue { tx },
        operation_timeout,
        reconcile_timeout,
        telemetry,
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        bind = %args.bind,
        reconcile_timeout_ms = %reconcile_timeout.as_millis(),
        "reward ledger service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    let reconcile_timeout_ms =
        u64::try_from(state.reconcile_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        reconcile_timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn reconcile(
    State(state): State<ServiceState>,
    payload: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ReconcileReport>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking_within(
            state.reconcile_timeout,
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "reconcile",
            move |api| api.reconcile(request.profile_id, now_utc()),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn record_action(
    State(state): State<ServiceState>,
    payload: Result<Json<RecordActionRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RecordOutcome>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let outcome = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "record_action",
            move |api| api.record_action(&request, now_utc()),
        )
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn billing_event(
    State(state): State<ServiceState>,
    payload: Result<Json<BillingEvent>, JsonRejection>,
) -> Result<StatusCode, ServiceFailure> {
    let Json(event) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let sink = state.tier_queue.clone();
    let disposition = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "billing_event",
            move |api| api.handle_billing_event(&event, &sink, now_utc()),
        )
        .await?;
    info!(?disposition, "billing event acknowledged");
    Ok(StatusCode::NO_CONTENT)
}

async fn eligibility(
    State(state): State<ServiceState>,
    Path((community_id, feature)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<EligibilityResponse>>, ServiceFailure> {
    let community_id = community_id
        .parse::<CommunityId>()
        .map_err(|err| state.validation_error_with_telemetry(err.to_string()))?;
    let feature = FeatureKind::parse(&feature).ok_or_else(|| {
        state.validation_error_with_telemetry(format!("unknown feature `{feature}`"))
    })?;
    let response = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "eligibility",
            move |api| api.eligibility(community_id, feature, now_utc()),
        )
        .await?;
    Ok(Json(envelope(response)))
}
