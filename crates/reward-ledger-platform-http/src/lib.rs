#![forbid(unsafe_code)]

//! Blocking HTTP client for the external activity listing API.

use std::time::Duration;

use anyhow::{anyhow, Result};
use reward_ledger_core::{
    format_rfc3339, ActivityCategory, ActivityFetchError, ActivityFilter, ActivitySource,
    ExternalActivity,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpPlatformConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl HttpPlatformConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            auth_bearer_env: None,
        }
    }

    /// # Errors
    /// Returns an error when the payload does not decode or `base_url` is
    /// not an http(s) URL.
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| anyhow!("invalid platform config JSON payload: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when `base_url` is not an http(s) URL or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(anyhow!(
                "platform base_url must start with http:// or https://, got '{}'",
                self.base_url
            ));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("platform timeout_ms must be >= 1"));
        }
        Ok(())
    }
}

pub struct HttpActivitySource {
    base_url: String,
    auth_bearer_token: Option<String>,
    agent: ureq::Agent,
}

impl HttpActivitySource {
    /// # Errors
    /// Returns an error when the config is invalid or the token variable is unset.
    pub fn new(config: &HttpPlatformConfig) -> Result<Self> {
        config.validate()?;
        let auth_bearer_token = match &config.auth_bearer_env {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by auth_bearer_env")
            })?),
            None => None,
        };

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_bearer_token,
            agent,
        })
    }

    fn listing_url(&self, category: ActivityCategory) -> Option<String> {
        let path = match category {
            ActivityCategory::ChatMessage => "chat/messages",
            ActivityCategory::ForumPost => "forums/posts",
            ActivityCategory::LessonCompletion => "courses/lesson_interactions",
            ActivityCategory::Renewal => return None,
        };
        Some(format!("{}/{path}", self.base_url))
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    data: Vec<ListingItem>,
}

#[derive(Debug, Deserialize)]
struct ListingItem {
    id: String,
    user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(default)]
    completed: Option<bool>,
}

impl ActivitySource for HttpActivitySource {
    fn list_activity(
        &self,
        category: ActivityCategory,
        filter: &ActivityFilter,
        page_size: usize,
    ) -> Result<Vec<ExternalActivity>, ActivityFetchError> {
        let Some(url) = self.listing_url(category) else {
            return Err(ActivityFetchError::Scope(format!(
                "{} cannot be listed from the platform",
                category.as_str()
            )));
        };
        let created_after = format_rfc3339(filter.since)
            .map_err(|err| ActivityFetchError::Transport(err.to_string()))?;

        let mut request = self
            .agent
            .get(&url)
            .query("user_id", &filter.external_user_id)
            .query("created_after", &created_after)
            .query("per", &page_size.to_string())
            .set("accept", "application/json");
        if let Some(token) = &self.auth_bearer_token {
            request = request.set("authorization", &format!("Bearer {token}"));
        }

        let body = match request.call() {
            Ok(response) => response
                .into_string()
                .map_err(|err| ActivityFetchError::Transport(err.to_string()))?,
            Err(ureq::Error::Status(code @ (401 | 403), response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(ActivityFetchError::Scope(if detail.trim().is_empty() {
                    format!("http status {code}")
                } else {
                    format!("http status {code}: {}", detail.trim())
                }));
            }
            Err(ureq::Error::Status(code, response)) => {
                return Err(ActivityFetchError::Status {
                    status: code,
                    message: response.into_string().unwrap_or_default(),
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(ActivityFetchError::Transport(err.to_string()));
            }
        };

        let page: ListingPage = serde_json::from_str(&body)
            .map_err(|err| ActivityFetchError::Decode(err.to_string()))?;
        debug!(
            category = category.as_str(),
            items = page.data.len(),
            "activity page fetched"
        );

        Ok(page
            .data
            .into_iter()
            .take(page_size)
            .map(|item| ExternalActivity {
                external_id: item.id,
                external_user_id: item.user_id,
                created_at: item.created_at,
                completed: item.completed,
            })
            .collect())
    }
}
