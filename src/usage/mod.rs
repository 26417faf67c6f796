//! Client for the account usage endpoint. The executor consults it before
//! every firing; the answer is cached briefly so bursts of firings do not
//! hammer the upstream service.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::version;

const USAGE_API_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const USAGE_BETA_HEADER: &str = "oauth-2025-04-20";
const CACHE_TTL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One usage window as reported upstream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageBucket {
    pub utilization: f64,
    pub resets_at: String,
}

/// The five-hour and seven-day windows together.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageSnapshot {
    pub five_hour: UsageBucket,
    pub seven_day: UsageBucket,
}

impl UsageSnapshot {
    pub fn max_utilization(&self) -> f64 {
        self.five_hour.utilization.max(self.seven_day.utilization)
    }

    /// Time until the five-hour window resets; zero when unparsable or past.
    pub fn time_until_reset(&self) -> Duration {
        let Ok(resets_at) = DateTime::parse_from_rfc3339(&self.five_hour.resets_at) else {
            return Duration::ZERO;
        };
        (resets_at.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn format_time_until_reset(&self) -> String {
        let remaining = self.time_until_reset();
        let hours = remaining.as_secs() / 3600;
        let minutes = (remaining.as_secs() % 3600) / 60;
        match (hours, minutes) {
            (0, 0) => "now".to_string(),
            (0, m) => format!("{m}m"),
            (h, 0) => format!("{h}h"),
            (h, m) => format!("{h}h{m}m"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: OAuthCredentials,
}

#[derive(Debug, Deserialize)]
struct OAuthCredentials {
    #[serde(rename = "accessToken", default)]
    access_token: String,
}

/// Usage API client holding the OAuth token and a short-lived cache.
pub struct UsageClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    cache: RwLock<Option<(Instant, UsageSnapshot)>>,
    cache_ttl: Duration,
}

impl UsageClient {
    /// Reads the OAuth access token from the Claude CLI credentials file.
    pub fn new() -> Result<Self> {
        let token = read_credentials()?;
        Ok(Self::with_base_url(token, USAGE_API_URL.to_string()))
    }

    /// Client against an explicit endpoint; used by tests to point at a
    /// local mock server.
    pub fn with_base_url(token: String, base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(version::user_agent())
            .build()
            .unwrap_or_default();
        Self {
            http,
            token,
            base_url,
            cache: RwLock::new(None),
            cache_ttl: CACHE_TTL,
        }
    }

    /// Fetches current usage, serving from cache within the TTL. Concurrent
    /// callers coalesce onto one upstream request via the double-checked
    /// write lock.
    pub async fn fetch(&self) -> Result<UsageSnapshot> {
        {
            let cache = self.cache.read().await;
            if let Some((at, snapshot)) = cache.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some((at, snapshot)) = cache.as_ref() {
            if at.elapsed() < self.cache_ttl {
                return Ok(snapshot.clone());
            }
        }

        let response = self
            .http
            .get(&self.base_url)
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("anthropic-beta", USAGE_BETA_HEADER)
            .send()
            .await
            .context("failed to fetch usage")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            anyhow::bail!("usage API returned status {status}: {excerpt}");
        }

        let snapshot: UsageSnapshot = response
            .json()
            .await
            .context("failed to parse usage response")?;

        *cache = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    /// Returns whether both windows sit strictly below `threshold` (a
    /// percentage); sitting exactly at the threshold is not permitted.
    pub async fn check_threshold(&self, threshold: f64) -> Result<(bool, UsageSnapshot)> {
        let snapshot = self.fetch().await?;
        let below = snapshot.five_hour.utilization < threshold
            && snapshot.seven_day.utilization < threshold;
        Ok((below, snapshot))
    }
}

pub fn credentials_path() -> Result<PathBuf> {
    let user_dirs = UserDirs::new().context("could not determine home directory")?;
    Ok(user_dirs.home_dir().join(".claude").join(".credentials.json"))
}

fn read_credentials() -> Result<String> {
    let path = credentials_path()?;
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("credentials not found at {}", path.display()))?;

    let creds: Credentials =
        serde_json::from_str(&data).context("failed to parse credentials")?;

    anyhow::ensure!(
        !creds.claude_ai_oauth.access_token.is_empty(),
        "no access token found in credentials"
    );
    Ok(creds.claude_ai_oauth.access_token)
}
