//! 2Captcha-compatible solving service client.
//!
//! Speaks the classic `in.php` / `res.php` protocol with `json=1`:
//! every response is `{"status": 0|1, "request": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::poll::{poll_until, PollError, PollSchedule, PollStep};
use super::{ChallengeSolver, ChallengeTask};
use crate::error::SolveError;

const TWOCAPTCHA_BASE_URL: &str = "https://2captcha.com";
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Tunables for [`TwoCaptchaClient`].
#[derive(Debug, Clone)]
pub struct TwoCaptchaConfig {
    /// Challenge type sent as `method` (e.g. "turnstile", "userrecaptcha").
    pub method: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for TwoCaptchaConfig {
    fn default() -> Self {
        Self {
            method: "turnstile".to_string(),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    status: i64,
    #[serde(default)]
    request: serde_json::Value,
}

impl ServiceResponse {
    /// `request` as text; some deployments send balances as JSON numbers.
    fn request_text(&self) -> String {
        match &self.request {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Client for a 2Captcha-compatible solving service.
#[derive(Clone)]
pub struct TwoCaptchaClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    config: TwoCaptchaConfig,
}

impl std::fmt::Debug for TwoCaptchaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoCaptchaClient")
            .field("base_url", &self.base_url)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TwoCaptchaClient {
    /// Creates a client whose requests time out after `config.request_timeout`.
    pub fn new(api_key: SecretString, config: TwoCaptchaConfig) -> Result<Self, SolveError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self::with_client(client, api_key, config))
    }

    /// Creates a client with a custom HTTP client.
    pub fn with_client(client: Client, api_key: SecretString, config: TwoCaptchaConfig) -> Self {
        Self {
            client,
            api_key,
            base_url: TWOCAPTCHA_BASE_URL.to_string(),
            config,
        }
    }

    /// Point the client at a different service host (self-hosted mirrors, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn config(&self) -> &TwoCaptchaConfig {
        &self.config
    }

    /// Submit a challenge. One request, no retry.
    pub async fn submit(&self, site_key: &str, page_url: &str) -> Result<ChallengeTask, SolveError> {
        let url = format!("{}/in.php", self.base_url);
        let form = [
            ("key", self.api_key.expose_secret()),
            ("method", self.config.method.as_str()),
            ("sitekey", site_key),
            ("pageurl", page_url),
            ("json", "1"),
        ];

        let response = self.client.post(&url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SolveError::SubmitFailed(format!("HTTP {status}: {body}")));
        }

        let body = response.text().await?;
        let parsed: ServiceResponse = serde_json::from_str(&body)
            .map_err(|e| SolveError::SubmitFailed(format!("malformed response ({e}): {body}")))?;

        let request = parsed.request_text();
        if parsed.status != 1 || request.is_empty() {
            return Err(SolveError::SubmitFailed(request));
        }

        info!(task_id = %request, method = %self.config.method, "Challenge submitted");
        Ok(ChallengeTask {
            task_id: request,
            site_key: site_key.to_string(),
            page_url: page_url.to_string(),
            submitted_at: Utc::now(),
        })
    }

    /// One status check for a submitted task.
    ///
    /// Transport hiccups and unparseable bodies count as "still processing";
    /// the surrounding deadline bounds how long that can go on.
    pub async fn check(&self, task: &ChallengeTask) -> PollStep<String, SolveError> {
        let url = format!("{}/res.php", self.base_url);
        let query = [
            ("key", self.api_key.expose_secret()),
            ("action", "get"),
            ("id", task.task_id.as_str()),
            ("json", "1"),
        ];

        let response = match self.client.get(&url).query(&query).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(task_id = %task.task_id, error = %err, "Status check failed, will retry");
                return PollStep::Pending;
            }
        };

        let parsed = match response.json::<ServiceResponse>().await {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(task_id = %task.task_id, error = %err, "Unreadable status response, will retry");
                return PollStep::Pending;
            }
        };

        let request = parsed.request_text();
        if parsed.status == 1 {
            PollStep::Ready(request)
        } else if request == NOT_READY {
            PollStep::Pending
        } else {
            PollStep::Failed(SolveError::SolveFailed(request))
        }
    }

    /// Poll a submitted task until solved, failed, timed out or cancelled.
    pub async fn wait(
        &self,
        task: &ChallengeTask,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, SolveError> {
        let schedule = PollSchedule::new(self.config.poll_interval, timeout);
        let result = poll_until(schedule, cancel, |attempt| {
            debug!(task_id = %task.task_id, attempt, "Checking challenge status");
            self.check(task)
        })
        .await;

        match result {
            Ok(value) => {
                let took = Utc::now() - task.submitted_at;
                info!(task_id = %task.task_id, elapsed_secs = took.num_seconds(), "Challenge solved");
                Ok(value)
            }
            Err(PollError::Failed(err)) => {
                warn!(task_id = %task.task_id, error = %err, "Challenge solve failed");
                Err(err)
            }
            Err(PollError::TimedOut { elapsed, attempts }) => {
                warn!(task_id = %task.task_id, attempts, elapsed_secs = elapsed.as_secs(), "Challenge solve timed out");
                Err(SolveError::TimedOut { elapsed })
            }
            Err(PollError::Cancelled) => Err(SolveError::Cancelled),
        }
    }
}

#[async_trait]
impl ChallengeSolver for TwoCaptchaClient {
    async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, SolveError> {
        let task = self.submit(site_key, page_url).await?;
        self.wait(&task, timeout, cancel).await
    }

    async fn balance(&self) -> Result<Decimal, SolveError> {
        let url = format!("{}/res.php", self.base_url);
        let query = [
            ("key", self.api_key.expose_secret()),
            ("action", "getbalance"),
            ("json", "1"),
        ];

        let parsed = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json::<ServiceResponse>()
            .await?;

        let request = parsed.request_text();
        if parsed.status != 1 {
            return Err(SolveError::Rejected(request));
        }

        request
            .trim()
            .parse::<Decimal>()
            .map_err(|e| SolveError::Rejected(format!("unparseable balance '{request}': {e}")))
    }
}
