//! Browser automation capability consumed by the login flow.
//!
//! The flow only talks to [`PageDriver`]; the Chrome implementation lives in
//! [`chrome`] behind the `browser` feature, and tests substitute scripted
//! fakes.

#[cfg(feature = "browser")]
pub mod chrome;

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::LoginError;
use crate::solver::{poll_until, PollError, PollSchedule, PollStep};

pub type BrowserResult<T> = Result<T, LoginError>;

const URL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One open page in a browser session.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate and wait until the document is interactive.
    async fn goto(&self, url: &str) -> BrowserResult<()>;

    async fn current_url(&self) -> BrowserResult<String>;

    /// Whether any element matches `selector`.
    async fn exists(&self, selector: &str) -> BrowserResult<bool>;

    /// Attribute of the first element matching `selector`.
    async fn attribute(&self, selector: &str, name: &str) -> BrowserResult<Option<String>>;

    /// Replace the value of the first element matching `selector`.
    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()>;

    async fn click(&self, selector: &str) -> BrowserResult<()>;

    /// Press Enter inside the first element matching `selector`.
    async fn press_enter(&self, selector: &str) -> BrowserResult<()>;

    /// Evaluate a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value>;

    /// Serialized markup of the current document.
    async fn content(&self) -> BrowserResult<String>;

    /// URLs of embedded frames, in document order.
    async fn frame_urls(&self) -> BrowserResult<Vec<String>>;

    /// All client-side storage entries, in storage index order.
    async fn storage_entries(&self) -> BrowserResult<Vec<(String, String)>>;

    /// Wait until the current location matches `pattern`. Returns `false` on timeout.
    async fn wait_for_url(&self, pattern: &UrlPattern, timeout: Duration) -> BrowserResult<bool> {
        if pattern.matches(&self.current_url().await?) {
            return Ok(true);
        }

        let schedule = PollSchedule::new(URL_POLL_INTERVAL, timeout);
        let never = tokio_util::sync::CancellationToken::new();
        let result = poll_until(schedule, &never, |_| async {
            match self.current_url().await {
                Ok(url) if pattern.matches(&url) => PollStep::Ready(()),
                Ok(_) => PollStep::Pending,
                Err(err) => PollStep::Failed(err),
            }
        })
        .await;

        match result {
            Ok(()) => Ok(true),
            Err(PollError::TimedOut { .. }) | Err(PollError::Cancelled) => Ok(false),
            Err(PollError::Failed(err)) => Err(err),
        }
    }

    /// End the session and release its resources.
    async fn close(&self) -> BrowserResult<()>;
}

/// Opens browser sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, headless: bool) -> BrowserResult<Box<dyn PageDriver>>;
}

/// Location pattern for "we are logged in".
///
/// Plain strings match as case-insensitive substrings; strings prefixed with
/// `re:` are regular expressions.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    Contains(String),
    Regex(Regex),
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self, regex::Error> {
        match pattern.strip_prefix("re:") {
            Some(re) => Ok(UrlPattern::Regex(Regex::new(re)?)),
            None => Ok(UrlPattern::Contains(pattern.to_lowercase())),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlPattern::Contains(needle) => url.to_lowercase().contains(needle),
            UrlPattern::Regex(re) => re.is_match(url),
        }
    }
}

impl std::fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlPattern::Contains(needle) => write!(f, "{needle}"),
            UrlPattern::Regex(re) => write!(f, "re:{}", re.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for UrlPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UrlPattern::parse(&s).map_err(serde::de::Error::custom)
    }
}
