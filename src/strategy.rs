//! Ordered fallback heuristics.
//!
//! A [`StrategyChain`] holds named entries in priority order and stops at the
//! first one that produces a value. Entry failures count as "no match", so a
//! flaky heuristic can't abort the chain.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::browser::{BrowserResult, PageDriver};
use crate::token::looks_like_token;

/// One heuristic in a chain.
#[async_trait]
pub trait Strategy: Send + Sync {
    type Output: Send;

    /// Short label used in logs.
    fn name(&self) -> String;

    async fn evaluate(&self, page: &dyn PageDriver) -> BrowserResult<Option<Self::Output>>;
}

/// The entry that won and what it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyMatch<T> {
    pub index: usize,
    pub name: String,
    pub value: T,
}

/// Heuristics evaluated in declared order, first match wins.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyChain<S> {
    entries: Vec<S>,
}

impl<S: Strategy> StrategyChain<S> {
    pub fn new(entries: Vec<S>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[S] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn first_match(&self, page: &dyn PageDriver) -> Option<StrategyMatch<S::Output>> {
        for (index, entry) in self.entries.iter().enumerate() {
            match entry.evaluate(page).await {
                Ok(Some(value)) => {
                    let name = entry.name();
                    debug!(strategy = %name, index, "Strategy matched");
                    return Some(StrategyMatch { index, name, value });
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(strategy = %entry.name(), error = %err, "Strategy errored, trying next");
                }
            }
        }
        None
    }
}

impl<S> From<Vec<S>> for StrategyChain<S> {
    fn from(entries: Vec<S>) -> Self {
        Self { entries }
    }
}

impl<'de, S: Deserialize<'de>> Deserialize<'de> for StrategyChain<S> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            entries: Vec::deserialize(deserializer)?,
        })
    }
}

impl<S: Serialize> Serialize for StrategyChain<S> {
    fn serialize<Ser: serde::Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        self.entries.serialize(serializer)
    }
}

/// Locates a form field by CSS selector. Produces the selector that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldStrategy(pub String);

impl FieldStrategy {
    pub fn chain<I, T>(selectors: I) -> StrategyChain<FieldStrategy>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        StrategyChain::new(selectors.into_iter().map(|s| FieldStrategy(s.into())).collect())
    }
}

#[async_trait]
impl Strategy for FieldStrategy {
    type Output = String;

    fn name(&self) -> String {
        format!("selector {}", self.0)
    }

    async fn evaluate(&self, page: &dyn PageDriver) -> BrowserResult<Option<String>> {
        Ok(page.exists(&self.0).await?.then(|| self.0.clone()))
    }
}

/// A regex read from configuration.
#[derive(Debug, Clone)]
pub struct Pattern(pub Regex);

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Regex::new(&s).map(Pattern).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

/// Ways to discover a challenge widget's site key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteKeyStrategy {
    /// Attribute of the first element matching `selector`.
    Attribute { selector: String, attribute: String },
    /// Query parameter of an embedded frame whose URL contains `host`.
    FrameUrl { host: String, param: String },
    /// First capture group of `pattern` over the page markup.
    Markup { pattern: Pattern },
    /// A known key, used as a last resort.
    Constant { value: String },
}

impl SiteKeyStrategy {
    /// Built-in chain for Turnstile / reCAPTCHA style widgets.
    pub fn default_chain() -> StrategyChain<SiteKeyStrategy> {
        let mut entries = vec![
            SiteKeyStrategy::Attribute {
                selector: "[data-sitekey]".to_string(),
                attribute: "data-sitekey".to_string(),
            },
            SiteKeyStrategy::FrameUrl {
                host: "challenges.cloudflare.com".to_string(),
                param: "sitekey".to_string(),
            },
        ];
        entries.extend(
            [
                r#"(?i)data-sitekey=["']([0-9a-zA-Z_-]+)["']"#,
                r#"(?i)sitekey["\s:=]+["']([0-9a-zA-Z_-]+)["']"#,
            ]
            .into_iter()
            .filter_map(|re| Regex::new(re).ok())
            .map(|re| SiteKeyStrategy::Markup { pattern: Pattern(re) }),
        );
        StrategyChain::new(entries)
    }
}

#[async_trait]
impl Strategy for SiteKeyStrategy {
    type Output = String;

    fn name(&self) -> String {
        match self {
            SiteKeyStrategy::Attribute { selector, attribute } => {
                format!("attribute {attribute} of {selector}")
            }
            SiteKeyStrategy::FrameUrl { host, param } => format!("frame {host} param {param}"),
            SiteKeyStrategy::Markup { pattern } => format!("markup /{}/", pattern.0.as_str()),
            SiteKeyStrategy::Constant { .. } => "constant".to_string(),
        }
    }

    async fn evaluate(&self, page: &dyn PageDriver) -> BrowserResult<Option<String>> {
        let found = match self {
            SiteKeyStrategy::Attribute { selector, attribute } => {
                page.attribute(selector, attribute).await?
            }
            SiteKeyStrategy::FrameUrl { host, param } => page
                .frame_urls()
                .await?
                .iter()
                .filter(|url| url.contains(host.as_str()))
                .find_map(|url| query_param(url, param)),
            SiteKeyStrategy::Markup { pattern } => {
                let html = page.content().await?;
                pattern
                    .0
                    .captures(&html)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            }
            SiteKeyStrategy::Constant { value } => Some(value.clone()),
        };
        Ok(found.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
    }
}

/// Value of `name` in the query string or fragment of `url`.
fn query_param(url: &str, name: &str) -> Option<String> {
    let start = url.find(['?', '#'])?;
    url[start + 1..]
        .split(['&', '#', '?'])
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Where in storage a token was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHit {
    pub key: String,
    /// Field name when the token sat inside a JSON object stored under `key`.
    pub field: Option<String>,
    pub token: String,
}

impl TokenHit {
    pub fn location(&self) -> String {
        match &self.field {
            Some(field) => format!("{}.{}", self.key, field),
            None => self.key.clone(),
        }
    }
}

fn default_prefix() -> String {
    "eyJ".to_string()
}

fn default_min_length() -> usize {
    50
}

fn default_candidate_keys() -> Vec<String> {
    [
        "token",
        "accessToken",
        "access_token",
        "authToken",
        "auth_token",
        "jwt",
        "jwtToken",
        "user_token",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Prioritized but exhaustive scan of client-side storage for a token.
///
/// Known key names are tried first, in order; after that every other entry
/// is tried in key order. Each entry matches either directly or through one
/// level of JSON object nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenScan {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_candidate_keys")]
    pub candidate_keys: Vec<String>,
}

impl Default for TokenScan {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            min_length: default_min_length(),
            candidate_keys: default_candidate_keys(),
        }
    }
}

impl TokenScan {
    pub fn find(&self, entries: &[(String, String)]) -> Option<TokenHit> {
        for candidate in &self.candidate_keys {
            if let Some((key, value)) = entries.iter().find(|(k, _)| k == candidate) {
                if let Some(hit) = self.match_entry(key, value) {
                    return Some(hit);
                }
            }
        }

        let mut rest: Vec<&(String, String)> = entries
            .iter()
            .filter(|(k, _)| !self.candidate_keys.contains(k))
            .collect();
        rest.sort_by(|a, b| a.0.cmp(&b.0));
        rest.into_iter().find_map(|(k, v)| self.match_entry(k, v))
    }

    fn is_token(&self, value: &str) -> bool {
        looks_like_token(value, &self.prefix, self.min_length)
    }

    fn match_entry(&self, key: &str, value: &str) -> Option<TokenHit> {
        if self.is_token(value) {
            return Some(TokenHit {
                key: key.to_string(),
                field: None,
                token: value.trim().trim_matches('"').to_string(),
            });
        }

        if !value.trim_start().starts_with('{') {
            return None;
        }
        let serde_json::Value::Object(map) = serde_json::from_str::<serde_json::Value>(value).ok()? else {
            return None;
        };

        let field_value = |field: &str| map.get(field).and_then(|v| v.as_str());

        let known = self
            .candidate_keys
            .iter()
            .filter_map(|field| field_value(field).map(|v| (field.as_str(), v)));
        // serde_json's default map iterates in key order.
        let others = map
            .iter()
            .filter(|(field, _)| !self.candidate_keys.contains(*field))
            .filter_map(|(field, v)| v.as_str().map(|s| (field.as_str(), s)));

        known
            .chain(others)
            .find(|(_, v)| self.is_token(v))
            .map(|(field, v)| TokenHit {
                key: key.to_string(),
                field: Some(field.to_string()),
                token: v.trim().trim_matches('"').to_string(),
            })
    }
}
