//! Token lifecycle: serve the cached token while it is fresh, renew it
//! through an [`Authenticator`] when it is not.
//!
//! At most one renewal runs at a time. Callers that arrive during a renewal
//! wait for it and then get its result instead of starting another login.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, TokenCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::duration::format_duration;
use crate::error::AuthError;
use crate::login::{Authenticator, LoginMode};
use crate::solver::ChallengeSolver;
use crate::token::TokenRecord;

/// Renewal policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// A token counts as valid only while its expiry is more than this far away.
    pub renewal_margin: Duration,
    /// Lifetime assumed for tokens whose expiry can't be decoded.
    pub fallback_lifetime: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            renewal_margin: Duration::from_secs(10 * 60),
            fallback_lifetime: Duration::from_secs(5 * 60 * 60),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            renewal_margin: config.renewal_margin,
            fallback_lifetime: config.fallback_lifetime,
        }
    }
}

/// Snapshot of the current token, safe to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub preview: String,
    pub expiry: DateTime<Utc>,
    pub expiry_assumed: bool,
    pub updated: DateTime<Utc>,
    pub remaining: Duration,
    /// Outside the renewal margin.
    pub valid: bool,
    /// False when the token was acquired but writing the cache file failed,
    /// so other processes and the next run won't see it.
    pub persisted: bool,
}

pub struct TokenManager {
    settings: ManagerSettings,
    cache: TokenCache,
    clock: Arc<dyn Clock>,
    authenticator: Option<Arc<dyn Authenticator>>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    current: Mutex<Option<TokenRecord>>,
    // Whether `current` matches the cache file. Only changed under `current`'s lock.
    persisted: AtomicBool,
    cancel: CancellationToken,
}

impl TokenManager {
    /// Create a manager seeded from `cache`. An unreadable cache counts as empty.
    pub fn new(cache: TokenCache, settings: ManagerSettings) -> Self {
        let current = load_cached(&cache);
        Self {
            settings,
            cache,
            clock: Arc::new(SystemClock),
            authenticator: None,
            solver: None,
            current: Mutex::new(current),
            persisted: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Without an authenticator the manager can only serve cached tokens.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Cancelling this token aborts any login in progress, e.g. from a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A valid token, logging in first if the cached one is missing or inside
    /// the renewal margin.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        let mut current = self.current.lock().await;
        let now = self.clock.now();

        if let Some(record) = fresh(&current, now, self.settings.renewal_margin) {
            debug!(
                remaining = %format_duration(record.remaining(now)),
                "Using cached token"
            );
            return Ok(record.token.clone());
        }

        self.renew(&mut current, LoginMode::Automated, false).await
    }

    /// Log in unless a valid token is already held. `force` logs in regardless.
    pub async fn login(&self, force: bool) -> Result<String, AuthError> {
        self.login_with(LoginMode::Automated, force).await
    }

    pub async fn login_with(&self, mode: LoginMode, force: bool) -> Result<String, AuthError> {
        let mut current = self.current.lock().await;

        if !force {
            if let Some(record) = fresh(&current, self.clock.now(), self.settings.renewal_margin) {
                info!(token = %record.preview(), "Token still valid, skipping login");
                return Ok(record.token.clone());
            }
        }

        self.renew(&mut current, mode, force).await
    }

    pub async fn is_token_valid(&self) -> bool {
        let current = self.current.lock().await;
        fresh(&current, self.clock.now(), self.settings.renewal_margin).is_some()
    }

    /// Forget the token in memory and on disk.
    pub async fn clear_cache(&self) -> Result<(), AuthError> {
        let mut current = self.current.lock().await;
        self.cache.clear()?;
        *current = None;
        self.persisted.store(true, Ordering::SeqCst);
        info!(path = %self.cache.path().display(), "Token cache cleared");
        Ok(())
    }

    /// Remaining credit at the challenge-solving service.
    pub async fn get_balance(&self) -> Result<Decimal, AuthError> {
        let solver = self.solver.as_ref().ok_or(AuthError::SolverUnavailable)?;
        Ok(solver.balance().await?)
    }

    /// Adopt a token obtained elsewhere. It must be valid past the renewal margin.
    pub async fn import_token(&self, token: &str) -> Result<TokenStatus, AuthError> {
        let mut current = self.current.lock().await;
        let now = self.clock.now();

        let record = TokenRecord::issue(token.trim(), now, self.settings.fallback_lifetime)?;
        if !record.is_fresh(now, self.settings.renewal_margin) {
            return Err(AuthError::ExpiredToken {
                expiry: record.expiry,
            });
        }

        self.cache.store(&CacheEntry::from_record(&record, now))?;
        self.persisted.store(true, Ordering::SeqCst);
        info!(token = %record.preview(), expiry = %record.expiry, "Token imported");
        let status = self.describe(&record, now);
        *current = Some(record);
        Ok(status)
    }

    /// Describe the held token, if any.
    pub async fn status(&self) -> Option<TokenStatus> {
        let current = self.current.lock().await;
        current
            .as_ref()
            .map(|record| self.describe(record, self.clock.now()))
    }

    fn describe(&self, record: &TokenRecord, now: DateTime<Utc>) -> TokenStatus {
        TokenStatus {
            preview: record.preview(),
            expiry: record.expiry,
            expiry_assumed: record.expiry_assumed,
            updated: record.acquired_at,
            remaining: record.remaining(now),
            valid: record.is_fresh(now, self.settings.renewal_margin),
            persisted: self.persisted.load(Ordering::SeqCst),
        }
    }

    /// Obtain a new token while holding the state lock.
    async fn renew(
        &self,
        current: &mut Option<TokenRecord>,
        mode: LoginMode,
        force: bool,
    ) -> Result<String, AuthError> {
        // Another process sharing the cache file may have renewed already.
        if !force {
            if let Some(record) = load_cached(&self.cache) {
                if record.is_fresh(self.clock.now(), self.settings.renewal_margin) {
                    info!(token = %record.preview(), "Picked up token renewed by another process");
                    let token = record.token.clone();
                    *current = Some(record);
                    self.persisted.store(true, Ordering::SeqCst);
                    return Ok(token);
                }
            }
        }

        let Some(authenticator) = &self.authenticator else {
            warn!("No valid token and no way to log in");
            return Err(AuthError::NoTokenAvailable);
        };

        info!(?mode, force, "Renewing token");
        let token = authenticator.authenticate(mode, &self.cancel).await?;

        let now = self.clock.now();
        let record = TokenRecord::issue(token, now, self.settings.fallback_lifetime)?;
        if record.expiry_assumed {
            warn!(
                assumed_lifetime = %format_duration(self.settings.fallback_lifetime),
                "Token expiry unreadable, assuming fallback lifetime"
            );
        }
        if !record.is_fresh(now, self.settings.renewal_margin) {
            warn!(expiry = %record.expiry, "New token already expires inside the renewal margin");
        }

        let persisted = match self.cache.store(&CacheEntry::from_record(&record, now)) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Token acquired but not persisted");
                false
            }
        };
        self.persisted.store(persisted, Ordering::SeqCst);

        info!(
            token = %record.preview(),
            expiry = %record.expiry,
            remaining = %format_duration(record.remaining(now)),
            "Token renewed"
        );
        let token = record.token.clone();
        *current = Some(record);
        Ok(token)
    }
}

fn fresh(current: &Option<TokenRecord>, now: DateTime<Utc>, margin: Duration) -> Option<&TokenRecord> {
    current.as_ref().filter(|record| record.is_fresh(now, margin))
}

fn load_cached(cache: &TokenCache) -> Option<TokenRecord> {
    match cache.load() {
        Ok(Some(entry)) => {
            debug!(path = %cache.path().display(), expiry = %entry.expiry, "Loaded cached token");
            Some(entry.into_record())
        }
        Ok(None) => None,
        Err(err) => {
            warn!(error = %err, "Ignoring unreadable token cache");
            None
        }
    }
}
