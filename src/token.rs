//! Token record and JWT expiry decoding.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::AuthError;

/// A bearer token with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub expiry: DateTime<Utc>,
    /// True when the token carried no readable `exp` claim and `expiry`
    /// came from the configured fallback lifetime.
    pub expiry_assumed: bool,
    pub acquired_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Build a record for a freshly obtained token.
    ///
    /// The expiry is read from the token's `exp` claim, or set to
    /// `now + fallback_lifetime` when the claim can't be read. A decoded
    /// expiry that is not strictly after `now` is rejected.
    pub fn issue(
        token: impl Into<String>,
        now: DateTime<Utc>,
        fallback_lifetime: Duration,
    ) -> Result<Self, AuthError> {
        let token = token.into();
        let (expiry, expiry_assumed) = match decode_expiry(&token) {
            Some(exp) => (exp, false),
            None => (saturating_add(now, fallback_lifetime), true),
        };

        if expiry <= now {
            return Err(AuthError::ExpiredToken { expiry });
        }

        Ok(Self {
            token,
            expiry,
            expiry_assumed,
            acquired_at: now,
        })
    }

    /// Whether the token is still usable for at least `margin` past `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expiry > saturating_add(now, margin)
    }

    /// Time left before expiry, or zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expiry - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Short, log-safe preview of the token.
    pub fn preview(&self) -> String {
        preview(&self.token)
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<serde_json::Number>,
}

/// Read the `exp` claim of a JWT-shaped token.
///
/// Returns `None` for anything that isn't three dot-separated segments with a
/// base64-encoded JSON payload carrying a numeric `exp`. Never panics.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let token = token.trim().trim_matches('"');
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let payload = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .ok()?;

    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.exp?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(secs, 0)
}

/// Whether `value` has the shape of a token: three non-empty dot-separated
/// segments, starting with `prefix`, at least `min_len` characters long.
pub fn looks_like_token(value: &str, prefix: &str, min_len: usize) -> bool {
    let value = value.trim().trim_matches('"');
    value.len() >= min_len
        && value.starts_with(prefix)
        && value.split('.').count() == 3
        && value.split('.').all(|s| !s.is_empty())
}

pub(crate) fn preview(token: &str) -> String {
    let cut: String = token.chars().take(12).collect();
    if cut.len() < token.len() {
        format!("{cut}…")
    } else {
        cut
    }
}

/// `at + d`, clamped to the latest representable instant.
pub(crate) fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
