//! Error types for each layer.
//!
//! Lower layers return a specific kind; [`AuthError`] wraps them without
//! collapsing, so callers can tell a service outage from bad credentials.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Errors from the challenge-solving service.
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("challenge submit failed: {0}")]
    SubmitFailed(String),

    #[error("challenge solve failed: {0}")]
    SolveFailed(String),

    #[error("challenge not solved within {}s", .elapsed.as_secs())]
    TimedOut { elapsed: Duration },

    #[error("solver balance {balance} is below the per-solve minimum {minimum}")]
    InsufficientBalance { balance: Decimal, minimum: Decimal },

    #[error("solver rejected the request: {0}")]
    Rejected(String),

    #[error("solver request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("solver wait cancelled")]
    Cancelled,
}

/// Errors from the on-disk token cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to read token cache {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse token cache {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write token cache {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the browser-driven login flow.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("no element found for the {0} field")]
    FieldNotFound(&'static str),

    #[error("challenge could not be resolved: {0}")]
    ChallengeUnresolved(#[source] SolveError),

    #[error("authenticated page not reached within {}s", .0.as_secs())]
    LoginTimeout(Duration),

    #[error("no token found in client-side storage")]
    TokenNotFound,

    #[error("browser operation failed: {0}")]
    Browser(String),

    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("login cancelled")]
    Cancelled,
}

/// Errors surfaced by [`crate::manager::TokenManager`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no token available and no way to acquire one")]
    NoTokenAvailable,

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error("solver balance {balance} is below the per-solve minimum {minimum}")]
    InsufficientBalance { balance: Decimal, minimum: Decimal },

    #[error(transparent)]
    Solver(SolveError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("token already expired or inside the renewal margin (expiry {expiry})")]
    ExpiredToken { expiry: DateTime<Utc> },

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("no challenge solver configured")]
    SolverUnavailable,
}

impl From<SolveError> for AuthError {
    fn from(err: SolveError) -> Self {
        match err {
            SolveError::InsufficientBalance { balance, minimum } => {
                AuthError::InsufficientBalance { balance, minimum }
            }
            other => AuthError::Solver(other),
        }
    }
}

impl AuthError {
    /// Whether retrying the same attempt later might succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Login(LoginError::LoginTimeout(_))
            | AuthError::Login(LoginError::Browser(_))
            | AuthError::Login(LoginError::TokenNotFound)
            | AuthError::Cache(CacheError::Write { .. }) => true,
            AuthError::Login(LoginError::ChallengeUnresolved(inner)) | AuthError::Solver(inner) => {
                matches!(
                    inner,
                    SolveError::TimedOut { .. } | SolveError::Transport(_) | SolveError::SolveFailed(_)
                )
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_keeps_its_kind() {
        let err: AuthError = SolveError::InsufficientBalance {
            balance: Decimal::new(1, 3),
            minimum: Decimal::new(3, 3),
        }
        .into();
        assert!(matches!(err, AuthError::InsufficientBalance { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable_but_missing_fields_are_not() {
        let timeout = AuthError::Login(LoginError::ChallengeUnresolved(SolveError::TimedOut {
            elapsed: Duration::from_secs(120),
        }));
        assert!(timeout.is_retryable());

        let field = AuthError::Login(LoginError::FieldNotFound("email"));
        assert!(!field.is_retryable());
        assert!(!AuthError::NoTokenAvailable.is_retryable());
    }
}
