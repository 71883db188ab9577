//! Challenge-solving service clients.

pub mod poll;
pub mod twocaptcha;

pub use poll::{poll_until, PollError, PollSchedule, PollStep};
pub use twocaptcha::{TwoCaptchaClient, TwoCaptchaConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::error::SolveError;

/// A challenge submitted to a solving service and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeTask {
    pub task_id: String,
    pub site_key: String,
    pub page_url: String,
    pub submitted_at: DateTime<Utc>,
}

/// A service that turns a challenge site key into a response value.
///
/// Implementations never retry a failed submit; that is up to the caller.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Submit the challenge and wait up to `timeout` for its solution.
    async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, SolveError>;

    /// Remaining service credit.
    async fn balance(&self) -> Result<Decimal, SolveError>;
}

/// Fail with `InsufficientBalance` unless the solver holds at least `minimum`.
pub async fn ensure_balance(
    solver: &dyn ChallengeSolver,
    minimum: Decimal,
) -> Result<Decimal, SolveError> {
    let balance = solver.balance().await?;
    if balance < minimum {
        tracing::warn!(%balance, %minimum, "Solver balance below per-solve minimum");
        return Err(SolveError::InsufficientBalance { balance, minimum });
    }
    tracing::debug!(%balance, "Solver balance ok");
    Ok(balance)
}
