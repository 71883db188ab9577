//! Bounded polling loop.
//!
//! Each iteration waits `min(interval, time left)` and then runs one check.
//! A check still running at the deadline is dropped, and the deadline is also
//! tested after every check, so a timeout is reported at the deadline and
//! never later. Waits are on `tokio::time`, which lets tests drive the loop
//! with paused time.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one polling check.
#[derive(Debug)]
pub enum PollStep<T, E> {
    Ready(T),
    Pending,
    Failed(E),
}

/// Why a polling loop stopped without a result.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    Failed(E),
    TimedOut { elapsed: Duration, attempts: u32 },
    Cancelled,
}

/// Interval and overall budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Run `check` on `schedule` until it reports ready or failed, the budget
/// runs out, or `cancel` fires.
pub async fn poll_until<T, E, F, Fut>(
    schedule: PollSchedule,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PollStep<T, E>>,
{
    let start = Instant::now();
    let deadline = start + schedule.timeout;
    // A zero interval would spin; treat it as "check at the deadline only".
    let interval = if schedule.interval.is_zero() {
        schedule.timeout
    } else {
        schedule.interval
    };
    let mut attempts = 0u32;

    loop {
        let wake = (Instant::now() + interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }

        attempts += 1;
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            step = check(attempts) => step,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(PollError::TimedOut {
                    elapsed: Instant::now() - start,
                    attempts,
                });
            }
        };

        match step {
            PollStep::Ready(value) => return Ok(value),
            PollStep::Failed(err) => return Err(PollError::Failed(err)),
            PollStep::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                elapsed: now - start,
                attempts,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_exactly_at_deadline() {
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(120));
        let start = Instant::now();

        let result: Result<(), PollError<()>> =
            poll_until(schedule, &cancel, |_| async { PollStep::Pending }).await;

        assert_eq!(
            result,
            Err(PollError::TimedOut {
                elapsed: Duration::from_secs(120),
                attempts: 24
            })
        );
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn uneven_interval_clamps_last_wait_to_deadline() {
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_secs(7), Duration::from_secs(20));
        let start = Instant::now();

        let result: Result<(), PollError<()>> =
            poll_until(schedule, &cancel, |_| async { PollStep::Pending }).await;

        // Checks at 7s, 14s and the clamped 20s.
        assert!(matches!(result, Err(PollError::TimedOut { attempts: 3, .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_is_cut_off_at_deadline() {
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_millis(500), Duration::from_secs(1));
        let start = Instant::now();

        let result: Result<(), PollError<()>> = poll_until(schedule, &cancel, |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            PollStep::Pending
        })
        .await;

        assert_eq!(
            result,
            Err(PollError::TimedOut {
                elapsed: Duration::from_secs(1),
                attempts: 1
            })
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_ready_value() {
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(120));
        let start = Instant::now();

        let result: Result<&str, PollError<()>> = poll_until(schedule, &cancel, |n| async move {
            if n == 3 {
                PollStep::Ready("solved")
            } else {
                PollStep::Pending
            }
        })
        .await;

        assert_eq!(result, Ok("solved"));
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_terminal() {
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(120));

        let result: Result<(), PollError<&str>> =
            poll_until(schedule, &cancel, |_| async { PollStep::Failed("ERROR_CAPTCHA_UNSOLVABLE") })
                .await;

        assert_eq!(result, Err(PollError::Failed("ERROR_CAPTCHA_UNSOLVABLE")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let schedule = PollSchedule::new(Duration::from_secs(5), Duration::from_secs(120));
        let start = Instant::now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let result: Result<(), PollError<()>> =
            poll_until(schedule, &cancel, |_| async { PollStep::Pending }).await;

        assert_eq!(result, Err(PollError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(15));
    }
}
