//! Bounded polling with cancellation.
//!
//! All three waits in the pipeline (container liveness, kubeconfig
//! availability, resource discoverability) are the same shape: call an
//! operation on a fixed interval until it reports ready, an absolute
//! wall-clock deadline passes, or the caller cancels.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Outcome of a single poll attempt.
pub enum Attempt<T> {
    /// The condition is satisfied; polling stops with this value.
    Ready(T),
    /// Not there yet; poll again after the interval.
    NotYet,
}

/// Polls `op` every `interval` until it returns [`Attempt::Ready`], the
/// `budget` deadline passes, or `token` is cancelled.
///
/// The deadline is absolute: a slow attempt still counts against it, and the
/// attempt itself is abandoned the moment the deadline or a cancellation
/// fires. A fatal error from `op` ends the poll immediately. Timeout errors
/// name `what`; callers with more context (e.g. which resources are still
/// missing) rewrite the message afterwards.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    budget: Duration,
    what: &str,
    token: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let deadline = Instant::now() + budget;
    loop {
        let attempt = op();
        tokio::pin!(attempt);
        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(deadline) => return Err(timeout(what, budget)),
            outcome = &mut attempt => outcome?,
        };
        if let Attempt::Ready(value) = outcome {
            return Ok(value);
        }
        let next = Instant::now() + interval;
        if next >= deadline {
            return Err(timeout(what, budget));
        }
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(next) => {}
        }
    }
}

fn timeout(what: &str, budget: Duration) -> Error {
    Error::Timeout {
        what: what.to_string(),
        budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn returns_on_first_ready() {
        let token = CancellationToken::new();
        let out = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(10),
            "test condition",
            &token,
            || async { Ok(Attempt::Ready(7)) },
        )
        .await
        .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_ready() {
        let token = CancellationToken::new();
        let calls = Cell::new(0u32);
        let out = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(10),
            "test condition",
            &token,
            || {
                let n = calls.get() + 1;
                calls.set(n);
                async move {
                    if n == 4 {
                        Ok(Attempt::Ready("done"))
                    } else {
                        Ok(Attempt::NotYet)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_expiry_is_a_timeout() {
        let token = CancellationToken::new();
        let start = Instant::now();
        let err = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(2),
            "something slow",
            &token,
            || async { Ok::<_, Error>(Attempt::<()>::NotYet) },
        )
        .await
        .unwrap_err();
        match err {
            Error::Timeout { what, budget } => {
                assert_eq!(what, "something slow");
                assert_eq!(budget, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_end_the_poll() {
        let token = CancellationToken::new();
        let err = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(10),
            "test condition",
            &token,
            || async { Err::<Attempt<()>, _>(Error::Config("boom".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_beats_the_budget() {
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        let err = poll_until(
            Duration::from_secs(1),
            Duration::from_secs(60),
            "test condition",
            &token,
            || async { Ok::<_, Error>(Attempt::<()>::NotYet) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
