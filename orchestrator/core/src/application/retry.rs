// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Retry Policy
//!
//! Wraps exactly one stage call. Retryable failures (timeout, rate limit,
//! transient network, 5xx) are retried under exponential backoff up to the
//! attempt ceiling; fatal failures return at once. Cancellation interrupts
//! both an in-flight attempt and a pending backoff sleep.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Attempt loop, backoff schedule and per-attempt reporting

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::llm::{ErrorClass, LLMError};
use crate::domain::node_config::RetryConfig;
use crate::domain::strategy::FailureKind;

/// Exponential backoff: `initial * multiplier^(n-1)` after the n-th failure,
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSchedule {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            max,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Hooks invoked around every attempt. All methods default to no-ops.
pub trait AttemptObserver<T>: Send + Sync {
    fn attempt_started(&self, _attempt: u32) {}

    fn attempt_succeeded(&self, _attempt: u32, _value: &T, _latency: Duration) {}

    /// `will_retry` is false when this failure ends the stage.
    fn attempt_failed(&self, _attempt: u32, _error: &LLMError, _latency: Duration, _will_retry: bool) {}
}

impl<T> AttemptObserver<T> for () {}

/// A successful call and the attempt that produced it.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    pub latency: Duration,
}

/// A stage that produced no output.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub kind: FailureKind,
    /// Last classified error.
    pub error: LLMError,
    pub attempts: u32,
    /// Latency of the last attempt.
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    schedule: BackoffSchedule,
}

impl RetryPolicy {
    pub fn new(schedule: BackoffSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    /// Run `call` until it succeeds, fails fatally, runs out of attempts or
    /// `cancel` fires. `call` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        max_attempts: u32,
        cancel: &CancellationToken,
        observer: &dyn AttemptObserver<T>,
        mut call: F,
    ) -> Result<Attempted<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    kind: FailureKind::Cancelled,
                    error: LLMError::Cancelled,
                    attempts: attempt,
                    latency: Duration::ZERO,
                });
            }

            attempt += 1;
            observer.attempt_started(attempt);
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LLMError::Cancelled),
                result = call(attempt) => result,
            };
            let latency = started.elapsed();

            let error = match result {
                Ok(value) => {
                    observer.attempt_succeeded(attempt, &value, latency);
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        latency,
                    });
                }
                Err(error) => error,
            };

            let terminal = match error.class() {
                ErrorClass::Cancelled => Some(FailureKind::Cancelled),
                ErrorClass::Fatal => Some(FailureKind::Fatal),
                ErrorClass::Retryable if attempt >= max_attempts => {
                    Some(FailureKind::RetryableExhausted)
                }
                ErrorClass::Retryable => None,
            };
            observer.attempt_failed(attempt, &error, latency, terminal.is_none());

            if let Some(kind) = terminal {
                debug!(attempt, kind = kind.as_str(), error = %error, "Giving up");
                return Err(RetryFailure {
                    kind,
                    error,
                    attempts: attempt,
                    latency,
                });
            }

            let delay = self.schedule.delay_after(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable failure, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        kind: FailureKind::Cancelled,
                        error: LLMError::Cancelled,
                        attempts: attempt,
                        latency,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl AttemptObserver<&'static str> for Recorder {
        fn attempt_started(&self, attempt: u32) {
            self.log.lock().push(format!("start {attempt}"));
        }

        fn attempt_succeeded(&self, attempt: u32, value: &&'static str, _latency: Duration) {
            self.log.lock().push(format!("ok {attempt} {value}"));
        }

        fn attempt_failed(&self, attempt: u32, error: &LLMError, _latency: Duration, will_retry: bool) {
            self.log
                .lock()
                .push(format!("fail {attempt} {} retry={will_retry}", error.code()));
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.delay_after(1), Duration::from_millis(500));
        assert_eq!(schedule.delay_after(2), Duration::from_millis(1000));
        assert_eq!(schedule.delay_after(3), Duration::from_millis(2000));
        assert_eq!(schedule.delay_after(5), Duration::from_millis(8000));
        assert_eq!(schedule.delay_after(60), Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_are_retried_then_succeed() {
        let policy = RetryPolicy::default();
        let recorder = Recorder::default();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let outcome = policy
            .run(3, &CancellationToken::new(), &recorder, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(LLMError::RateLimit("slow down".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms + 1000ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(
            *recorder.log.lock(),
            vec![
                "start 1",
                "fail 1 rate_limit retry=true",
                "start 2",
                "fail 2 rate_limit retry=true",
                "start 3",
                "ok 3 done",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let failure = policy
            .run(3, &CancellationToken::new(), &(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LLMError::Timeout(Duration::from_secs(45))) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::RetryableExhausted);
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, LLMError::Timeout(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_never_retried() {
        let policy = RetryPolicy::default();
        let recorder = Recorder::default();
        let calls = AtomicU32::new(0);

        let failure = policy
            .run(3, &CancellationToken::new(), &recorder, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LLMError::InvalidParameter("temperature".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recorder.log.lock(),
            vec!["start 1", "fail 1 invalid_parameter retry=false"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::new(BackoffSchedule::new(
            Duration::from_secs(30),
            2.0,
            Duration::from_secs(60),
        ));
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let failure = policy
            .run(3, &token, &(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LLMError::Network("reset".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_attempt() {
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let failure = policy
            .run(3, &token, &(), |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_call() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let failure = RetryPolicy::default()
            .run(3, &token, &(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
