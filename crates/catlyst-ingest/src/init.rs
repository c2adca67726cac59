//! Initialization guard.
//!
//! A run may not list or enrich anything until the API session is known to
//! work. The guard retries establishment with backoff and turns the last
//! failure into a fatal [`IngestError::InitExhausted`].

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::config::InitConfig;
use crate::error::{IngestError, IngestResult};
use crate::retry::{BackoffSchedule, RetryDecision};
use crate::transport::{ApiRequest, ApiTransport, HttpTransport};

/// Something that can establish (or verify) an API session.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// One establishment attempt.
    async fn establish(&self) -> IngestResult<()>;
}

#[async_trait]
impl SessionProbe for HttpTransport {
    async fn establish(&self) -> IngestResult<()> {
        self.execute_once(&ApiRequest::get(self.auth_check_path()))
            .await
            .map(|_| ())
    }
}

/// Retry state machine around a [`SessionProbe`].
#[derive(Debug, Clone)]
pub struct InitializationGuard {
    max_attempts: u32,
    policy: BackoffSchedule,
}

impl InitializationGuard {
    #[must_use]
    pub fn new(settings: &InitConfig) -> Self {
        Self {
            max_attempts: settings.max_init_retry.max(1),
            policy: BackoffSchedule::from(settings),
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Establish the session, returning the number of attempts used.
    ///
    /// Every failure is retried, including client errors, since a rejected
    /// token may be a transient console-side condition.
    ///
    /// # Errors
    /// Returns `IngestError::InitExhausted` after `max_attempts` failures.
    #[instrument(skip_all, fields(max_attempts = self.max_attempts))]
    pub async fn establish(&self, probe: &dyn SessionProbe) -> IngestResult<u32> {
        let mut attempt: u32 = 0;
        loop {
            let err = match probe.establish().await {
                Ok(()) => {
                    info!(attempts = attempt + 1, "API session established");
                    return Ok(attempt + 1);
                }
                Err(err) => err,
            };

            let decision = match err.retry_decision() {
                RetryDecision::After(delay) => RetryDecision::After(delay),
                _ => RetryDecision::Backoff,
            };
            let Some(delay) = self.policy.delay(attempt, decision, rand::random()) else {
                return Err(IngestError::InitExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            };

            warn!(
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "session establishment failed"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SessionProbe for Flaky {
        async fn establish(&self) -> IngestResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(IngestError::Api {
                    status: 401,
                    message: "unauthorized".into(),
                    retry_after: None,
                })
            } else {
                Ok(())
            }
        }
    }

    fn guard(max: u32) -> InitializationGuard {
        InitializationGuard::new(&InitConfig {
            max_init_retry: max,
            base_backoff_ms: 10,
            max_backoff_ms: 20,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_n_minus_one_failures() {
        let probe = Flaky {
            failures: 4,
            calls: AtomicU32::new(0),
        };
        let attempts = guard(5).establish(&probe).await.expect("established");
        assert_eq!(attempts, 5);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_n_failures() {
        let probe = Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
        };
        let err = guard(5).establish(&probe).await.unwrap_err();
        match err {
            IngestError::InitExhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert_eq!(last.status(), Some(401));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_guard() {
        let probe = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        assert!(guard(1).establish(&probe).await.is_err());
        assert_eq!(guard(0).max_attempts(), 1);
    }
}
