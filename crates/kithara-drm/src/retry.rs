#![forbid(unsafe_code)]

//! License fetching with bounded retries.

use std::{cmp::min, time::Duration};

use bytes::Bytes;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{DrmError, LicenseError, LicenseTransport, types::MessageType};

/// Retry behavior of license requests.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `u32::MAX` retries practically
    /// forever.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative random variation applied to each delay, in `[0, 1]`.
    pub jitter: f64,
    /// Per-attempt timeout. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            jitter: 0.3,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay before attempt `attempt` (0-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let exponential_delay = self.base_delay.saturating_mul(factor);
        min(exponential_delay, self.max_delay)
    }

    fn fuzzed_delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + self.jitter * (fastrand::f64() * 2.0 - 1.0);
        delay.mul_f64(factor.max(0.0))
    }
}

/// Failure of [`fetch_license`].
#[derive(Clone, Debug)]
pub(crate) enum LicenseFetchError {
    Transport(LicenseError),
    Timeout,
    Cancelled,
}

impl LicenseFetchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => !err.no_retry,
            Self::Timeout => true,
            Self::Cancelled => false,
        }
    }

    /// Blacklist the session instead of failing when this is the last error.
    pub(crate) fn fallback_on_last_try(&self) -> bool {
        matches!(self, Self::Transport(err) if err.fallback_on_last_try)
    }

    pub(crate) fn to_drm_error(&self) -> DrmError {
        match self {
            Self::Transport(err) => DrmError::KeyLoad(err.message.clone()),
            Self::Timeout => DrmError::KeyLoadTimeout,
            Self::Cancelled => DrmError::Disposed,
        }
    }
}

/// Call `transport` until it answers, the error is not retryable or the
/// retry budget is spent. At most `max_retries + 1` calls are made, all with
/// the same challenge.
///
/// `on_retry` runs once per failed attempt that is followed by a retry.
pub(crate) async fn fetch_license<F>(
    transport: &dyn LicenseTransport,
    policy: &RetryPolicy,
    challenge: Bytes,
    message_type: MessageType,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> Result<Option<Bytes>, LicenseFetchError>
where
    F: FnMut(&LicenseFetchError),
{
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = policy.fuzzed_delay_for_attempt(attempt);
            debug!(attempt, ?delay, "retrying license request");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LicenseFetchError::Cancelled),
                () = sleep(delay) => {}
            }
        }

        let call = transport.get_license(challenge.clone(), message_type);
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LicenseFetchError::Cancelled),
            res = with_timeout(policy.timeout, call) => res,
        };

        let error = match result {
            Ok(license) => return Ok(license),
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= policy.max_retries {
            return Err(error);
        }
        warn!(attempt, error = ?error, "license request failed");
        on_retry(&error);
        attempt = attempt.saturating_add(1);
    }
}

async fn with_timeout<F>(
    limit: Option<Duration>,
    call: F,
) -> Result<Option<Bytes>, LicenseFetchError>
where
    F: Future<Output = Result<Option<Bytes>, LicenseError>>,
{
    match limit {
        Some(limit) => match timeout(limit, call).await {
            Ok(res) => res.map_err(LicenseFetchError::Transport),
            Err(_) => Err(LicenseFetchError::Timeout),
        },
        None => call.await.map_err(LicenseFetchError::Transport),
    }
}
