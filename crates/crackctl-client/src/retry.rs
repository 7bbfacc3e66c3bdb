use std::future::Future;
use std::time::Duration;

use crackctl_observe::time::unix_time_ms;
use tracing::debug;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

pub fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Runs `f` until it yields a non-transient outcome or attempts run out.
///
/// A transient status on the last attempt is returned as `Ok(resp)`; the
/// caller decides what that status means.
pub async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    salt: u64,
    mut f: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let max_delay_ms = policy.max_delay.as_millis() as u64;
    let mut attempt: u32 = 0;
    let mut delay_ms = policy.base_delay.as_millis() as u64;
    loop {
        attempt = attempt.saturating_add(1);
        let transient = match f().await {
            Ok(resp) => {
                if !is_transient_status(resp.status()) || attempt >= max_attempts {
                    return Ok(resp);
                }
                format!("status {}", resp.status())
            }
            Err(err) => {
                if !is_transient_error(&err) || attempt >= max_attempts {
                    return Err(err);
                }
                err.to_string()
            }
        };

        let jitter = unix_time_ms().wrapping_add(salt) % 37;
        debug!(
            request = what,
            attempt = attempt,
            delay_ms = delay_ms.saturating_add(jitter),
            cause = %transient,
            "retrying transient failure"
        );
        tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter))).await;
        delay_ms = delay_ms.saturating_mul(2).min(max_delay_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(is_transient_status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(reqwest::StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!is_transient_status(reqwest::StatusCode::OK));
    }

    #[test]
    fn no_retry_is_single_attempt() {
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 5);
    }
}
