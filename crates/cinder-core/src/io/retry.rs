//! Bounded retry with exponential backoff for storage I/O

use std::io;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CinderError, Result};

/// `ENOSPC` on Linux and the BSDs
const ENOSPC: i32 = 28;

/// How often and how patiently a failing I/O operation is retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "crate::config::duration_millis")]
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    #[serde(with = "crate::config::duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt + 1`, with jitter in `[d/2, d]`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let half = base / 2;
        let jitter_ns = rand::thread_rng().gen_range(0..=half.as_nanos() as u64);
        half + Duration::from_nanos(jitter_ns)
    }

    /// Run `f` until it succeeds, fails permanently or attempts run out
    pub fn run<T>(&self, operation: &str, mut f: impl FnMut() -> io::Result<T>) -> Result<T> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max && is_transient(&e) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storage I/O failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(classify(e)),
            }
        }
    }
}

/// Whether an I/O error may go away on its own
fn is_transient(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Unsupported
    )
}

/// Map an I/O error onto the engine's taxonomy
pub fn classify(e: io::Error) -> CinderError {
    if e.raw_os_error() == Some(ENOSPC) {
        CinderError::ResourceExhausted(format!("no space left on device: {e}"))
    } else {
        CinderError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_micros(10),
            max_backoff: Duration::from_micros(100),
        }
    }

    #[test]
    fn test_retry_until_success() {
        let mut calls = 0;
        let value = fast()
            .run("test", || {
                calls += 1;
                if calls < 3 {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "eintr"))
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let mut calls = 0;
        let err = fast()
            .run::<()>("test", || {
                calls += 1;
                Err(io::Error::new(io::ErrorKind::Other, "eio"))
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, CinderError::Io(_)));
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut calls = 0;
        let err = fast()
            .run::<()>("test", || {
                calls += 1;
                Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, CinderError::Io(_)));
    }

    #[test]
    fn test_enospc_is_resource_exhausted() {
        let err = fast()
            .run::<()>("test", || Err(io::Error::from_raw_os_error(ENOSPC)))
            .unwrap_err();
        assert!(matches!(err, CinderError::ResourceExhausted(_)));
    }

    #[test]
    fn test_backoff_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert!(policy.backoff_for(1) <= Duration::from_millis(10));
        assert!(policy.backoff_for(1) >= Duration::from_millis(5));
        for attempt in 1..10 {
            assert!(policy.backoff_for(attempt) <= Duration::from_millis(50));
        }
    }
}
