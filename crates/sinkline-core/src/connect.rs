//! Connection provider: open a connection with a bounded, fixed-delay retry

use std::time::Duration;

use crate::db::{Connection, Connector};
use crate::error::ConnectionFailure;

/// Fixed-delay retry budget for opening connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// No sleeping between attempts (tests, interactive use)
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

/// Open a connection, retrying up to `policy.max_attempts` times.
///
/// Every failed attempt logs a warning with the attempt number and the driver
/// text. The delay is constant; there is no backoff growth. At least one
/// attempt is always made.
pub fn connect_with_retry(
    connector: &dyn Connector,
    policy: &RetryPolicy,
) -> Result<Box<dyn Connection>, ConnectionFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match connector.connect() {
            Ok(conn) => {
                if attempt > 1 {
                    log::info!("connected to {} on attempt {attempt}", connector.target());
                }
                return Ok(conn);
            }
            Err(e) => {
                log::warn!(
                    "connection attempt {attempt}/{max_attempts} to {} failed: {e}",
                    connector.target()
                );
                if attempt >= max_attempts {
                    return Err(ConnectionFailure {
                        target: connector.target(),
                        attempts: attempt,
                        last_error: e,
                    });
                }
                std::thread::sleep(policy.delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbError;
    use crate::testing::RecordingConnector;

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.delay, Duration::from_secs(5));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let connector = RecordingConnector::new().failing_connects(2);
        let conn = connect_with_retry(&connector, &RetryPolicy::immediate(3));
        assert!(conn.is_ok());
        assert_eq!(connector.recording().connect_attempts(), 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let connector = RecordingConnector::new().failing_connects(10);
        let err = connect_with_retry(&connector, &RetryPolicy::immediate(3))
            .err()
            .unwrap();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last_error, DbError::Connect(_)));
        assert_eq!(connector.recording().connect_attempts(), 3);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let connector = RecordingConnector::new();
        assert!(connect_with_retry(&connector, &RetryPolicy::immediate(0)).is_ok());
        assert_eq!(connector.recording().connect_attempts(), 1);
    }
}
