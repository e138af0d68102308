use crate::error::FailureKind;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the chunk, not to be assigned before `delay` elapses
    Retry { delay: std::time::Duration },
    /// Requeue the chunk and take the stream out of service; it may reconnect after `delay`
    RetireStream { delay: std::time::Duration },
    /// Give up on the chunk, which aborts the transfer
    Abort,
}

/// Decides what happens after a chunk attempt failed.
///
/// `attempt` is the number of attempts made so far, including the one that just failed.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision;

    /// Delay before reconnect `attempt` of a data stream whose previous connect failed.
    fn reconnect_delay(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(100).saturating_mul(attempt)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DefaultRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: std::time::Duration::from_millis(100),
            max_delay: std::time::Duration::from_secs(5),
        }
    }
}

impl DefaultRetryPolicy {
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::Abort;
        }
        match kind {
            FailureKind::Integrity => RetryDecision::Retry {
                delay: std::time::Duration::ZERO,
            },
            FailureKind::Io => RetryDecision::Retry {
                delay: self.backoff(attempt),
            },
            FailureKind::Network => RetryDecision::RetireStream {
                delay: self.backoff(attempt),
            },
            FailureKind::Timeout | FailureKind::Protocol => RetryDecision::RetireStream {
                delay: std::time::Duration::ZERO,
            },
            // abandoned chunks are requeued by the cancel path, never counted as failures
            FailureKind::Cancelled => RetryDecision::Retry {
                delay: std::time::Duration::ZERO,
            },
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> std::time::Duration {
        self.backoff(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_by_kind() {
        let policy = DefaultRetryPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::Integrity, 1),
            RetryDecision::Retry {
                delay: std::time::Duration::ZERO
            }
        );
        assert_eq!(
            policy.decide(FailureKind::Io, 2),
            RetryDecision::Retry {
                delay: std::time::Duration::from_millis(200)
            }
        );
        assert!(matches!(
            policy.decide(FailureKind::Network, 1),
            RetryDecision::RetireStream { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Timeout, 1),
            RetryDecision::RetireStream { .. }
        ));
        assert!(matches!(
            policy.decide(FailureKind::Protocol, 1),
            RetryDecision::RetireStream { .. }
        ));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = DefaultRetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert_ne!(policy.decide(FailureKind::Integrity, 2), RetryDecision::Abort);
        for kind in [
            FailureKind::Integrity,
            FailureKind::Io,
            FailureKind::Network,
            FailureKind::Timeout,
        ] {
            assert_eq!(policy.decide(kind, 3), RetryDecision::Abort);
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = DefaultRetryPolicy::default();
        assert_eq!(policy.backoff(1), std::time::Duration::from_millis(100));
        assert_eq!(policy.backoff(4), std::time::Duration::from_millis(800));
        assert_eq!(policy.backoff(10), std::time::Duration::from_secs(5));
        assert_eq!(policy.backoff(u32::MAX), std::time::Duration::from_secs(5));
    }
}
