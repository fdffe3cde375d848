//! Per-queue delivery policy: visibility timeout, retry backoff, and
//! dead-letter routing. Policies are persisted by the backend and cached by
//! the queue manager.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Max delivery attempts before DLQ routing.
    pub limit: u32,
    pub backoff: Backoff,
    pub initial_delay_sec: u32,
    pub max_delay_sec: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            backoff: Backoff::Fixed,
            initial_delay_sec: 0,
            max_delay_sec: 300,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in seconds after attempt `n` (1-indexed) has failed,
    /// clamped to `[0, max_delay_sec]`.
    pub fn delay_secs(&self, attempt: u32) -> u32 {
        let n = attempt.max(1);
        let d0 = self.initial_delay_sec as u64;
        let raw = match self.backoff {
            Backoff::Fixed => d0,
            Backoff::Linear => d0.saturating_mul(n as u64),
            Backoff::Exponential => {
                // 2^(n-1) overflows fast; anything past 63 doublings is
                // already beyond any sane max_delay_sec.
                let shift = (n - 1).min(63);
                d0.saturating_mul(1u64 << shift)
            }
        };
        raw.min(self.max_delay_sec as u64) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DlqPolicy {
    pub enabled: bool,
    /// Target queue name; empty means `<origin>.dlq`.
    pub queue: String,
    pub retention_days: u32,
}

impl Default for DlqPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            queue: String::new(),
            retention_days: 14,
        }
    }
}

impl DlqPolicy {
    pub fn queue_for(&self, origin: &str) -> String {
        if self.queue.is_empty() {
            format!("{origin}.dlq")
        } else {
            self.queue.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueuePolicy {
    /// Default lease duration for the queue.
    pub visibility_timeout_sec: u32,
    pub retry: RetryPolicy,
    pub dlq: DlqPolicy,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            visibility_timeout_sec: 30,
            retry: RetryPolicy::default(),
            dlq: DlqPolicy::default(),
        }
    }
}

impl QueuePolicy {
    /// Whether a message that has already been delivered `attempt` times may
    /// be granted another attempt, or must be dead-lettered.
    ///
    /// The prospective attempt is `attempt + 1`; routing triggers once it
    /// exceeds the retry limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt + 1 > self.retry.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(backoff: Backoff, d0: u32, dmax: u32) -> RetryPolicy {
        RetryPolicy {
            limit: 5,
            backoff,
            initial_delay_sec: d0,
            max_delay_sec: dmax,
        }
    }

    #[test]
    fn fixed_backoff_ignores_attempt() {
        let p = retry(Backoff::Fixed, 7, 60);
        assert_eq!(p.delay_secs(1), 7);
        assert_eq!(p.delay_secs(4), 7);
    }

    #[test]
    fn linear_backoff_scales_and_clamps() {
        let p = retry(Backoff::Linear, 10, 35);
        assert_eq!(p.delay_secs(1), 10);
        assert_eq!(p.delay_secs(3), 30);
        assert_eq!(p.delay_secs(4), 35);
    }

    #[test]
    fn exponential_backoff_doubles_and_clamps() {
        let p = retry(Backoff::Exponential, 2, 100);
        assert_eq!(p.delay_secs(1), 2);
        assert_eq!(p.delay_secs(2), 4);
        assert_eq!(p.delay_secs(5), 32);
        assert_eq!(p.delay_secs(12), 100);
    }

    #[test]
    fn exponential_backoff_survives_huge_attempts() {
        let p = retry(Backoff::Exponential, 1, 600);
        assert_eq!(p.delay_secs(200), 600);
    }

    #[test]
    fn dlq_name_defaults_to_origin_suffix() {
        let dlq = DlqPolicy::default();
        assert_eq!(dlq.queue_for("orders"), "orders.dlq");

        let named = DlqPolicy {
            queue: "graveyard".into(),
            ..DlqPolicy::default()
        };
        assert_eq!(named.queue_for("orders"), "graveyard");
    }

    #[test]
    fn exhaustion_uses_the_prospective_attempt() {
        let policy = QueuePolicy {
            retry: RetryPolicy {
                limit: 2,
                ..RetryPolicy::default()
            },
            ..QueuePolicy::default()
        };
        assert!(!policy.exhausted(1));
        assert!(policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn policy_json_round_trip() {
        let policy = QueuePolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: QueuePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
