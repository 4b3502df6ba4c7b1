//! Retry backoff and staleness thresholds for queue workers.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff for a failed attempt: 60s, 120s, 240s ... capped at
/// 30 minutes.
pub fn retry_delay(attempt_count: u32) -> Duration {
    let exponent = attempt_count.saturating_sub(1).min(16);
    let seconds = 60u64.saturating_mul(1u64 << exponent).min(1800);
    Duration::from_secs(seconds)
}

/// Same schedule with up to 10% jitter, to keep a worker fleet from
/// re-claiming in lockstep.
pub fn retry_delay_jittered(attempt_count: u32) -> Duration {
    let base = retry_delay(attempt_count);
    let jitter_range = base.as_secs() / 10;
    if jitter_range == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_range);
    base + Duration::from_secs(jitter)
}

/// Heartbeat-silence threshold before a processing job is considered stale.
pub fn stale_threshold(worker_timeout: Duration) -> Duration {
    let ceiling = Duration::from_secs(10 * 60);
    let from_timeout = worker_timeout
        .checked_sub(Duration::from_secs(60))
        .unwrap_or(Duration::from_secs(60))
        .max(Duration::from_secs(60));
    ceiling.min(from_timeout)
}

/// Route lock TTL: outlive the worker timeout with margin, never under 15
/// minutes.
pub fn lock_ttl(worker_timeout: Duration) -> Duration {
    (worker_timeout + Duration::from_secs(120)).max(Duration::from_secs(15 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_secs(60));
        assert_eq!(retry_delay(2), Duration::from_secs(120));
        assert_eq!(retry_delay(3), Duration::from_secs(240));
        assert_eq!(retry_delay(5), Duration::from_secs(960));
        assert_eq!(retry_delay(6), Duration::from_secs(1800));
        assert_eq!(retry_delay(30), Duration::from_secs(1800));
        // Attempt zero behaves like the first attempt.
        assert_eq!(retry_delay(0), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..32 {
            let with_jitter = retry_delay_jittered(3);
            assert!(with_jitter >= Duration::from_secs(240));
            assert!(with_jitter <= Duration::from_secs(264));
        }
    }

    #[test]
    fn stale_threshold_is_min_of_cap_and_timeout_margin() {
        // 45 minute timeout: min(600, 2640) = 600.
        assert_eq!(
            stale_threshold(Duration::from_secs(2700)),
            Duration::from_secs(600)
        );
        // Short timeout: margin wins.
        assert_eq!(
            stale_threshold(Duration::from_secs(300)),
            Duration::from_secs(240)
        );
    }

    #[test]
    fn lock_ttl_floors_at_fifteen_minutes() {
        assert_eq!(
            lock_ttl(Duration::from_secs(2700)),
            Duration::from_secs(2820)
        );
        assert_eq!(lock_ttl(Duration::from_secs(60)), Duration::from_secs(900));
    }
}
