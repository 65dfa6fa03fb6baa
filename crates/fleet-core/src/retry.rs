use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with full one-second jitter.
///
/// `backoff(k)` for the k-th retry is `min(max, base * 2^k) + U(0, 1)`
/// seconds. The ceiling and base come from `EXEC_MAX_BACKOFF_SEC` /
/// `EXEC_BASE_BACKOFF_SEC`; `max_retries` bounds terminal failure, so the
/// cumulative attempt count is `max_retries + 1`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_secs: f64,
    pub max_backoff_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_secs: 2.0,
            max_backoff_secs: 30.0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retries_done: u32) -> Duration {
        let exp = self.base_backoff_secs * 2f64.powi(retries_done.min(31) as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(exp.min(self.max_backoff_secs) + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;

    #[test]
    fn backoff_stays_within_jitter_band() {
        let policy = RetryPolicy::default();
        for k in 0..8u32 {
            let floor = (2.0 * 2f64.powi(k as i32)).min(30.0);
            for _ in 0..20 {
                let d = policy.backoff(k).as_secs_f64();
                assert!(d >= floor, "k={k}: {d} < {floor}");
                assert!(d <= floor + 1.0, "k={k}: {d} > {}", floor + 1.0);
            }
        }
    }

    #[test]
    fn backoff_is_clamped_at_ceiling() {
        let policy = RetryPolicy::default();
        let d = policy.backoff(30).as_secs_f64();
        assert!((30.0..=31.0).contains(&d), "expected clamp to 30+U(0,1), got {d}");
    }
}
