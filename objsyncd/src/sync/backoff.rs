use rand::Rng;
use std::time::Duration;

/// Capped exponential delay between retries of a failing path.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        // Jitter only spreads the upper half so a retry never fires immediately.
        let delay_ms = if self.jitter && exp > 1 {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Earliest retry time, in nanoseconds, after failure number `attempt` (1-based).
    pub fn retry_at(&self, now_nanos: i64, attempt: u32) -> i64 {
        let delay = self.delay(attempt.saturating_sub(1));
        let delay_nanos = i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX);
        now_nanos.saturating_add(delay_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff.delay_with_rng(0, &mut rng),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.delay_with_rng(1, &mut rng),
            Duration::from_millis(200)
        );
        assert_eq!(
            backoff.delay_with_rng(2, &mut rng),
            Duration::from_millis(400)
        );
        assert_eq!(
            backoff.delay_with_rng(3, &mut rng),
            Duration::from_millis(800)
        );
        assert_eq!(
            backoff.delay_with_rng(30, &mut rng),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn backoff_with_jitter_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay <= Duration::from_millis(800));
            assert!(delay >= Duration::from_millis(400));
        }
    }

    #[test]
    fn retry_at_offsets_from_now() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(3600), false);
        assert_eq!(backoff.retry_at(1_000, 1), 1_000 + 30_000_000_000);
        assert_eq!(backoff.retry_at(1_000, 2), 1_000 + 60_000_000_000);
        assert_eq!(backoff.retry_at(i64::MAX - 1, 5), i64::MAX);
    }
}
