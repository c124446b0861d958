use rand::{rng, Rng};
use tokio::time::Duration;

pub trait ExponentialBackoff: Sized {
    fn add_spread(&self, spread: Duration) -> Self;
    fn exponential_backoff(&self, max: Duration) -> Self;
}

impl ExponentialBackoff for Duration {
    fn add_spread(&self, spread: Duration) -> Self {
        if spread.is_zero() {
            return *self;
        }
        let spread = rng().random_range(0..spread.as_nanos());
        self.saturating_add(Duration::from_nanos(
            u64::try_from(spread).unwrap_or(u64::MAX),
        ))
    }

    fn exponential_backoff(&self, max: Duration) -> Self {
        std::cmp::min(self.saturating_mul(2), max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let max = Duration::from_secs(10);
        let mut delay = Duration::from_secs(1);
        let mut seen = vec![];
        for _ in 0..6 {
            delay = delay.exponential_backoff(max);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, [2, 4, 8, 10, 10, 10]);
    }

    #[test]
    fn spread_stays_in_range() {
        let base = Duration::from_millis(100);
        assert_eq!(base.add_spread(Duration::ZERO), base);
        for _ in 0..100 {
            let d = base.add_spread(Duration::from_millis(10));
            assert!(d >= base && d < base + Duration::from_millis(10));
        }
    }
}
