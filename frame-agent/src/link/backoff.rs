use std::time::Duration;

/// 指数退避
///
/// 失败后 `delay = min(delay * multiplier, max)`，成功后立即回到初始值。
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            current: initial,
        }
    }

    /// 下一次尝试前应等待的时间
    pub fn delay(&self) -> Duration {
        self.current
    }

    /// 记录一次失败，返回新的等待时间
    pub fn on_failure(&mut self) -> Duration {
        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = if next >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(next)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);

        assert_eq!(backoff.delay(), Duration::from_secs(1));
        assert_eq!(backoff.on_failure(), Duration::from_secs(2));
        assert_eq!(backoff.on_failure(), Duration::from_secs(4));
        assert_eq!(backoff.on_failure(), Duration::from_secs(8));
        assert_eq!(backoff.on_failure(), Duration::from_secs(16));
        assert_eq!(backoff.on_failure(), Duration::from_secs(30));
        assert_eq!(backoff.on_failure(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        let mut backoff = Backoff::new(Duration::from_millis(300), Duration::from_secs(5), 3.5);
        for _ in 0..100 {
            assert!(backoff.on_failure() <= Duration::from_secs(5));
        }
        assert_eq!(backoff.delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        backoff.on_failure();
        backoff.on_failure();
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_initial_clamped_to_max() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(30), 2.0);
        assert_eq!(backoff.delay(), Duration::from_secs(30));
    }
}
