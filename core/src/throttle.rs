use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct ThrottleState {
    start: Instant,
    bytes: u64,
    limit_bytes_per_sec: u64,
}

impl ThrottleState {
    fn new(limit_bytes_per_sec: u64) -> Self {
        Self {
            start: Instant::now(),
            bytes: 0,
            limit_bytes_per_sec,
        }
    }

    fn reserve_sleep(&mut self, bytes: u64) -> Duration {
        self.bytes = self.bytes.saturating_add(bytes);
        if self.limit_bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let expected = self.bytes as f64 / self.limit_bytes_per_sec as f64;
        let elapsed = self.start.elapsed().as_secs_f64();
        if expected > elapsed {
            Duration::from_secs_f64(expected - elapsed)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Clone, Default)]
pub struct Throttle {
    state: Option<Arc<Mutex<ThrottleState>>>,
}

impl Throttle {
    pub fn new(limit_bytes_per_sec: Option<u64>) -> Self {
        let state = limit_bytes_per_sec
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Mutex::new(ThrottleState::new(limit))));
        Self { state }
    }

    pub fn is_limited(&self) -> bool {
        self.state.is_some()
    }

    pub fn reserve(&self, bytes: u64) -> Duration {
        match &self.state {
            Some(state) => state
                .lock()
                .map(|mut guard| guard.reserve_sleep(bytes))
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_sleeps() {
        let throttle = Throttle::new(None);
        assert!(!throttle.is_limited());
        assert_eq!(throttle.reserve(u64::MAX), Duration::ZERO);
        assert!(!Throttle::new(Some(0)).is_limited());
    }

    #[test]
    fn test_over_budget_requests_sleep() {
        let throttle = Throttle::new(Some(1000));
        let sleep = throttle.reserve(2000);
        assert!(sleep > Duration::from_millis(1500));
        assert!(sleep <= Duration::from_secs(2));
    }

    #[test]
    fn test_clones_share_budget() {
        let throttle = Throttle::new(Some(1000));
        let other = throttle.clone();
        throttle.reserve(1000);
        assert!(other.reserve(1000) > Duration::from_millis(1500));
    }
}
