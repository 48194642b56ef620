//! Per-tenant fixed-window rate limiting.
//!
//! Windows are aligned to epoch multiples of the window length, so every
//! tenant's window rolls over at the same instant and the counter state
//! is a single (window_start, count) pair per tenant. The clock is a
//! trait so tests can step time by hand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Result, ServiceError};

pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<String, (i64, i64)>>,
    window_secs: i64,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(window_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_secs,
            clock,
        }
    }

    /// Count one request against the tenant's current window; fails with
    /// `RateLimited` once the plan's per-window limit is reached. A
    /// rejected request is not counted.
    pub fn check(&self, tenant_id: &str, limit: i64) -> Result<()> {
        let now = self.clock.now();
        let window_start = now - now.rem_euclid(self.window_secs);

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entry = windows.entry(tenant_id.to_string()).or_insert((window_start, 0));

        if entry.0 != window_start {
            *entry = (window_start, 0);
        }

        if entry.1 >= limit {
            return Err(ServiceError::RateLimited {
                limit,
                window_secs: self.window_secs,
            });
        }

        entry.1 += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl ManualClock {
        fn set(&self, t: i64) {
            self.0.store(t, Ordering::SeqCst);
        }
    }

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let clock = Arc::new(ManualClock(AtomicI64::new(100)));
        let limiter = FixedWindowLimiter::new(60, clock);

        for _ in 0..3 {
            limiter.check("t1", 3).unwrap();
        }
        assert!(matches!(
            limiter.check("t1", 3),
            Err(ServiceError::RateLimited { limit: 3, .. })
        ));
    }

    #[test]
    fn window_rollover_resets_count() {
        let clock = Arc::new(ManualClock(AtomicI64::new(100)));
        let limiter = FixedWindowLimiter::new(60, clock.clone());

        limiter.check("t1", 1).unwrap();
        assert!(limiter.check("t1", 1).is_err());

        // 100 is in window [60, 120); 120 starts the next one.
        clock.set(120);
        limiter.check("t1", 1).unwrap();
    }

    #[test]
    fn tenants_are_counted_separately() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let limiter = FixedWindowLimiter::new(60, clock);

        limiter.check("t1", 1).unwrap();
        limiter.check("t2", 1).unwrap();
        assert!(limiter.check("t1", 1).is_err());
        assert!(limiter.check("t2", 1).is_err());
    }

    #[test]
    fn rejected_request_is_not_counted() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let limiter = FixedWindowLimiter::new(60, clock.clone());

        limiter.check("t1", 2).unwrap();
        limiter.check("t1", 2).unwrap();
        for _ in 0..5 {
            assert!(limiter.check("t1", 2).is_err());
        }
        clock.set(60);
        limiter.check("t1", 2).unwrap();
        limiter.check("t1", 2).unwrap();
    }
}
