//! Host-level admission control
//!
//! The handler only needs a yes/no answer per request; the token bucket
//! itself comes from `governor`.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use parking_lot::RwLock;

/// Admission check consulted by every handler entry point
pub trait RateLimiter: Send + Sync {
    /// Whether the current request may proceed
    fn allow(&self) -> bool;
}

/// Source of the current rate, re-read on every check
pub type RpsFn = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Token bucket whose rate can change at runtime
///
/// The bucket is rebuilt whenever the rate reported by the rate function
/// changes. Burst equals one second worth of requests.
pub struct DynamicRateLimiter {
    rps: RpsFn,
    current: RwLock<(u32, Arc<DefaultDirectRateLimiter>)>,
}

impl DynamicRateLimiter {
    pub fn new(rps: RpsFn) -> Self {
        let initial = rps();
        Self {
            rps,
            current: RwLock::new((initial, Arc::new(build_limiter(initial)))),
        }
    }

    /// Limiter with a fixed rate
    pub fn fixed(rps: u32) -> Self {
        Self::new(Arc::new(move || rps))
    }

    fn limiter(&self) -> Arc<DefaultDirectRateLimiter> {
        let rps = (self.rps)();
        {
            let current = self.current.read();
            if current.0 == rps {
                return Arc::clone(&current.1);
            }
        }

        let mut current = self.current.write();
        if current.0 != rps {
            *current = (rps, Arc::new(build_limiter(rps)));
        }
        Arc::clone(&current.1)
    }
}

impl RateLimiter for DynamicRateLimiter {
    fn allow(&self) -> bool {
        self.limiter().check().is_ok()
    }
}

impl std::fmt::Debug for DynamicRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRateLimiter")
            .field("rps", &self.current.read().0)
            .finish()
    }
}

fn build_limiter(rps: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(rps).unwrap_or(NonZeroU32::MIN);
    GovernorLimiter::direct(Quota::per_second(rate).allow_burst(rate))
}

/// Limiter with a switchable answer, counting how often it was consulted
#[derive(Debug)]
pub struct FixedRateLimiter {
    allow: AtomicBool,
    checks: AtomicU64,
}

impl FixedRateLimiter {
    pub fn allowing() -> Self {
        Self {
            allow: AtomicBool::new(true),
            checks: AtomicU64::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            allow: AtomicBool::new(false),
            checks: AtomicU64::new(0),
        }
    }

    pub fn set_allow(&self, allow: bool) {
        self.allow.store(allow, Ordering::SeqCst);
    }

    /// Number of `allow` calls so far
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl RateLimiter for FixedRateLimiter {
    fn allow(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.allow.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_burst_then_refuse() {
        let limiter = DynamicRateLimiter::fixed(5);
        let admitted = (0..20).filter(|_| limiter.allow()).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_rate_change_rebuilds_bucket() {
        let rate = Arc::new(AtomicU32::new(1));
        let source = Arc::clone(&rate);
        let limiter = DynamicRateLimiter::new(Arc::new(move || source.load(Ordering::SeqCst)));

        assert!(limiter.allow());
        assert!(!limiter.allow());

        rate.store(3, Ordering::SeqCst);
        let admitted = (0..10).filter(|_| limiter.allow()).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_zero_rate_still_admits_one() {
        let limiter = DynamicRateLimiter::fixed(0);
        assert!(limiter.allow());
    }

    #[test]
    fn test_fixed_limiter() {
        let limiter = FixedRateLimiter::denying();
        assert!(!limiter.allow());
        limiter.set_allow(true);
        assert!(limiter.allow());
        assert_eq!(limiter.checks(), 2);
    }
}
