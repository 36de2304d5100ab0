use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Bounds and backoff cap for [`AdaptiveTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub base_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub congestion_mult: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(2),
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(30),
            congestion_mult: 4.0,
        }
    }
}

impl TimeoutConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.base_timeout.is_zero() {
            self.base_timeout = defaults.base_timeout;
        }
        if self.min_timeout.is_zero() {
            self.min_timeout = defaults.min_timeout;
        }
        if self.max_timeout.is_zero() {
            self.max_timeout = defaults.max_timeout;
        }
        if self.congestion_mult <= 1.0 {
            self.congestion_mult = defaults.congestion_mult;
        }
        self
    }
}

struct Estimator {
    srtt: Duration,
    rttvar: Duration,
}

/// RTT estimator in the style of RFC 6298, with a multiplicative backoff
/// under consecutive timeouts.
pub struct AdaptiveTimeout {
    config: TimeoutConfig,
    estimator: RwLock<Estimator>,
    samples: AtomicU64,
    consecutive_timeouts: AtomicU64,
}

impl AdaptiveTimeout {
    pub fn new(config: TimeoutConfig) -> Self {
        let config = config.sanitized();
        Self {
            estimator: RwLock::new(Estimator {
                srtt: config.base_timeout,
                rttvar: config.base_timeout / 2,
            }),
            config,
            samples: AtomicU64::new(0),
            consecutive_timeouts: AtomicU64::new(0),
        }
    }

    /// Feed a successful round-trip sample.
    pub fn record_success(&self, duration: Duration) {
        let mut est = self.estimator.write();
        self.consecutive_timeouts.store(0, Ordering::Relaxed);

        if self.samples.load(Ordering::Relaxed) == 0 {
            est.srtt = duration;
            est.rttvar = duration / 2;
        } else {
            let d = duration.as_secs_f64();
            let srtt = est.srtt.as_secs_f64();
            let new_srtt = (1.0 - ALPHA) * srtt + ALPHA * d;
            let deviation = (d - new_srtt).abs();
            let rttvar = est.rttvar.as_secs_f64();
            est.srtt = Duration::from_secs_f64(new_srtt);
            est.rttvar = Duration::from_secs_f64((1.0 - BETA) * rttvar + BETA * deviation);
        }

        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed a timeout. Three or more in a row inflate the estimate, capped
    /// at `congestion_mult`.
    pub fn record_timeout(&self) {
        let mut est = self.estimator.write();
        let count = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;

        if count >= 3 {
            let multiplier = self
                .config
                .congestion_mult
                .min(1.0 + count as f64 * 0.5);
            est.srtt = Duration::from_secs_f64(est.srtt.as_secs_f64() * multiplier);
        }
    }

    /// Current timeout: `srtt + 4 * rttvar`, clamped to `[min, max]`.
    pub fn timeout(&self) -> Duration {
        let est = self.estimator.read();
        let timeout = est.srtt + 4 * est.rttvar;
        if timeout < self.config.min_timeout {
            return self.config.min_timeout;
        }
        if timeout > self.config.max_timeout {
            return self.config.max_timeout;
        }
        timeout
    }

    pub fn reset(&self) {
        let mut est = self.estimator.write();
        est.srtt = self.config.base_timeout;
        est.rttvar = self.config.base_timeout / 2;
        self.samples.store(0, Ordering::Relaxed);
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    /// `(srtt, rttvar, samples, consecutive_timeouts)`
    pub fn stats(&self) -> (Duration, Duration, u64, u64) {
        let est = self.estimator.read();
        (
            est.srtt,
            est.rttvar,
            self.samples.load(Ordering::Relaxed),
            self.consecutive_timeouts.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_srtt() {
        let t = AdaptiveTimeout::new(TimeoutConfig::default());
        t.record_success(Duration::from_millis(100));

        let (srtt, rttvar, samples, _) = t.stats();
        assert_eq!(srtt, Duration::from_millis(100));
        assert_eq!(rttvar, Duration::from_millis(50));
        assert_eq!(samples, 1);
    }

    #[test]
    fn test_timeout_clamped_to_bounds() {
        let t = AdaptiveTimeout::new(TimeoutConfig::default());
        // Tiny samples clamp to min.
        t.record_success(Duration::from_millis(1));
        t.record_success(Duration::from_millis(1));
        assert_eq!(t.timeout(), Duration::from_millis(500));

        // Backoff never exceeds max.
        for _ in 0..50 {
            t.record_timeout();
        }
        assert!(t.timeout() <= Duration::from_secs(30));
    }

    #[test]
    fn test_congestion_backoff_needs_three_timeouts() {
        let t = AdaptiveTimeout::new(TimeoutConfig::default());
        t.record_success(Duration::from_secs(1));

        t.record_timeout();
        t.record_timeout();
        let (srtt_before, ..) = t.stats();
        assert_eq!(srtt_before, Duration::from_secs(1));

        t.record_timeout();
        let (srtt_after, ..) = t.stats();
        assert!(srtt_after > srtt_before);
    }

    #[test]
    fn test_success_clears_consecutive_timeouts() {
        let t = AdaptiveTimeout::new(TimeoutConfig::default());
        t.record_timeout();
        t.record_timeout();
        t.record_success(Duration::from_millis(50));
        let (.., timeouts) = t.stats();
        assert_eq!(timeouts, 0);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let config = TimeoutConfig::default();
        let t = AdaptiveTimeout::new(config);
        t.record_success(Duration::from_millis(42));
        t.record_timeout();
        t.reset();

        let (srtt, rttvar, samples, timeouts) = t.stats();
        assert_eq!(srtt, config.base_timeout);
        assert_eq!(rttvar, config.base_timeout / 2);
        assert_eq!(samples, 0);
        assert_eq!(timeouts, 0);
    }

    #[test]
    fn test_config_sanitized() {
        let t = AdaptiveTimeout::new(TimeoutConfig {
            base_timeout: Duration::ZERO,
            min_timeout: Duration::ZERO,
            max_timeout: Duration::ZERO,
            congestion_mult: 0.5,
        });
        assert_eq!(t.timeout(), Duration::from_secs(6));
        assert_eq!(t.config.congestion_mult, 4.0);
    }
}
