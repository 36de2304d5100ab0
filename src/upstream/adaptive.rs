use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::Upstream;
use crate::error::Result;

/// Which of the two equivalent HTTPS transports a request went over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Doh,
    Doh3,
}

impl Protocol {
    pub fn other(self) -> Self {
        match self {
            Protocol::Doh => Protocol::Doh3,
            Protocol::Doh3 => Protocol::Doh,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Doh => "doh",
            Protocol::Doh3 => "doh3",
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 0 {
            Protocol::Doh
        } else {
            Protocol::Doh3
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Protocol::Doh => 0,
            Protocol::Doh3 => 1,
        }
    }
}

#[derive(Default)]
struct ProtocolStats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    total_latency_ms: AtomicU64,
    preferred_count: AtomicU64,
    fallback_count: AtomicU64,
}

impl ProtocolStats {
    fn snapshot(&self) -> ProtocolSnapshot {
        ProtocolSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            preferred_count: self.preferred_count.load(Ordering::Relaxed),
            fallback_count: self.fallback_count.load(Ordering::Relaxed),
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.success.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// Point-in-time view of one protocol's counters.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub total_latency_ms: u64,
    pub preferred_count: u64,
    pub fallback_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    /// Reserved for future sliding-window statistics.
    pub sample_size: usize,
    /// DoH3 must be faster than `preference * avg(DoH)` to win the trial.
    pub preference: f64,
    /// Combined exchanges over both transports before the trial evaluates.
    pub trial_count: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            sample_size: 20,
            preference: 0.8,
            trial_count: 10,
        }
    }
}

impl AdaptiveConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.sample_size == 0 {
            self.sample_size = defaults.sample_size;
        }
        if self.preference <= 0.0 || self.preference > 1.0 {
            self.preference = defaults.preference;
        }
        if self.trial_count == 0 {
            self.trial_count = defaults.trial_count;
        }
        self
    }
}

/// Arbitrates between a DoH and a DoH3 exchanger pointed at the same
/// upstream.
///
/// A trial phase strictly alternates the two transports until
/// `trial_count` exchanges have been observed, then a one-shot evaluation
/// picks the preferred transport. In steady state the preferred transport
/// serves all traffic; a failure on it flips the preference when the other
/// transport's overall success rate is strictly better.
pub struct AdaptiveUpstream {
    doh: Arc<dyn Upstream>,
    doh3: Arc<dyn Upstream>,

    preferred: RwLock<Protocol>,
    current: AtomicU8,
    trial_done: AtomicBool,

    doh_stats: ProtocolStats,
    doh3_stats: ProtocolStats,

    config: AdaptiveConfig,
    addr: String,
}

impl AdaptiveUpstream {
    pub fn new(
        doh: Arc<dyn Upstream>,
        doh3: Arc<dyn Upstream>,
        config: AdaptiveConfig,
        addr: String,
    ) -> Self {
        Self {
            doh,
            doh3,
            preferred: RwLock::new(Protocol::Doh),
            current: AtomicU8::new(Protocol::Doh.as_u8()),
            trial_done: AtomicBool::new(false),
            doh_stats: ProtocolStats::default(),
            doh3_stats: ProtocolStats::default(),
            config: config.sanitized(),
            addr,
        }
    }

    pub fn preferred(&self) -> Protocol {
        *self.preferred.read()
    }

    pub fn current(&self) -> Protocol {
        Protocol::from_u8(self.current.load(Ordering::Relaxed))
    }

    pub fn trial_done(&self) -> bool {
        self.trial_done.load(Ordering::Relaxed)
    }

    /// `(doh, doh3)` counter snapshots.
    pub fn stats(&self) -> (ProtocolSnapshot, ProtocolSnapshot) {
        (self.doh_stats.snapshot(), self.doh3_stats.snapshot())
    }

    fn stats_for(&self, protocol: Protocol) -> &ProtocolStats {
        match protocol {
            Protocol::Doh => &self.doh_stats,
            Protocol::Doh3 => &self.doh3_stats,
        }
    }

    fn select_protocol(&self) -> Protocol {
        if !self.trial_done.load(Ordering::Relaxed) {
            // Strict alternation so both transports accumulate samples.
            loop {
                let cur = self.current.load(Ordering::Relaxed);
                let next = Protocol::from_u8(cur).other();
                if self
                    .current
                    .compare_exchange(cur, next.as_u8(), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return next;
                }
            }
        }

        let preferred = self.preferred();
        self.current.store(preferred.as_u8(), Ordering::Relaxed);
        preferred
    }

    fn evaluate_preference(&self) {
        let mut preferred = self.preferred.write();

        if self.trial_done.load(Ordering::Relaxed) {
            return;
        }

        let doh_total = self.doh_stats.total.load(Ordering::Relaxed);
        let doh3_total = self.doh3_stats.total.load(Ordering::Relaxed);
        if doh_total + doh3_total < self.config.trial_count {
            return;
        }

        self.trial_done.store(true, Ordering::Relaxed);

        if doh3_total == 0 {
            *preferred = Protocol::Doh;
            info!("{}: DoH3 not available, using DoH", self.addr);
            return;
        }

        let doh3_failed = self.doh3_stats.failed.load(Ordering::Relaxed);
        let doh3_failure_rate = doh3_failed as f64 / doh3_total as f64;
        if doh3_failure_rate >= 0.5 {
            *preferred = Protocol::Doh;
            info!(
                "{}: DoH3 failure rate {:.2} too high, using DoH",
                self.addr, doh3_failure_rate
            );
            return;
        }

        if doh_total == 0 {
            *preferred = Protocol::Doh3;
            info!("{}: only DoH3 available", self.addr);
            return;
        }

        let doh_avg = self.doh_stats.total_latency_ms.load(Ordering::Relaxed) as f64
            / self.doh_stats.success.load(Ordering::Relaxed) as f64;
        let doh3_avg = self.doh3_stats.total_latency_ms.load(Ordering::Relaxed) as f64
            / self.doh3_stats.success.load(Ordering::Relaxed) as f64;

        if doh3_avg < doh_avg * self.config.preference {
            *preferred = Protocol::Doh3;
            info!(
                "{}: preferring DoH3 ({:.1}ms vs {:.1}ms DoH)",
                self.addr, doh3_avg, doh_avg
            );
        } else {
            *preferred = Protocol::Doh;
            info!(
                "{}: keeping DoH ({:.1}ms vs {:.1}ms DoH3)",
                self.addr, doh_avg, doh3_avg
            );
        }
    }

    /// Steady-state failure accounting: a failure on the preferred
    /// transport flips the preference when the other transport has been
    /// strictly more successful overall.
    fn record_failure(&self, protocol: Protocol) {
        if protocol != self.preferred() {
            return;
        }

        let other = protocol.other();
        let other_stats = self.stats_for(other);
        if other_stats.total.load(Ordering::Relaxed) == 0 {
            return;
        }

        let other_rate = other_stats.success_rate();
        let current_rate = self.stats_for(protocol).success_rate();
        if other_rate > current_rate {
            let mut preferred = self.preferred.write();
            if *preferred == protocol {
                *preferred = other;
                warn!(
                    "{}: switching preferred protocol {} -> {} ({:.2} vs {:.2} success rate)",
                    self.addr,
                    protocol.as_str(),
                    other.as_str(),
                    current_rate,
                    other_rate
                );
            }
        }
    }
}

#[async_trait]
impl Upstream for AdaptiveUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let protocol = self.select_protocol();
        debug!(
            "{}: using {} (preferred {})",
            self.addr,
            protocol.as_str(),
            self.preferred().as_str()
        );

        let start = Instant::now();
        let result = match protocol {
            Protocol::Doh => self.doh.exchange(query).await,
            Protocol::Doh3 => self.doh3.exchange(query).await,
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let stats = self.stats_for(protocol);
        stats.total.fetch_add(1, Ordering::Relaxed);

        match result {
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}: {} query failed after {}ms: {}",
                    self.addr,
                    protocol.as_str(),
                    latency_ms,
                    e
                );
                if self.trial_done.load(Ordering::Relaxed) {
                    self.record_failure(protocol);
                } else {
                    self.evaluate_preference();
                }
                Err(e)
            }
            Ok(response) => {
                stats.success.fetch_add(1, Ordering::Relaxed);
                stats.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

                if !self.trial_done.load(Ordering::Relaxed) {
                    self.evaluate_preference();
                } else if protocol == self.preferred() {
                    stats.preferred_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.fallback_count.fetch_add(1, Ordering::Relaxed);
                }

                Ok(response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DnsError;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedUpstream {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl ScriptedUpstream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail.load(Ordering::Relaxed) {
                Err(DnsError::ExchangeFailed("scripted failure".into()))
            } else {
                Ok(query.to_vec())
            }
        }
    }

    #[tokio::test]
    async fn test_trial_alternates_transports() {
        let doh = ScriptedUpstream::new();
        let doh3 = ScriptedUpstream::new();
        let adaptive = AdaptiveUpstream::new(
            doh.clone(),
            doh3.clone(),
            AdaptiveConfig {
                trial_count: 100,
                ..Default::default()
            },
            "test".into(),
        );

        for _ in 0..8 {
            adaptive.exchange(&[0, 1, 2, 3]).await.unwrap();
        }

        assert_eq!(doh.calls.load(Ordering::Relaxed), 4);
        assert_eq!(doh3.calls.load(Ordering::Relaxed), 4);
        assert!(!adaptive.trial_done());
    }

    #[tokio::test]
    async fn test_trial_evaluates_after_trial_count() {
        let doh = ScriptedUpstream::new();
        let doh3 = ScriptedUpstream::new();
        let adaptive = AdaptiveUpstream::new(
            doh,
            doh3,
            AdaptiveConfig {
                trial_count: 4,
                ..Default::default()
            },
            "test".into(),
        );

        for _ in 0..4 {
            adaptive.exchange(&[0, 1, 2, 3]).await.unwrap();
        }

        assert!(adaptive.trial_done());
    }

    #[tokio::test]
    async fn test_failing_doh3_loses_trial() {
        let doh = ScriptedUpstream::new();
        let doh3 = ScriptedUpstream::new();
        doh3.fail.store(true, Ordering::Relaxed);

        let adaptive = AdaptiveUpstream::new(
            doh,
            doh3,
            AdaptiveConfig {
                trial_count: 4,
                ..Default::default()
            },
            "test".into(),
        );

        for _ in 0..4 {
            let _ = adaptive.exchange(&[0, 1, 2, 3]).await;
        }

        assert!(adaptive.trial_done());
        assert_eq!(adaptive.preferred(), Protocol::Doh);
    }
}
