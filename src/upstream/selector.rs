use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;

const WEIGHT_CACHE_TTL: Duration = Duration::from_secs(5);
const NOISE_FACTOR: f64 = 0.125;
const ERROR_PENALTY_MULT: f64 = 8.0;
const DEFAULT_LATENCY_MS: f64 = 10.0;

/// Performance counters a selector entry must expose.
pub trait SelectorEntry: Send + Sync {
    fn ema_latency_ms(&self) -> u64;
    fn query_count(&self) -> u64;
    fn error_count(&self) -> u64;
}

struct CachedOrder {
    order: Vec<usize>,
    updated_at: Instant,
}

/// Weighted random sampler over a fixed set of upstreams.
///
/// Scores favor low EMA latency and low error rate, with a small random
/// noise term so slower upstreams still get sampled and re-measured.
/// The computed order is cached briefly to keep the hot path cheap.
pub struct UpstreamSelector<E: SelectorEntry> {
    entries: Vec<Arc<E>>,
    cache: RwLock<Option<CachedOrder>>,
}

impl<E: SelectorEntry> UpstreamSelector<E> {
    pub fn new(entries: Vec<Arc<E>>) -> Self {
        Self {
            entries,
            cache: RwLock::new(None),
        }
    }

    /// Pick `count` distinct upstream indices, best-scoring first in
    /// expectation. Asking for every entry returns natural order.
    pub fn select(&self, count: usize) -> Vec<usize> {
        if self.entries.len() <= count {
            return (0..self.entries.len()).collect();
        }

        if let Some(order) = self.cached(count) {
            return order;
        }

        let mut cache = self.cache.write();
        // Another caller may have refreshed the cache while we waited.
        if let Some(cached) = cache.as_ref() {
            if cached.updated_at.elapsed() < WEIGHT_CACHE_TTL && cached.order.len() >= count {
                return cached.order[..count].to_vec();
            }
        }

        let selected = self.sample(count);
        *cache = Some(CachedOrder {
            order: selected.clone(),
            updated_at: Instant::now(),
        });
        selected
    }

    fn cached(&self, count: usize) -> Option<Vec<usize>> {
        let cache = self.cache.read();
        let cached = cache.as_ref()?;
        if cached.updated_at.elapsed() < WEIGHT_CACHE_TTL && cached.order.len() >= count {
            return Some(cached.order[..count].to_vec());
        }
        None
    }

    /// One uncached weighted sampling pass. [`select`](Self::select) is the
    /// cached entry point.
    pub fn sample(&self, count: usize) -> Vec<usize> {
        let scores = self.calculate_scores();
        let mut total_weight: f64 = scores.iter().map(|(_, s)| s).sum();

        let mut rng = rand::thread_rng();
        let mut selected = Vec::with_capacity(count);
        let mut used = vec![false; scores.len()];

        while selected.len() < count {
            let r = rng.gen::<f64>() * total_weight;
            let mut cumulative = 0.0;

            for &(idx, score) in &scores {
                if used[idx] {
                    continue;
                }
                cumulative += score;
                if r <= cumulative {
                    selected.push(idx);
                    used[idx] = true;
                    total_weight -= score;
                    break;
                }
            }
        }

        selected
    }

    fn calculate_scores(&self) -> Vec<(usize, f64)> {
        let mut rng = rand::thread_rng();

        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let mut latency = entry.ema_latency_ms() as f64;
                if latency == 0.0 {
                    latency = DEFAULT_LATENCY_MS;
                }

                let queries = entry.query_count();
                let error_rate = if queries > 0 {
                    entry.error_count() as f64 / queries as f64
                } else {
                    0.0
                };

                let noise = (rng.gen::<f64>() * 2.0 - 1.0) * NOISE_FACTOR;
                let penalty = 1.0 + error_rate * ERROR_PENALTY_MULT;
                let score = (1.0 / (latency * penalty)) * (1.0 + noise);

                (idx, score)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct StubEntry {
        ema: AtomicU64,
        queries: AtomicU64,
        errors: AtomicU64,
    }

    impl StubEntry {
        fn with_latency(ms: u64) -> Arc<Self> {
            let e = Self::default();
            e.ema.store(ms, Ordering::Relaxed);
            Arc::new(e)
        }
    }

    impl SelectorEntry for StubEntry {
        fn ema_latency_ms(&self) -> u64 {
            self.ema.load(Ordering::Relaxed)
        }
        fn query_count(&self) -> u64 {
            self.queries.load(Ordering::Relaxed)
        }
        fn error_count(&self) -> u64 {
            self.errors.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn test_select_all_is_natural_order() {
        let selector = UpstreamSelector::new(vec![
            StubEntry::with_latency(50),
            StubEntry::with_latency(100),
        ]);
        assert_eq!(selector.select(2), vec![0, 1]);
        assert_eq!(selector.select(5), vec![0, 1]);
    }

    #[test]
    fn test_selected_indices_are_distinct() {
        let selector = UpstreamSelector::new(vec![
            StubEntry::with_latency(10),
            StubEntry::with_latency(20),
            StubEntry::with_latency(30),
            StubEntry::with_latency(40),
        ]);

        let picked = selector.select(3);
        assert_eq!(picked.len(), 3);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
        assert!(picked.iter().all(|&i| i < 4));
    }

    #[test]
    fn test_cached_order_is_reused() {
        let selector = UpstreamSelector::new(vec![
            StubEntry::with_latency(10),
            StubEntry::with_latency(20),
            StubEntry::with_latency(30),
        ]);

        let first = selector.select(2);
        for _ in 0..20 {
            assert_eq!(selector.select(2), first);
        }
        // A larger request must not reuse the shorter cached order.
        assert_eq!(selector.select(3).len(), 3);
    }

    #[test]
    fn test_error_rate_penalizes_score() {
        let good = StubEntry::with_latency(100);
        good.queries.store(100, Ordering::Relaxed);

        let bad = StubEntry::with_latency(100);
        bad.queries.store(100, Ordering::Relaxed);
        bad.errors.store(100, Ordering::Relaxed);

        let selector = UpstreamSelector::new(vec![good, bad]);
        let scores = selector.calculate_scores();
        assert!(scores[0].1 > scores[1].1);
    }
}
