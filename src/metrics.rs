use std::collections::HashMap;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

use crate::error::Result;

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

/// Owns the prometheus registry for the process.
pub struct DnsMetrics {
    registry: Registry,
}

impl DnsMetrics {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Build and register the instrument set for one upstream.
    pub fn upstream(&self, tag: &str) -> Result<UpstreamMetrics> {
        let labels: HashMap<String, String> =
            [("upstream".to_string(), tag.to_string())].into_iter().collect();

        let query_total = IntCounter::with_opts(
            Opts::new("query_total", "Total queries sent to this upstream")
                .const_labels(labels.clone()),
        )?;
        let err_total = IntCounter::with_opts(
            Opts::new("err_total", "Total failed queries for this upstream")
                .const_labels(labels.clone()),
        )?;
        let inflight = IntGauge::with_opts(
            Opts::new("inflight", "Queries currently being processed by this upstream")
                .const_labels(labels.clone()),
        )?;
        let response_latency = Histogram::with_opts(
            HistogramOpts::new(
                "response_latency_millisecond",
                "Response latency in milliseconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec())
            .const_labels(labels.clone()),
        )?;
        let used_total = IntCounter::with_opts(
            Opts::new("used_total", "Queries where this upstream's response was used")
                .const_labels(labels),
        )?;

        self.registry.register(Box::new(query_total.clone()))?;
        self.registry.register(Box::new(err_total.clone()))?;
        self.registry.register(Box::new(inflight.clone()))?;
        self.registry.register(Box::new(response_latency.clone()))?;
        self.registry.register(Box::new(used_total.clone()))?;

        Ok(UpstreamMetrics {
            query_total,
            err_total,
            inflight,
            response_latency,
            used_total,
        })
    }
}

impl Default for DnsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-upstream instruments.
#[derive(Clone)]
pub struct UpstreamMetrics {
    pub query_total: IntCounter,
    pub err_total: IntCounter,
    pub inflight: IntGauge,
    pub response_latency: Histogram,
    pub used_total: IntCounter,
}

impl UpstreamMetrics {
    /// Unregistered instruments, for wrappers built outside a metrics context.
    pub fn detached() -> Self {
        Self {
            query_total: IntCounter::new("query_total", "unregistered").unwrap(),
            err_total: IntCounter::new("err_total", "unregistered").unwrap(),
            inflight: IntGauge::new("inflight", "unregistered").unwrap(),
            response_latency: Histogram::with_opts(
                HistogramOpts::new("response_latency_millisecond", "unregistered")
                    .buckets(LATENCY_BUCKETS.to_vec()),
            )
            .unwrap(),
            used_total: IntCounter::new("used_total", "unregistered").unwrap(),
        }
    }
}
