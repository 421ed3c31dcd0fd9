//! Per-endpoint latency and result-code metrics.

use crate::error::Code;
use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Latencies above this are clamped; it bounds histogram memory.
const MAX_LATENCY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    service: String,
    endpoint: String,
    code: Code,
}

/// A snapshot of one `(service, endpoint, code)` series.
#[derive(Debug, Clone)]
pub struct EndpointStat {
    pub service: String,
    pub endpoint: String,
    pub code: Code,
    pub count: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

/// Process-wide registry of endpoint latency histograms.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    series: Mutex<HashMap<Key, Histogram<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, service: &str, endpoint: &str, code: Code, latency: Duration) {
        let nanos = (latency.min(MAX_LATENCY).as_nanos() as u64).max(1);
        let key = Key {
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            code,
        };
        let mut series = self.series.lock().expect("metrics poisoned");
        let hist = series.entry(key).or_insert_with(|| {
            Histogram::new_with_bounds(1, MAX_LATENCY.as_nanos() as u64, 2)
                .expect("histogram bounds are static")
        });
        hist.saturating_record(nanos);
    }

    pub fn snapshot(&self) -> Vec<EndpointStat> {
        let series = self.series.lock().expect("metrics poisoned");
        let mut out: Vec<_> = series
            .iter()
            .map(|(key, hist)| EndpointStat {
                service: key.service.clone(),
                endpoint: key.endpoint.clone(),
                code: key.code,
                count: hist.len(),
                p50_ns: hist.value_at_quantile(0.5),
                p99_ns: hist.value_at_quantile(0.99),
                max_ns: hist.max(),
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.service, &a.endpoint, a.code as u8).cmp(&(&b.service, &b.endpoint, b.code as u8))
        });
        out
    }
}
