//! Metrics collector
//!
//! Two instruments per (protocol, action, outcome) label set: a counter
//! incremented by exactly 1 per observed event, and a latency distribution
//! recorded probabilistically. Counters are always exact; the distribution is
//! sampled with ratio `p` to bound storage under high probe volume, using
//! stochastic rounding of `1/p` copies per sampled observation so aggregate
//! latency statistics stay unbiased.
//!
//! A single mutex guards the whole registry, which keeps increments from
//! many concurrent sequences lossless and makes [`MetricsCollector::reset`]
//! atomic for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::ensure;
use rand::Rng;

use crate::{Outcome, Protocol};

/// Upper bounds (inclusive, in milliseconds) of the latency buckets; the
/// final implicit bucket is unbounded.
pub const LATENCY_BUCKET_BOUNDS_MS: [u64; 14] = [
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000,
];

/// Label set for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub protocol: Protocol,

    /// Action name, or [`crate::action::SEQUENCE_LABEL`] for sequence-level samples
    pub action: String,

    pub outcome: Outcome,
}

/// Sampled latency distribution: point count, sum, and bucket counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Distribution {
    pub count: u64,
    pub sum_ms: u64,
    pub buckets: [u64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
}

impl Distribution {
    fn record(&mut self, latency_ms: u64, copies: u64) {
        if copies == 0 {
            return;
        }
        self.count += copies;
        self.sum_ms += latency_ms * copies;

        let index = LATENCY_BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BUCKET_BOUNDS_MS.len());
        self.buckets[index] += copies;
    }

    pub fn mean_ms(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum_ms as f64 / self.count as f64)
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MetricValue {
    events: u64,
    latency: Distribution,
}

/// One exported label set, for the external metrics collaborator.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub key: MetricKey,
    pub count: u64,
    pub latency: Distribution,
}

pub struct MetricsCollector {
    sampling_ratio: f64,
    inner: Mutex<HashMap<MetricKey, MetricValue>>,
}

impl MetricsCollector {
    /// Create a collector with sampling ratio `p` in `(0, 1]`.
    pub fn new(sampling_ratio: f64) -> anyhow::Result<Self> {
        ensure!(
            sampling_ratio > 0.0 && sampling_ratio <= 1.0,
            "sampling ratio must be in (0, 1], got {sampling_ratio}"
        );
        Ok(Self {
            sampling_ratio,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Record one observed event.
    ///
    /// The counter is incremented unconditionally so success/failure rates
    /// are exact; the latency point is subject to sampling.
    pub fn record(&self, protocol: Protocol, action: &str, outcome: Outcome, latency_ms: u64) {
        let copies = self.sampled_copies();

        let key = MetricKey {
            protocol,
            action: action.to_string(),
            outcome,
        };

        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        let value = inner.entry(key).or_default();
        value.events += 1;
        value.latency.record(latency_ms, copies);
    }

    /// How many copies of this observation enter the distribution.
    ///
    /// With probability `p` the observation is kept and written as
    /// `floor(1/p)` or `ceil(1/p)` copies, chosen so the expected number of
    /// recorded points per observation is exactly 1 - the aggregate count
    /// and sum stay unbiased with no scaling needed at read time.
    fn sampled_copies(&self) -> u64 {
        if self.sampling_ratio >= 1.0 {
            return 1;
        }

        let mut rng = rand::rng();
        if rng.random::<f64>() >= self.sampling_ratio {
            return 0;
        }

        let inverse = 1.0 / self.sampling_ratio;
        let whole = inverse.floor();
        let fraction = inverse - whole;
        whole as u64 + u64::from(rng.random::<f64>() < fraction)
    }

    /// Exact event count for a label set.
    pub fn counter(&self, protocol: Protocol, action: &str, outcome: Outcome) -> u64 {
        let key = MetricKey {
            protocol,
            action: action.to_string(),
            outcome,
        };
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .get(&key)
            .map_or(0, |value| value.events)
    }

    /// Latency distribution for a label set, if any points were recorded.
    pub fn distribution(
        &self,
        protocol: Protocol,
        action: &str,
        outcome: Outcome,
    ) -> Option<Distribution> {
        let key = MetricKey {
            protocol,
            action: action.to_string(),
            outcome,
        };
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .get(&key)
            .map(|value| value.latency.clone())
    }

    /// Snapshot of every label set, for the exporter.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .iter()
            .map(|(key, value)| MetricSnapshot {
                key: key.clone(),
                count: value.events,
                latency: value.latency.clone(),
            })
            .collect()
    }

    /// Clear all counters and distributions atomically.
    pub fn reset(&self) {
        self.inner.lock().expect("metrics mutex poisoned").clear();
    }
}
