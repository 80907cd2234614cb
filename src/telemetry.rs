use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Server status gauge values: writable, read-only, not registered.
pub const STATUS_WRITABLE: i64 = 1;
pub const STATUS_READ_ONLY: i64 = 0;
pub const STATUS_UNREGISTERED: i64 = -1;

/// Namespaced in-process metrics: counters, gauges and latency histograms.
///
/// The bookie publishes its statistics surface here; exporting is left to
/// the embedding process.
#[derive(Debug)]
pub struct MetricsRegistry {
    namespace: String,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, i64>,
    histograms: HashMap<String, Histogram>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
            histograms: HashMap::new(),
        }
    }

    pub fn inc_counter(&mut self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_gauge(&mut self, name: &str, value: i64) {
        let key = self.qualify(name);
        self.gauges.insert(key, value);
    }

    /// Records a histogram observation, creating the histogram on first use.
    pub fn observe(&mut self, name: &str, value: u64) {
        let key = self.qualify(name);
        self.histograms
            .entry(key)
            .or_insert_with(|| Histogram::canonical(60_000_000))
            .observe(value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            histograms: self
                .histograms
                .iter()
                .map(|(name, hist)| (name.clone(), hist.counts.clone()))
                .collect(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}.{}", self.namespace, name)
    }
}

/// Bucket histogram; buckets grow by 1.5x up to `max_value`.
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    pub fn canonical(max_value: u64) -> Self {
        let mut buckets = Vec::new();
        let mut current = 1u64;
        while current < max_value {
            buckets.push(current);
            current = (current as f64 * 1.5).ceil() as u64;
        }
        buckets.push(max_value);
        let counts = vec![0; buckets.len()];
        Self { buckets, counts }
    }

    pub fn observe(&mut self, value: u64) {
        match self.buckets.iter().position(|bucket| value <= *bucket) {
            Some(idx) => self.counts[idx] = self.counts[idx].saturating_add(1),
            None => {
                if let Some(last) = self.counts.last_mut() {
                    *last = last.saturating_add(1);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, i64>,
    pub histograms: HashMap<String, Vec<u64>>,
}

/// Thread-shared registry handle injected into bookie components.
#[derive(Debug, Clone)]
pub struct SharedMetricsRegistry {
    inner: Arc<Mutex<MetricsRegistry>>,
}

impl SharedMetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsRegistry::new(namespace))),
        }
    }

    pub fn inc_counter(&self, name: &str, delta: u64) {
        self.inner.lock().inc_counter(name, delta);
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.inner.lock().set_gauge(name, value);
    }

    pub fn observe(&self, name: &str, value: u64) {
        self.inner.lock().observe(name, value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().snapshot()
    }
}
