use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Work queue metrics, labeled by queue.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    adds: Family<QueueLabels, Counter>,
    depth: Family<QueueLabels, Gauge>,
    retries: Family<QueueLabels, Counter>,
    dropped: Family<QueueLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    adds: Counter,
    depth: Gauge,
    retries: Counter,
    dropped: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct QueueLabels {
    queue: &'static str,
}

// === ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let adds = Family::<QueueLabels, Counter>::default();
        reg.register("adds", "Total number of keys added to a queue", adds.clone());

        let depth = Family::<QueueLabels, Gauge>::default();
        reg.register(
            "depth",
            "Number of keys waiting to be processed, including in-flight keys that were re-added",
            depth.clone(),
        );

        let retries = Family::<QueueLabels, Counter>::default();
        reg.register(
            "retries",
            "Total number of keys requeued after a failed sync",
            retries.clone(),
        );

        let dropped = Family::<QueueLabels, Counter>::default();
        reg.register(
            "dropped",
            "Total number of keys dropped after exhausting their retries",
            dropped.clone(),
        );

        Self {
            adds,
            depth,
            retries,
            dropped,
        }
    }

    pub fn queue(&self, queue: &'static str) -> QueueMetrics {
        let labels = QueueLabels { queue };
        QueueMetrics {
            adds: self.adds.get_or_create(&labels).clone(),
            depth: self.depth.get_or_create(&labels).clone(),
            retries: self.retries.get_or_create(&labels).clone(),
            dropped: self.dropped.get_or_create(&labels).clone(),
        }
    }
}

// === QueueMetrics ===

impl QueueMetrics {
    pub(crate) fn add(&self) {
        self.adds.inc();
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        self.depth.set(depth as i64);
    }

    pub(crate) fn retry(&self) {
        self.retries.inc();
    }

    pub(crate) fn drop_key(&self) {
        self.dropped.inc();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    pub fn retries(&self) -> u64 {
        self.retries.get()
    }

    pub fn depth(&self) -> i64 {
        self.depth.get()
    }
}
