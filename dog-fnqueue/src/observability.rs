use std::sync::atomic::{AtomicU64, Ordering};

/// In-process counters for queue internals. Exporting them is left to the host.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    items_enqueued: AtomicU64,
    items_leased: AtomicU64,
    items_dequeued: AtomicU64,
    items_requeued: AtomicU64,
    lease_contention: AtomicU64,
    peek_leased_skips: AtomicU64,
    outdated_throttles: AtomicU64,
    constraint_hits: AtomicU64,
    denied_without_store: AtomicU64,
    partitions_gone: AtomicU64,
    dangling_pointers: AtomicU64,
    items_scavenged: AtomicU64,
    backlog_refills: AtomicU64,
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub items_enqueued: u64,
    pub items_leased: u64,
    pub items_dequeued: u64,
    pub items_requeued: u64,
    pub lease_contention: u64,
    pub peek_leased_skips: u64,
    pub outdated_throttles: u64,
    pub constraint_hits: u64,
    pub denied_without_store: u64,
    pub partitions_gone: u64,
    pub dangling_pointers: u64,
    pub items_scavenged: u64,
    pub backlog_refills: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(increment_enqueued, items_enqueued);
    counter!(increment_leased, items_leased);
    counter!(increment_dequeued, items_dequeued);
    counter!(increment_requeued, items_requeued);
    counter!(increment_lease_contention, lease_contention);
    counter!(increment_peek_leased_skip, peek_leased_skips);
    counter!(increment_outdated_throttle, outdated_throttles);
    counter!(increment_constraint_hit, constraint_hits);
    counter!(increment_denied_without_store, denied_without_store);
    counter!(increment_partition_gone, partitions_gone);
    counter!(increment_dangling_pointer, dangling_pointers);

    pub fn add_scavenged(&self, n: u64) {
        self.items_scavenged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_backlog_refills(&self, n: u64) {
        self.backlog_refills.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_leased: self.items_leased.load(Ordering::Relaxed),
            items_dequeued: self.items_dequeued.load(Ordering::Relaxed),
            items_requeued: self.items_requeued.load(Ordering::Relaxed),
            lease_contention: self.lease_contention.load(Ordering::Relaxed),
            peek_leased_skips: self.peek_leased_skips.load(Ordering::Relaxed),
            outdated_throttles: self.outdated_throttles.load(Ordering::Relaxed),
            constraint_hits: self.constraint_hits.load(Ordering::Relaxed),
            denied_without_store: self.denied_without_store.load(Ordering::Relaxed),
            partitions_gone: self.partitions_gone.load(Ordering::Relaxed),
            dangling_pointers: self.dangling_pointers.load(Ordering::Relaxed),
            items_scavenged: self.items_scavenged.load(Ordering::Relaxed),
            backlog_refills: self.backlog_refills.load(Ordering::Relaxed),
        }
    }
}

/// Installs a global `tracing` subscriber configured from `RUST_LOG`.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        tracing::debug!("tracing subscriber already installed: {}", err);
    }
}
