use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for the buffer pool.
pub(crate) struct Metrics {
    /// Number of live buffers owned by the pool (idle or outstanding).
    pub(crate) allocated: Gauge,
    /// Number of buffers idle in the free-list.
    pub(crate) available: Gauge,
    /// Total number of successful acquisitions.
    pub(crate) acquisitions_total: Counter,
    /// Total number of buffers returned to the free-list.
    pub(crate) recycled_total: Counter,
    /// Total number of buffers deallocated by the pool.
    pub(crate) freed_total: Counter,
    /// Total number of failed acquisitions (pool exhausted).
    pub(crate) exhausted_total: Counter,
    /// Total number of acquisitions rejected while flushing.
    pub(crate) flushing_total: Counter,
}

impl Metrics {
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Gauge::default(),
            available: Gauge::default(),
            acquisitions_total: Counter::default(),
            recycled_total: Counter::default(),
            freed_total: Counter::default(),
            exhausted_total: Counter::default(),
            flushing_total: Counter::default(),
        };

        registry.register(
            "buffer_pool_allocated",
            "Number of live buffers owned by the pool",
            metrics.allocated.clone(),
        );
        registry.register(
            "buffer_pool_available",
            "Number of buffers idle in the pool",
            metrics.available.clone(),
        );
        registry.register(
            "buffer_pool_acquisitions_total",
            "Total number of successful buffer acquisitions",
            metrics.acquisitions_total.clone(),
        );
        registry.register(
            "buffer_pool_recycled_total",
            "Total number of buffers returned to the pool",
            metrics.recycled_total.clone(),
        );
        registry.register(
            "buffer_pool_freed_total",
            "Total number of buffers deallocated by the pool",
            metrics.freed_total.clone(),
        );
        registry.register(
            "buffer_pool_exhausted_total",
            "Total number of failed acquisitions due to pool exhaustion",
            metrics.exhausted_total.clone(),
        );
        registry.register(
            "buffer_pool_flushing_total",
            "Total number of acquisitions rejected while the pool was flushing",
            metrics.flushing_total.clone(),
        );

        metrics
    }
}
