use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::buffer_pool::BufferPool;

#[derive(Debug, Clone)]
pub struct ProducerMetrics {
    registry: Registry,
    buffer_total_bytes: IntGauge,
    buffer_available_bytes: IntGauge,
    waiting_threads: IntGauge,
    expired_batches_total: IntCounter,
}

impl ProducerMetrics {
    pub fn new() -> Result<Self, String> {
        let registry =
            Registry::new_custom(Some("kiln".to_string()), None).map_err(|err| err.to_string())?;

        let buffer_total_bytes = IntGauge::with_opts(Opts::new(
            "producer_buffer_total_bytes",
            "The maximum amount of buffer memory the producer can use",
        ))
        .map_err(|err| err.to_string())?;
        let buffer_available_bytes = IntGauge::with_opts(Opts::new(
            "producer_buffer_available_bytes",
            "Buffer memory not currently held by batches",
        ))
        .map_err(|err| err.to_string())?;
        let waiting_threads = IntGauge::with_opts(Opts::new(
            "producer_waiting_threads",
            "Threads blocked waiting for buffer memory",
        ))
        .map_err(|err| err.to_string())?;
        let expired_batches_total = IntCounter::with_opts(Opts::new(
            "producer_expired_batches_total",
            "Batches expired in the accumulator before they could be sent",
        ))
        .map_err(|err| err.to_string())?;

        registry
            .register(Box::new(buffer_total_bytes.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(buffer_available_bytes.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(waiting_threads.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(expired_batches_total.clone()))
            .map_err(|err| err.to_string())?;

        Ok(Self {
            registry,
            buffer_total_bytes,
            buffer_available_bytes,
            waiting_threads,
            expired_batches_total,
        })
    }

    pub fn observe_pool(&self, pool: &BufferPool) {
        self.buffer_total_bytes
            .set(i64::try_from(pool.total_memory()).unwrap_or(i64::MAX));
        self.buffer_available_bytes
            .set(i64::try_from(pool.available_memory()).unwrap_or(i64::MAX));
        self.waiting_threads
            .set(i64::try_from(pool.queued()).unwrap_or(i64::MAX));
    }

    pub fn record_expired_batches(&self, count: usize) {
        self.expired_batches_total
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    pub fn render_prometheus(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut output = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut output)
            .map_err(|err| err.to_string())?;
        String::from_utf8(output).map_err(|err| err.to_string())
    }
}
