use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::CleanerStats;

#[derive(Debug, Clone)]
pub struct CleanerMetrics {
    registry: Registry,
    cycles_total: IntCounterVec,
    bytes_read_total: IntCounter,
    bytes_written_total: IntCounter,
    records_read_total: IntCounter,
    records_retained_total: IntCounter,
}

impl CleanerMetrics {
    pub fn new() -> Result<Self, String> {
        let registry =
            Registry::new_custom(Some("kiln".to_string()), None).map_err(|err| err.to_string())?;

        let cycles_total = IntCounterVec::new(
            Opts::new(
                "cleaner_cycles_total",
                "Completed cleaning cycles by result",
            ),
            &["result"],
        )
        .map_err(|err| err.to_string())?;
        let bytes_read_total = IntCounter::with_opts(Opts::new(
            "cleaner_bytes_read_total",
            "Bytes read from source segments across all cleaning cycles",
        ))
        .map_err(|err| err.to_string())?;
        let bytes_written_total = IntCounter::with_opts(Opts::new(
            "cleaner_bytes_written_total",
            "Bytes written into cleaned segments across all cleaning cycles",
        ))
        .map_err(|err| err.to_string())?;
        let records_read_total = IntCounter::with_opts(Opts::new(
            "cleaner_records_read_total",
            "Records examined across all cleaning cycles",
        ))
        .map_err(|err| err.to_string())?;
        let records_retained_total = IntCounter::with_opts(Opts::new(
            "cleaner_records_retained_total",
            "Records carried into cleaned segments across all cleaning cycles",
        ))
        .map_err(|err| err.to_string())?;

        registry
            .register(Box::new(cycles_total.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(bytes_read_total.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(bytes_written_total.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(records_read_total.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(records_retained_total.clone()))
            .map_err(|err| err.to_string())?;

        Ok(Self {
            registry,
            cycles_total,
            bytes_read_total,
            bytes_written_total,
            records_read_total,
            records_retained_total,
        })
    }

    pub fn record_cycle(&self, result: &str) {
        self.cycles_total.with_label_values(&[result]).inc();
    }

    pub fn record_stats(&self, stats: &CleanerStats) {
        self.bytes_read_total.inc_by(stats.bytes_read);
        self.bytes_written_total.inc_by(stats.bytes_written);
        self.records_read_total.inc_by(stats.records_read);
        self.records_retained_total.inc_by(stats.records_retained);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_payload_with_expected_metrics() {
        let metrics = CleanerMetrics::new().expect("metrics");
        metrics.record_cycle("completed");
        metrics.record_stats(&CleanerStats {
            bytes_read: 1024,
            bytes_written: 512,
            records_read: 10,
            records_retained: 6,
            map_utilization: 0.1,
        });

        let rendered = metrics.render_prometheus().expect("render");
        assert!(rendered.contains("kiln_cleaner_cycles_total"));
        assert!(rendered.contains("kiln_cleaner_bytes_read_total"));
        assert!(rendered.contains("kiln_cleaner_records_retained_total"));
    }
}
