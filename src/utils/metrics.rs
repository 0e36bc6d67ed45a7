use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Pipeline counters exported on the metrics endpoint.
pub struct Metrics {
    registry: Registry,
    pub messages_processed: IntCounter,
    pub messages_failed: IntCounter,
    pub queue_depth: IntGauge,
    pub llm_latency: Histogram,
    pub send_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_processed = IntCounter::new(
            "chatgate_messages_processed_total",
            "Messages processed to completion",
        )?;
        let messages_failed = IntCounter::new(
            "chatgate_messages_failed_total",
            "Messages whose processing failed",
        )?;
        let queue_depth = IntGauge::new(
            "chatgate_queue_depth",
            "Messages waiting across all per-phone queues",
        )?;
        let llm_latency = Histogram::with_opts(
            HistogramOpts::new("chatgate_llm_latency_seconds", "LLM call latency")
                .buckets(vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;
        let send_failures = IntCounterVec::new(
            Opts::new(
                "chatgate_send_failures_total",
                "Outbound send failures by platform",
            ),
            &["platform"],
        )?;

        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(messages_failed.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(llm_latency.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;

        Ok(Self {
            registry,
            messages_processed,
            messages_failed,
            queue_depth,
            llm_latency,
            send_failures,
        })
    }

    /// Prometheus text exposition of all registered collectors.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.messages_processed.inc();
        metrics.queue_depth.set(7);
        metrics
            .send_failures
            .with_label_values(&["whatsapp"])
            .inc();

        let exported = metrics.export().unwrap();
        assert!(exported.contains("chatgate_messages_processed_total 1"));
        assert!(exported.contains("chatgate_queue_depth 7"));
    }
}
