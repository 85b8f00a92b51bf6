use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    jobs_total: IntCounterVec,
    job_ms: HistogramVec,
    bundle_transitions_total: IntCounterVec,
    repacked_items_total: IntCounterVec,
    janitor_deletes_total: IntCounterVec,
}

impl Telemetry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("bundler_jobs_total", "Job runs by queue and outcome"),
            &["queue", "outcome"],
        )
        .expect("metric");
        let job_ms = HistogramVec::new(
            HistogramOpts::new("bundler_job_ms", "Per-job runtime")
                .buckets(vec![5.0, 50.0, 250.0, 1000.0, 5000.0, 30000.0, 300000.0]),
            &["queue"],
        )
        .expect("metric");
        let bundle_transitions_total = IntCounterVec::new(
            Opts::new(
                "bundler_bundle_transitions_total",
                "Bundle state transitions",
            ),
            &["to"],
        )
        .expect("metric");
        let repacked_items_total = IntCounterVec::new(
            Opts::new(
                "bundler_repacked_items_total",
                "Data items re-packed or given up after bundle failure",
            ),
            &["outcome"],
        )
        .expect("metric");
        let janitor_deletes_total = IntCounterVec::new(
            Opts::new("bundler_janitor_deletes_total", "Retention deletes by tier"),
            &["tier", "outcome"],
        )
        .expect("metric");

        for collector in [
            &jobs_total,
            &bundle_transitions_total,
            &repacked_items_total,
            &janitor_deletes_total,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("register metric");
        }
        registry
            .register(Box::new(job_ms.clone()))
            .expect("register metric");

        Self {
            inner: Arc::new(Inner {
                registry,
                jobs_total,
                job_ms,
                bundle_transitions_total,
                repacked_items_total,
                janitor_deletes_total,
            }),
        }
    }

    pub fn job(&self, queue: &'static str, outcome: &'static str, ms: u64) {
        self.inner
            .jobs_total
            .with_label_values(&[queue, outcome])
            .inc();
        self.inner
            .job_ms
            .with_label_values(&[queue])
            .observe(ms as f64);
    }

    pub fn bundle_transition(&self, to: &'static str) {
        self.inner
            .bundle_transitions_total
            .with_label_values(&[to])
            .inc();
    }

    pub fn repacked(&self, outcome: &'static str, count: u64) {
        self.inner
            .repacked_items_total
            .with_label_values(&[outcome])
            .inc_by(count);
    }

    pub fn janitor_delete(&self, tier: &'static str, ok: bool) {
        self.inner
            .janitor_deletes_total
            .with_label_values(&[tier, if ok { "ok" } else { "err" }])
            .inc();
    }

    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder
            .encode(&self.inner.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_counters_render() {
        let t = Telemetry::new();
        t.job("plan-bundle", "ok", 12);
        t.bundle_transition("posted");
        t.repacked("repacked", 3);
        t.janitor_delete("fs", true);
        let text = t.encode();
        assert!(text.contains("bundler_jobs_total"));
        assert!(text.contains("bundler_bundle_transitions_total"));
        assert!(text.contains("bundler_repacked_items_total"));
        assert!(text.contains("bundler_janitor_deletes_total"));
    }
}
