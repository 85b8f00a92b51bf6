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
    http_requests_total: IntCounterVec,
    uploads_total: IntCounterVec,
    payments_total: IntCounterVec,
    settle_ms: HistogramVec,
    quote_ms: HistogramVec,
    multipart_finalize_total: IntCounterVec,
}

impl Telemetry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("bundler_http_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )
        .expect("metric");
        let uploads_total = IntCounterVec::new(
            Opts::new("bundler_uploads_total", "Uploads by kind and outcome"),
            &["kind", "outcome"],
        )
        .expect("metric");
        let payments_total = IntCounterVec::new(
            Opts::new("bundler_payments_total", "Settled payments by mode and outcome"),
            &["mode", "outcome"],
        )
        .expect("metric");
        let settle_ms = HistogramVec::new(
            HistogramOpts::new("bundler_settle_ms", "Facilitator settlement runtime")
                .buckets(vec![50.0, 200.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0]),
            &["status"],
        )
        .expect("metric");
        let quote_ms = HistogramVec::new(
            HistogramOpts::new("bundler_quote_ms", "Price quote runtime")
                .buckets(vec![1.0, 5.0, 25.0, 100.0, 500.0, 2000.0]),
            &["status"],
        )
        .expect("metric");
        let multipart_finalize_total = IntCounterVec::new(
            Opts::new(
                "bundler_multipart_finalize_total",
                "Multipart finalize attempts by outcome",
            ),
            &["outcome"],
        )
        .expect("metric");

        for collector in [
            &http_requests_total,
            &uploads_total,
            &payments_total,
            &multipart_finalize_total,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("register metric");
        }
        registry
            .register(Box::new(settle_ms.clone()))
            .expect("register metric");
        registry
            .register(Box::new(quote_ms.clone()))
            .expect("register metric");

        Self {
            inner: Arc::new(Inner {
                registry,
                http_requests_total,
                uploads_total,
                payments_total,
                settle_ms,
                quote_ms,
                multipart_finalize_total,
            }),
        }
    }

    pub fn http_request(&self, route: &str, status: u16) {
        self.inner
            .http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    pub fn upload(&self, kind: &'static str, outcome: &'static str) {
        self.inner
            .uploads_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn payment(&self, mode: &str, outcome: &'static str) {
        self.inner
            .payments_total
            .with_label_values(&[mode, outcome])
            .inc();
    }

    pub fn settle_ms(&self, ok: bool, ms: u64) {
        self.inner
            .settle_ms
            .with_label_values(&[if ok { "ok" } else { "err" }])
            .observe(ms as f64);
    }

    pub fn quote_ms(&self, ok: bool, ms: u64) {
        self.inner
            .quote_ms
            .with_label_values(&[if ok { "ok" } else { "err" }])
            .observe(ms as f64);
    }

    pub fn multipart_finalize(&self, outcome: &'static str) {
        self.inner
            .multipart_finalize_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Prometheus text exposition for `GET /bundler_metrics`.
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
    fn counters_show_up_in_text_exposition() {
        let t = Telemetry::new();
        t.http_request("/health", 200);
        t.upload("signed", "ok");
        t.payment("payg", "settled");
        t.settle_ms(true, 420);
        t.multipart_finalize("fraud");

        let text = t.encode();
        assert!(text.contains("bundler_http_requests_total"));
        assert!(text.contains("bundler_uploads_total"));
        assert!(text.contains("bundler_payments_total"));
        assert!(text.contains("bundler_settle_ms"));
        assert!(text.contains("bundler_multipart_finalize_total"));
    }
}
