use {
    super::{RegistryGateway, RegistryResult},
    crate::identifier::Identifier,
    prometheus::{HistogramVec, IntCounterVec},
    std::time::{Duration, Instant},
    tracing::Instrument,
};

/// A registry gateway that records the outcome and latency of every call.
pub struct InstrumentedGateway<T> {
    inner: T,
    name: String,
    metrics: &'static Metrics,
}

impl<T> InstrumentedGateway<T> {
    pub fn new(inner: T, name: String) -> Self {
        let metrics = Metrics::instance(observe::metrics::get_storage_registry()).unwrap();
        for result in [
            "found",
            "not_found",
            "timeout",
            "transport_error",
            "malformed_response",
        ] {
            metrics
                .registry_checks
                .with_label_values(&[name.as_str(), result])
                .reset();
        }
        Self {
            inner,
            name,
            metrics,
        }
    }
}

#[async_trait::async_trait]
impl<T: RegistryGateway> RegistryGateway for InstrumentedGateway<T> {
    async fn check(&self, identifier: Identifier, deadline: Duration) -> RegistryResult {
        async {
            let start = Instant::now();
            let result = self.inner.check(identifier, deadline).await;
            self.metrics
                .registry_check_seconds
                .with_label_values(&[self.name.as_str()])
                .observe(start.elapsed().as_secs_f64());
            self.metrics
                .registry_checks
                .with_label_values(&[self.name.as_str(), result.label()])
                .inc();
            tracing::debug!(result = result.label(), elapsed = ?start.elapsed(), "registry check");
            result
        }
        .instrument(tracing::info_span!("registry", name = &self.name, %identifier))
        .await
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Registry checks by gateway and result.
    #[metric(labels("gateway", "result"))]
    registry_checks: IntCounterVec,

    /// Registry check latency.
    #[metric(labels("gateway"))]
    registry_check_seconds: HistogramVec,
}
