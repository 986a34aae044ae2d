use {
    axum::{Router, http::StatusCode, routing::get},
    prometheus::Encoder,
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{Arc, OnceLock},
    },
    tokio::task::{self, JoinHandle},
};

/// Global metrics registry used by all components.
static REGISTRY: OnceLock<prometheus_metric_storage::StorageRegistry> = OnceLock::new();

/// Configure global metrics registry.
///
/// This function allows specifying common prefix that will be added
/// to all metric names, as well as common labels.
///
/// This function can be called at most once, and it should be done before
/// any call to [`get_registry`], ideally in the very beginning
/// of the `main` function.
///
/// # Panics
///
/// This function panics if it's called twice, or if it's called after
/// any call to [`get_registry`]. This function also panics if registry
/// configuration is invalid.
pub fn setup_registry(prefix: Option<String>, labels: Option<HashMap<String, String>>) {
    let registry = prometheus::Registry::new_custom(prefix, labels).unwrap();
    let storage_registry = prometheus_metric_storage::StorageRegistry::new(registry);
    REGISTRY.set(storage_registry).unwrap();
}

/// Get the global instance of the metrics registry.
pub fn get_registry() -> &'static prometheus::Registry {
    get_storage_registry().registry()
}

/// Get the global instance of the metric storage registry.
///
/// If the registry was not configured with [`setup_registry`] it is
/// initialized with default values, so unit tests don't have to set it up.
pub fn get_storage_registry() -> &'static prometheus_metric_storage::StorageRegistry {
    REGISTRY.get_or_init(prometheus_metric_storage::StorageRegistry::default)
}

pub fn encode(registry: &prometheus::Registry) -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub const DEFAULT_METRICS_PORT: u16 = 9586;

#[async_trait::async_trait]
pub trait LivenessChecking: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// `/metrics` exposing encoded prometheus data to the monitoring system and
/// `/liveness` reporting the given liveness check.
pub fn router(liveness: Arc<dyn LivenessChecking>) -> Router {
    Router::new()
        .route("/metrics", get(|| async { encode(get_registry()) }))
        .route(
            "/liveness",
            get(move || async move {
                if liveness.is_alive().await {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        )
}

pub fn serve_metrics(liveness: Arc<dyn LivenessChecking>, address: SocketAddr) -> JoinHandle<()> {
    let app = router(liveness);
    task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(?err, %address, "failed to bind metrics server");
                return;
            }
        };
        tracing::info!(%address, "serving metrics");
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(?err, "metrics server failed");
        }
    })
}
