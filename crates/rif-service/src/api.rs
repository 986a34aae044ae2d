use {
    crate::accounts::InMemoryAccounts,
    axum::{
        Router,
        extract::{DefaultBodyLimit, MatchedPath, Request},
        http::StatusCode,
        middleware::{self, Next},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    rif::{InvalidReason, UnavailableCause, Validator},
    serde::{Deserialize, Serialize},
    std::{borrow::Cow, sync::Arc, time::Instant},
    tower_http::{cors::CorsLayer, trace::TraceLayer},
};

mod check_rif;
mod get_account;
mod get_existence;
mod get_taxpayer;
mod post_registration;

/// State shared by all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<Validator>,
    pub accounts: Arc<InMemoryAccounts>,
}

/// Records request counts and latencies per matched route.
async fn with_matched_path_metric(req: Request, next: Next) -> Response {
    let metrics = ApiMetrics::get();

    let method = req.method().as_str();
    let matched_path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str())
        .unwrap_or("unknown");
    let label = format!("{method} {matched_path}");

    let timer = Instant::now();
    let response = next.run(req).await;
    let status = response.status();

    metrics.on_request_completed(&label, status, timer);
    if status.is_client_error() || status.is_server_error() {
        metrics
            .requests_rejected
            .with_label_values(&[status.as_str()])
            .inc();
    }

    response
}

const MAX_JSON_BODY_PAYLOAD: usize = 1024 * 16;

pub fn handle_all_routes(validator: Arc<Validator>, accounts: Arc<InMemoryAccounts>) -> Router {
    let state = Arc::new(AppState {
        validator,
        accounts,
    });

    ApiMetrics::get().reset_requests_rejected();

    let api_router = Router::new()
        .route("/v1/rif/{rif}/check", get(check_rif::check_rif_handler))
        .route(
            "/v1/rif/{rif}/exists",
            get(get_existence::get_existence_handler),
        )
        .route(
            "/v1/rif/{rif}/taxpayer",
            get(get_taxpayer::get_taxpayer_handler),
        )
        .route(
            "/v1/registrations",
            post(post_registration::post_registration_handler),
        )
        .route("/v1/accounts/{rif}", get(get_account::get_account_handler))
        .with_state(state)
        .layer(middleware::from_fn(with_matched_path_metric));

    finalize_router(api_router)
}

#[derive(prometheus_metric_storage::MetricStorage, Clone, Debug)]
#[metric(subsystem = "api")]
struct ApiMetrics {
    /// Number of completed API requests.
    #[metric(labels("method", "status_code"))]
    requests_complete: prometheus::IntCounterVec,

    /// Number of rejected API requests.
    #[metric(labels("status_code"))]
    requests_rejected: prometheus::IntCounterVec,

    /// Execution time for each API request.
    #[metric(labels("method"), buckets(0.01, 0.05, 0.1, 0.5, 1, 2, 5, 10, 20, 40))]
    requests_duration_seconds: prometheus::HistogramVec,
}

impl ApiMetrics {
    // Status codes the handlers respond with.
    const INITIAL_STATUSES: &'static [StatusCode] = &[
        StatusCode::OK,
        StatusCode::CREATED,
        StatusCode::BAD_REQUEST,
        StatusCode::NOT_FOUND,
        StatusCode::CONFLICT,
        StatusCode::UNPROCESSABLE_ENTITY,
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::SERVICE_UNAVAILABLE,
    ];

    fn get() -> &'static Self {
        Self::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn reset_requests_rejected(&self) {
        for status in Self::INITIAL_STATUSES {
            self.requests_rejected
                .with_label_values(&[status.as_str()])
                .reset();
        }
    }

    fn on_request_completed(&self, method: &str, status: StatusCode, timer: Instant) {
        self.requests_complete
            .with_label_values(&[method, status.as_str()])
            .inc();
        self.requests_duration_seconds
            .with_label_values(&[method])
            .observe(timer.elapsed().as_secs_f64());
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub error_type: Cow<'static, str>,
    pub description: Cow<'static, str>,
    /// Additional arbitrary data that can be attached to an API error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub fn error(error_type: &'static str, description: impl AsRef<str>) -> Json<Error> {
    Json(Error {
        error_type: error_type.into(),
        description: Cow::Owned(description.as_ref().to_owned()),
        data: None,
    })
}

pub fn rich_error(
    error_type: &'static str,
    description: impl AsRef<str>,
    data: impl Serialize,
) -> Json<Error> {
    let data = match serde_json::to_value(&data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(?err, "failed to serialize error data");
            None
        }
    };

    Json(Error {
        error_type: error_type.into(),
        description: Cow::Owned(description.as_ref().to_owned()),
        data,
    })
}

fn invalid_rif_reply(reason: InvalidReason) -> Response {
    #[derive(Serialize)]
    struct Data {
        reason: &'static str,
    }

    (
        StatusCode::BAD_REQUEST,
        rich_error(
            "InvalidRif",
            reason.to_string(),
            Data {
                reason: reason.as_str(),
            },
        ),
    )
        .into_response()
}

fn registry_unreachable_reply(cause: UnavailableCause) -> Response {
    #[derive(Serialize)]
    struct Data {
        cause: UnavailableCause,
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        rich_error(
            "RegistryUnreachable",
            "the tax registry could not be reached, try again later",
            Data { cause },
        ),
    )
        .into_response()
}

/// Sets up basic metrics, cors and proper log tracing for all routes.
/// Takes a router with versioned routes and nests under /api, then applies
/// middleware.
fn finalize_router(api_router: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(vec![
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
            axum::http::Method::HEAD,
        ])
        .allow_headers(vec![
            axum::http::header::ORIGIN,
            axum::http::header::CONTENT_TYPE,
            // Must be lower case due to the HTTP-2 spec
            axum::http::HeaderName::from_static("x-request-id"),
        ]);

    let trace_layer = TraceLayer::new_for_http().make_span_with(observe::tracing::make_span);

    Router::new()
        .nest("/api", api_router)
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_PAYLOAD))
        .layer(cors)
        .layer(trace_layer)
}

#[cfg(test)]
async fn response_body(response: Response) -> serde_json::Value {
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
