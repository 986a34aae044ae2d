use {
    crate::api::AppState,
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    rif::ExistenceError,
    serde::Serialize,
    std::sync::Arc,
};

#[derive(Serialize)]
struct ExistenceResponse {
    exists: bool,
}

pub async fn get_existence_handler(
    State(state): State<Arc<AppState>>,
    Path(rif): Path<String>,
) -> Response {
    match state.validator.check_existence(&rif).await {
        Ok(exists) => (StatusCode::OK, Json(ExistenceResponse { exists })).into_response(),
        Err(ExistenceError::InvalidFormat(reason)) => super::invalid_rif_reply(reason),
        Err(ExistenceError::RegistryUnreachable(cause)) => {
            super::registry_unreachable_reply(cause)
        }
    }
}
